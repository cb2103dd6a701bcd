//! The transport seam.
//!
//! [`PeerTransport`] abstracts the actual peer connection (ICE, DTLS, media
//! encoding) behind an async trait so the orchestrator's state machine can be
//! exercised against mocks. A production implementation wraps a WebRTC
//! engine; nothing in this crate links one.
//!
//! Conventions the implementation must honor:
//!
//! - Local video is tagged [`VideoContentHint::Motion`] — smoothness over
//!   sharpness for game content.
//! - Audio is attached only when capture actually produced a track.
//! - The input channel is pre-negotiated on both sides with the fixed
//!   settings in [`input_channel_config`], so it never shows up in SDP
//!   negotiation.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("media attach failed: {0}")]
    Media(String),
    #[error("data channel error: {0}")]
    DataChannel(String),
    #[error("transport is closed")]
    Closed,
}

/// Encoder hint attached to the outgoing video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoContentHint {
    /// Favor frame rate; the content is constantly moving.
    Motion,
    /// Favor per-frame fidelity.
    Detail,
}

/// What to attach when the host brings up local media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConfig {
    pub video_hint: VideoContentHint,
    /// Attach the audio track. False when capture produced none.
    pub capture_audio: bool,
}

impl MediaConfig {
    pub fn video_only() -> Self {
        Self {
            video_hint: VideoContentHint::Motion,
            capture_audio: false,
        }
    }

    pub fn with_audio() -> Self {
        Self {
            video_hint: VideoContentHint::Motion,
            capture_audio: true,
        }
    }
}

/// Channel priority, mirroring the four RTCPriorityType levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPriority {
    VeryLow,
    Low,
    Medium,
    High,
}

/// Settings for a pre-negotiated data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChannelConfig {
    /// Fixed stream id; both sides must agree since the channel is never
    /// announced in-band.
    pub id: u16,
    pub ordered: bool,
    pub max_retransmits: u16,
    pub priority: ChannelPriority,
}

/// The input channel: lossy and latest-wins.
///
/// Zero retransmits and no ordering — a late gamepad packet is worthless,
/// the next poll supersedes it.
pub fn input_channel_config() -> DataChannelConfig {
    DataChannelConfig {
        id: 0,
        ordered: false,
        max_retransmits: 0,
        priority: ChannelPriority::High,
    }
}

/// Raw counters read from the transport each sampling tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransportStats {
    /// Round-trip time, milliseconds.
    pub rtt_ms: f64,
    /// Cumulative packets lost since the connection started.
    pub packets_lost: u64,
    /// Cumulative packets received since the connection started.
    pub packets_received: u64,
    /// Inter-arrival jitter, seconds (the unit the stats API reports).
    pub jitter_s: f64,
    /// Whether an audio track is flowing.
    pub has_audio: bool,
}

/// Asynchronous notifications from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// ICE reached connected; media can flow.
    Connected,
    /// ICE dropped; may recover on its own or via restart.
    Disconnected,
    /// ICE failed permanently. Terminal for this pairing.
    Failed,
    /// A local candidate to trickle to the remote peer.
    LocalCandidate(serde_json::Value),
    /// The remote media stream arrived (client side).
    StreamReceived,
    /// The pre-negotiated input channel opened.
    InputChannelOpen,
    /// A packet arrived on the input channel (host side).
    InputChannelMessage(Vec<u8>),
}

/// The peer-connection seam the orchestrator drives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates a local offer. `ice_restart` forces fresh ICE credentials for
    /// recovery renegotiation.
    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError>;

    /// Creates a local answer to a previously applied remote offer.
    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), TransportError>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), TransportError>;

    async fn add_remote_candidate(
        &self,
        candidate: serde_json::Value,
    ) -> Result<(), TransportError>;

    /// Attaches local capture tracks (host side).
    async fn attach_media(&self, config: MediaConfig) -> Result<(), TransportError>;

    /// Opens the pre-negotiated input channel with [`input_channel_config`].
    async fn open_input_channel(&self) -> Result<(), TransportError>;

    /// Sends one packet on the input channel (client side).
    async fn send_input(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Closes the input channel. Must be idempotent.
    async fn close_input_channel(&self) -> Result<(), TransportError>;

    /// Releases local capture tracks. Must be idempotent.
    async fn stop_media(&self) -> Result<(), TransportError>;

    async fn stats(&self) -> Result<TransportStats, TransportError>;

    /// Applies an encoder bitrate cap, bits per second.
    async fn set_video_bitrate(&self, bitrate: u32) -> Result<(), TransportError>;

    /// Releases the connection. Must be idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds transports seeded with an ICE server set.
///
/// A factory rather than a constructor so each (re)connection gets a fresh
/// transport and a fresh event stream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: Vec<couchcast_relay::IceServer>,
    ) -> Result<
        (
            std::sync::Arc<dyn PeerTransport>,
            mpsc::UnboundedReceiver<TransportEvent>,
        ),
        TransportError,
    >;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
