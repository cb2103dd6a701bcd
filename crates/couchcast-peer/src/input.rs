//! The gamepad input pump.
//!
//! Client side: encode every polled state and fire it down the lossy data
//! channel. Host side: decode and apply — but only packets newer than the
//! last one applied. The channel is unordered and unreliable on purpose, so
//! stale packets can and do arrive late; replaying one would roll the
//! virtual controller backwards mid-press.

use couchcast_core::input::{decode_input, encode_input, GamepadInputState};
use thiserror::Error;
use tracing::{debug, warn};

use crate::transport::{PeerTransport, TransportError};

#[derive(Debug, Error)]
pub enum InputSinkError {
    #[error("virtual controller rejected the state: {0}")]
    Apply(String),
    #[error("virtual controller is not connected")]
    NotConnected,
}

/// The virtual-controller collaborator the host feeds decoded states into.
#[cfg_attr(test, mockall::automock)]
pub trait InputSink: Send {
    fn apply(&mut self, state: &GamepadInputState) -> Result<(), InputSinkError>;
}

impl InputSink for Box<dyn InputSink> {
    fn apply(&mut self, state: &GamepadInputState) -> Result<(), InputSinkError> {
        (**self).apply(state)
    }
}

/// Host-side receiver enforcing the drop-stale rule.
pub struct InputReceiver<S: InputSink> {
    sink: S,
    last_applied_ms: Option<u64>,
}

impl<S: InputSink> InputReceiver<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            last_applied_ms: None,
        }
    }

    /// Decodes one channel packet and applies it unless it is stale.
    ///
    /// Returns the applied state, or `None` when the packet was dropped
    /// (malformed, stale, or refused by the sink).
    pub fn handle_packet(&mut self, payload: &[u8]) -> Option<GamepadInputState> {
        let state = match decode_input(payload) {
            Ok(state) => state,
            Err(e) => {
                warn!("undecodable input packet dropped: {e}");
                return None;
            }
        };

        // timestamp_ms <= last applied ⇒ the packet is stale.
        if let Some(last) = self.last_applied_ms {
            if state.timestamp_ms <= last {
                debug!(
                    "stale input packet dropped ({} <= {last})",
                    state.timestamp_ms
                );
                return None;
            }
        }

        match self.sink.apply(&state) {
            Ok(()) => {
                self.last_applied_ms = Some(state.timestamp_ms);
                Some(state)
            }
            Err(e) => {
                warn!("input sink refused state: {e}");
                None
            }
        }
    }

    pub fn last_applied_ms(&self) -> Option<u64> {
        self.last_applied_ms
    }
}

/// Client side: encodes and sends one polled state.
pub async fn send_state(
    transport: &dyn PeerTransport,
    state: &GamepadInputState,
) -> Result<(), TransportError> {
    transport.send_input(&encode_input(state)).await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
