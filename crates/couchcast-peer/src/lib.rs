//! # couchcast-peer
//!
//! The host/client peer-connection orchestrator. Everything between "share
//! this code" and "frames and gamepad input are flowing": signaling client,
//! transport negotiation, adaptive quality, and the input pump.
//!
//! The actual media engine sits behind the [`transport::PeerTransport`]
//! seam; this crate drives it but never links one.
//!
//! - **`orchestrator`** – the per-session state machine and UI event/command
//!   channels.
//! - **`signaling`** – WebSocket client for the rendezvous server.
//! - **`transport`** – the peer-connection seam and its event stream.
//! - **`quality_loop`** – the 500 ms adaptive-bitrate sampling loop.
//! - **`input`** – gamepad packet pump with the drop-stale rule.
//! - **`sdp`** – bandwidth/codec directives applied to outgoing offers.
//! - **`code`** – session code generation.

pub mod code;
pub mod input;
pub mod orchestrator;
pub mod quality_loop;
pub mod sdp;
pub mod signaling;
pub mod transport;

pub use code::generate_session_code;
pub use input::{InputReceiver, InputSink, InputSinkError};
pub use orchestrator::{
    Command, IceServerSource, Orchestrator, OrchestratorConfig, OrchestratorError,
    OrchestratorHandle, PeerDeps, PeerRole, SessionState, UiEvent,
};
pub use quality_loop::QualityController;
pub use signaling::{SignalingClient, SignalingError};
pub use transport::{
    PeerTransport, TransportError, TransportEvent, TransportFactory, TransportStats,
};
