//! # couchcast-core
//!
//! Shared library for Couchcast containing the signaling message types, the
//! hand-rolled WebSocket frame codec, the binary controller-input codec, and
//! the connection-quality model.
//!
//! This crate is used by the signaling server, the relay credential service,
//! and both peer roles. It has zero dependencies on sockets, timers, or OS
//! APIs: everything here is a pure function or a plain data type, which is
//! what makes the protocol layer unit-testable without a network harness.
//!
//! - **`protocol`** – The signaling wire: JSON message types exchanged between
//!   peers and the signaling server, and the RFC6455 frame codec those JSON
//!   payloads travel inside. The framing is implemented directly on byte
//!   slices rather than via a WebSocket library.
//!
//! - **`input`** – The fixed 24-byte gamepad packet sent over the unreliable
//!   input data channel, plus button bitmask constants.
//!
//! - **`quality`** – Rolling-window scoring of latency/loss/jitter samples and
//!   the bitrate policy derived from the resulting quality level.

pub mod input;
pub mod protocol;
pub mod quality;

pub use input::codec::{decode_input, encode_input, GamepadInputState, InputCodecError, PACKET_SIZE};
pub use protocol::frame::{accept_key, decode_frame, encode_frame, FrameDecode, Opcode, RejectReason};
pub use protocol::messages::{ClientMessage, ServerMessage};
pub use quality::{BitratePolicy, ConnectionQuality, NetworkQuality, QualitySample, QualityWindow};
