//! # couchcast-signal
//!
//! The always-on signaling service. Peers connect over hand-rolled
//! WebSocket framing (see `couchcast_core::protocol::frame`), register or
//! join sessions by code, and have their negotiation payloads routed to each
//! other. The service holds no media and no input — it only brokers the
//! rendezvous.
//!
//! - **`registry`** – the session registry and routing logic, pure and
//!   socket-free.
//! - **`server`** – the TCP accept loop, handshake, per-connection framing,
//!   and the HTTP status endpoint.
//! - **`config`** – runtime settings with TOML loading.

pub mod config;
pub mod registry;
pub mod server;

pub use config::SignalConfig;
pub use registry::{ConnectionId, SessionRegistry};
pub use server::{run_server, SignalServer};
