//! # couchcast-relay
//!
//! Time-limited relay (TURN-style) credential issuance plus a multi-server,
//! health-ranked relay pool with public fallback.
//!
//! The peer orchestrator asks this crate one question — "which ICE servers
//! should the transport be seeded with right now?" — and gets back bootstrap
//! STUN entries plus, for every *healthy* self-hosted relay, a STUN entry and
//! three relay entries (UDP, TCP, TLS/TCP) carrying freshly signed
//! credentials. When no self-hosted relay is healthy the answer degrades to a
//! fixed public pool, so endpoint assembly never blocks on a dead relay.
//!
//! - **`credentials`** – the shared-secret TURN REST scheme
//!   (`username = "<expiry>:<user>"`, `credential = base64(HMAC-SHA1)`).
//! - **`pool`** – the ranked [`RelayServerEntry`] set.
//! - **`health`** – concurrent UDP STUN binding probes.
//! - **`service`** – the cached health cycle and [`RelayCredentialService`].

pub mod credentials;
pub mod health;
pub mod pool;
pub mod service;

pub use credentials::{generate_credentials, IceServer, RelayCredentials};
pub use pool::{RelayPool, RelayServerConfig, RelayServerEntry};
pub use service::{public_fallback, RelayCredentialService, RelayServiceConfig};
