//! UDP health probes for relay servers.
//!
//! A probe is one minimal STUN binding request; *any* reply within the
//! timeout counts as alive. The goal is reachability plus a latency number,
//! not STUN conformance — the relay's STUN listener answers bindings anyway,
//! and parsing the response would not change the verdict.
//!
//! One probe is issued per pool entry, all concurrently, and the caller
//! gathers every result before re-ranking the pool. A probe failure only
//! marks that entry unhealthy; it never delays endpoint assembly.

use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::debug;

/// STUN binding request method/type.
const BINDING_REQUEST: u16 = 0x0001;
/// Fixed magic cookie every RFC5389 message carries.
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Builds a 20-byte STUN binding request with a random transaction id.
pub fn binding_request() -> [u8; 20] {
    let mut msg = [0u8; 20];
    msg[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // message length: 0 (no attributes)
    msg[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    rand::rngs::OsRng.fill_bytes(&mut msg[8..20]);
    msg
}

/// Result of probing one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub url: String,
    pub healthy: bool,
    pub latency_ms: Option<f64>,
}

/// Probes one `host:port` relay address and waits up to `probe_timeout` for
/// any reply.
pub async fn probe(url: &str, probe_timeout: Duration) -> ProbeOutcome {
    let outcome = probe_inner(url, probe_timeout).await;
    match outcome {
        Some(latency_ms) => ProbeOutcome {
            url: url.to_string(),
            healthy: true,
            latency_ms: Some(latency_ms),
        },
        None => ProbeOutcome {
            url: url.to_string(),
            healthy: false,
            latency_ms: None,
        },
    }
}

async fn probe_inner(url: &str, probe_timeout: Duration) -> Option<f64> {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            debug!("probe socket bind failed: {e}");
            return None;
        }
    };

    let request = binding_request();
    let started = Instant::now();
    if let Err(e) = socket.send_to(&request, url).await {
        debug!("probe send to {url} failed: {e}");
        return None;
    }

    let mut buf = [0u8; 256];
    match timeout(probe_timeout, socket.recv_from(&mut buf)).await {
        Ok(Ok((_, _))) => Some(started.elapsed().as_secs_f64() * 1000.0),
        Ok(Err(e)) => {
            debug!("probe recv from {url} failed: {e}");
            None
        }
        Err(_) => {
            debug!("probe to {url} timed out after {probe_timeout:?}");
            None
        }
    }
}

/// Probes every URL concurrently and gathers all outcomes.
///
/// This is a join point, not a serial scan: total wall time is bounded by
/// the single probe timeout regardless of pool size.
pub async fn probe_all(urls: Vec<String>, probe_timeout: Duration) -> Vec<ProbeOutcome> {
    let mut set = JoinSet::new();
    for url in urls {
        set.spawn(async move { probe(&url, probe_timeout).await });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => debug!("probe task failed to join: {e}"),
        }
    }
    outcomes
}

// ── Tests ─────────────────────────────────────────────────────────────────────
