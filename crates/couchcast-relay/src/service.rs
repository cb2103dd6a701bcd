//! The relay credential service: cached health cycle + endpoint assembly.
//!
//! Owns the [`RelayPool`] (the only writer, per the single-owner rule for
//! shared registries) and exposes the `ice_servers()` consumer interface the
//! peer orchestrator seeds its transport with.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{generate_credentials, IceServer};
use crate::health::probe_all;
use crate::pool::{RelayPool, RelayServerConfig};

/// Tuning knobs for the service.
#[derive(Debug, Clone)]
pub struct RelayServiceConfig {
    /// Lifetime of issued credentials.
    pub credential_ttl: Duration,
    /// Per-probe reply deadline.
    pub probe_timeout: Duration,
    /// Minimum spacing between health cycles; results are cached between.
    pub check_interval: Duration,
    /// Always-included STUN bootstrap entries.
    pub bootstrap_stun: Vec<String>,
}

impl Default for RelayServiceConfig {
    fn default() -> Self {
        Self {
            credential_ttl: Duration::from_secs(24 * 60 * 60),
            probe_timeout: Duration::from_millis(1500),
            check_interval: Duration::from_secs(60),
            bootstrap_stun: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

/// The public relay pool appended when no self-hosted server is healthy.
///
/// Also what a peer falls back to when the credential service is
/// unreachable entirely.
pub fn public_fallback() -> Vec<IceServer> {
    let user = "openrelayproject";
    [
        "turn:openrelay.metered.ca:80",
        "turn:openrelay.metered.ca:443",
        "turns:openrelay.metered.ca:443?transport=tcp",
    ]
    .into_iter()
    .map(|url| IceServer {
        urls: vec![url.to_string()],
        username: Some(user.to_string()),
        credential: Some(user.to_string()),
    })
    .collect()
}

struct ServiceState {
    pool: RelayPool,
    last_check: Option<Instant>,
}

/// Issues short-lived relay credentials backed by a health-ranked pool.
pub struct RelayCredentialService {
    config: RelayServiceConfig,
    state: Mutex<ServiceState>,
}

impl RelayCredentialService {
    pub fn new(config: RelayServiceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ServiceState {
                pool: RelayPool::new(),
                last_check: None,
            }),
        }
    }

    /// Upserts one relay server. Invalidates the cached health cycle so the
    /// next `ice_servers()` call re-probes.
    pub async fn add_or_update(&self, server: RelayServerConfig) {
        let mut state = self.state.lock().await;
        state.pool.add_or_update(server);
        state.last_check = None;
    }

    /// Replaces the pool wholesale. Invalidates all cached state.
    pub async fn configure(&self, servers: Vec<RelayServerConfig>) {
        let mut state = self.state.lock().await;
        state.pool.configure(servers);
        state.last_check = None;
    }

    /// Runs a health cycle now, regardless of the cache.
    pub async fn check_health_now(&self) {
        self.run_health_cycle(true).await;
    }

    /// Assembles the ICE server list for `user_id`:
    ///
    /// bootstrap STUN entries, then for each *healthy* relay one STUN entry
    /// and three relay entries (UDP, TCP, TLS/TCP) with freshly signed
    /// credentials; if no self-hosted relay is healthy, the fixed public
    /// pool is appended instead.
    pub async fn ice_servers(&self, user_id: &str) -> Vec<IceServer> {
        self.run_health_cycle(false).await;

        let state = self.state.lock().await;
        let mut servers: Vec<IceServer> = self
            .config
            .bootstrap_stun
            .iter()
            .map(IceServer::stun)
            .collect();

        let mut any_healthy = false;
        for entry in state.pool.healthy() {
            any_healthy = true;
            let host = &entry.config.url;
            let creds = generate_credentials(&entry.config.secret, user_id, self.config.credential_ttl);
            servers.push(IceServer::stun(format!("stun:{host}")));
            servers.push(IceServer::relay(format!("turn:{host}?transport=udp"), &creds));
            servers.push(IceServer::relay(format!("turn:{host}?transport=tcp"), &creds));
            servers.push(IceServer::relay(format!("turns:{host}?transport=tcp"), &creds));
        }

        if !any_healthy {
            if !state.pool.is_empty() {
                warn!("no self-hosted relay is healthy; degrading to the public pool");
            }
            servers.extend(public_fallback());
        }

        servers
    }

    /// Probes the pool if forced or the cached cycle has gone stale.
    async fn run_health_cycle(&self, force: bool) {
        let urls = {
            let state = self.state.lock().await;
            if state.pool.is_empty() {
                return;
            }
            let fresh = state
                .last_check
                .map(|at| at.elapsed() < self.config.check_interval)
                .unwrap_or(false);
            if fresh && !force {
                debug!("health cycle cached; skipping probes");
                return;
            }
            state
                .pool
                .entries()
                .iter()
                .map(|e| e.config.url.clone())
                .collect::<Vec<_>>()
        };

        // Probes run without holding the lock; only the results take it.
        let outcomes = probe_all(urls, self.config.probe_timeout).await;

        let mut state = self.state.lock().await;
        for outcome in &outcomes {
            state
                .pool
                .record_probe(&outcome.url, outcome.healthy, outcome.latency_ms);
        }
        state.pool.rank();
        state.last_check = Some(Instant::now());

        let healthy = state.pool.healthy().count();
        info!(
            "relay health cycle complete: {healthy}/{} healthy",
            state.pool.entries().len()
        );
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    fn test_config() -> RelayServiceConfig {
        RelayServiceConfig {
            probe_timeout: Duration::from_millis(250),
            ..RelayServiceConfig::default()
        }
    }

    /// One-shot UDP responder standing in for a live relay's STUN listener.
    async fn spawn_live_relay() -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..len], src).await;
            }
        });
        addr.to_string()
    }

    /// A bound socket that never answers.
    async fn spawn_dead_relay() -> (UdpSocket, String) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        (socket, addr)
    }

    fn server(url: &str, secret: &str, priority: u32) -> RelayServerConfig {
        RelayServerConfig {
            url: url.to_string(),
            secret: secret.to_string(),
            priority,
        }
    }

    #[tokio::test]
    async fn test_empty_pool_yields_bootstrap_plus_public_fallback() {
        let svc = RelayCredentialService::new(test_config());
        let servers = svc.ice_servers("u1").await;

        let stun_count = servers.iter().filter(|s| s.username.is_none()).count();
        assert_eq!(stun_count, 2, "both bootstrap STUN entries present");
        assert!(
            servers
                .iter()
                .any(|s| s.username.as_deref() == Some("openrelayproject")),
            "public fallback must be appended"
        );
    }

    #[tokio::test]
    async fn test_failover_keeps_only_surviving_server() {
        let live = spawn_live_relay().await;
        let (_guard, dead) = spawn_dead_relay().await;

        let svc = RelayCredentialService::new(test_config());
        svc.configure(vec![server(&live, "live-secret", 0), server(&dead, "dead-secret", 1)])
            .await;

        let servers = svc.ice_servers("u1").await;

        assert!(
            servers.iter().any(|s| s.urls[0] == format!("stun:{live}")),
            "survivor's STUN entry present"
        );
        assert_eq!(
            servers
                .iter()
                .filter(|s| s.urls[0].contains(&live) && s.credential.is_some())
                .count(),
            3,
            "survivor contributes UDP, TCP, and TLS relay entries"
        );
        assert!(
            !servers.iter().any(|s| s.urls[0].contains(&dead)),
            "dead server contributes nothing"
        );
        assert!(
            !servers
                .iter()
                .any(|s| s.username.as_deref() == Some("openrelayproject")),
            "public fallback must not appear while a self-hosted relay survives"
        );
    }

    #[tokio::test]
    async fn test_total_pool_failure_degrades_to_public_fallback() {
        let (_guard, dead) = spawn_dead_relay().await;
        let svc = RelayCredentialService::new(test_config());
        svc.configure(vec![server(&dead, "secret", 0)]).await;

        let servers = svc.ice_servers("u1").await;
        assert!(servers
            .iter()
            .any(|s| s.username.as_deref() == Some("openrelayproject")));
    }

    #[tokio::test]
    async fn test_healthy_relay_entries_carry_signed_credentials() {
        let live = spawn_live_relay().await;
        let svc = RelayCredentialService::new(test_config());
        svc.configure(vec![server(&live, "secret", 0)]).await;

        let servers = svc.ice_servers("host-1").await;
        let relay = servers
            .iter()
            .find(|s| s.urls[0].starts_with("turn:"))
            .expect("relay entry present");
        let username = relay.username.as_ref().unwrap();
        assert!(
            username.ends_with(":host-1"),
            "username is <expiry>:<userId>, got {username}"
        );
        assert!(relay.credential.is_some());
    }

    #[tokio::test]
    async fn test_reconfigure_invalidates_cached_health() {
        let live = spawn_live_relay().await;
        let svc = RelayCredentialService::new(test_config());
        svc.configure(vec![server(&live, "secret", 0)]).await;
        let _ = svc.ice_servers("u1").await;

        // Replace the pool with a dead server; the cache must not keep
        // serving the old healthy view.
        let (_guard, dead) = spawn_dead_relay().await;
        svc.configure(vec![server(&dead, "secret", 0)]).await;

        let servers = svc.ice_servers("u1").await;
        assert!(
            !servers.iter().any(|s| s.urls[0].contains(&live)),
            "rotated-out server must disappear immediately"
        );
    }

    #[tokio::test]
    async fn test_health_cycle_is_cached_between_calls() {
        let live = spawn_live_relay().await;
        let svc = RelayCredentialService::new(test_config());
        svc.configure(vec![server(&live, "secret", 0)]).await;

        let first = svc.ice_servers("u1").await;
        // Second call inside check_interval reuses the cached verdicts.
        let second = svc.ice_servers("u1").await;
        assert_eq!(
            first.iter().filter(|s| s.credential.is_some()).count(),
            second.iter().filter(|s| s.credential.is_some()).count()
        );
    }
}
