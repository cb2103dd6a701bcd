//! The ranked relay-server pool.
//!
//! Entries are mutated only by the health-check cycle; credential issuance
//! just reads the ranked view. Reconfiguring a server (or the whole pool)
//! resets its health state so stale probe results and cached credentials
//! never outlive a secret or URL rotation.

use std::time::Instant;

/// Operator-supplied configuration for one self-hosted relay server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServerConfig {
    /// Host:port, without a scheme — schemes are added per transport at
    /// endpoint-assembly time (`stun:`, `turn:`, `turns:`).
    pub url: String,
    /// Shared secret this relay verifies TURN REST credentials against.
    pub secret: String,
    /// Operator preference used as the final ranking tiebreak (lower first).
    pub priority: u32,
}

/// One pool entry: configuration plus the latest health verdict.
#[derive(Debug, Clone)]
pub struct RelayServerEntry {
    pub config: RelayServerConfig,
    pub healthy: bool,
    pub latency_ms: Option<f64>,
    pub last_checked_at: Option<Instant>,
}

impl RelayServerEntry {
    fn unchecked(config: RelayServerConfig) -> Self {
        Self {
            config,
            healthy: false,
            latency_ms: None,
            last_checked_at: None,
        }
    }
}

/// The process-scoped relay pool.
#[derive(Debug, Default)]
pub struct RelayPool {
    entries: Vec<RelayServerEntry>,
}

impl RelayPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts one server by URL. An updated entry drops back to unchecked
    /// so the next health cycle re-probes it with the new configuration.
    pub fn add_or_update(&mut self, config: RelayServerConfig) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.config.url == config.url)
        {
            Some(entry) => *entry = RelayServerEntry::unchecked(config),
            None => self.entries.push(RelayServerEntry::unchecked(config)),
        }
    }

    /// Replaces the pool wholesale. All health state is discarded.
    pub fn configure(&mut self, configs: Vec<RelayServerConfig>) {
        self.entries = configs
            .into_iter()
            .map(RelayServerEntry::unchecked)
            .collect();
    }

    /// Records a probe result for `url`, if the entry still exists.
    pub fn record_probe(&mut self, url: &str, healthy: bool, latency_ms: Option<f64>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.config.url == url) {
            entry.healthy = healthy;
            entry.latency_ms = latency_ms;
            entry.last_checked_at = Some(Instant::now());
        }
    }

    /// Re-sorts the pool: healthy first, then ascending latency, then the
    /// operator priority as a tiebreak.
    pub fn rank(&mut self) {
        self.entries.sort_by(|a, b| {
            b.healthy
                .cmp(&a.healthy)
                .then_with(|| {
                    let la = a.latency_ms.unwrap_or(f64::INFINITY);
                    let lb = b.latency_ms.unwrap_or(f64::INFINITY);
                    la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.config.priority.cmp(&b.config.priority))
        });
    }

    pub fn entries(&self) -> &[RelayServerEntry] {
        &self.entries
    }

    pub fn healthy(&self) -> impl Iterator<Item = &RelayServerEntry> {
        self.entries.iter().filter(|e| e.healthy)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every entry has been probed since the last (re)configure.
    pub fn all_checked(&self) -> bool {
        self.entries.iter().all(|e| e.last_checked_at.is_some())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
