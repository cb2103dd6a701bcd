//! Connection-quality model: rolling metric windows, 0–9 scoring, and the
//! bitrate policy.
//!
//! Everything here is pure — no timers, no transport. The sampling cadence
//! and the actual encoder-parameter application live in the peer crate; this
//! module only answers two questions:
//!
//! 1. Given the recent latency/loss/jitter samples, what quality level is
//!    the connection at?
//! 2. Given that level, should the outbound bitrate change, and to what?
//!
//! The anti-oscillation pairing lives in [`BitratePolicy::evaluate`]: a
//! change is applied only when it clears a minimum delta (noise floor) *and*
//! a cooldown has elapsed since the last adjustment. Either guard alone
//! oscillates under noisy samples; together they hold a steady rate.

use std::collections::VecDeque;
use std::time::Duration;

/// How many samples each metric window holds before a verdict is allowed.
pub const WINDOW_SIZE: usize = 6;

/// Default interval between adjustments once one has been applied.
pub const ADJUST_COOLDOWN: Duration = Duration::from_secs(3);

/// Minimum relative change (fraction of the target bitrate) worth applying.
pub const MIN_DELTA_FRACTION: f64 = 0.05;

/// Ascending per-metric thresholds: (good, fair, poor).
const LATENCY_THRESHOLDS_MS: (f64, f64, f64) = (50.0, 100.0, 200.0);
const LOSS_THRESHOLDS_PCT: (f64, f64, f64) = (0.5, 2.0, 5.0);
const JITTER_THRESHOLDS_MS: (f64, f64, f64) = (10.0, 30.0, 60.0);

/// Five-level bucket of the summed metric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl NetworkQuality {
    /// Bitrate multiplier for this level; monotonically decreasing.
    pub fn bitrate_multiplier(self) -> f64 {
        match self {
            NetworkQuality::Excellent => 1.0,
            NetworkQuality::Good => 0.85,
            NetworkQuality::Fair => 0.6,
            NetworkQuality::Poor => 0.35,
            NetworkQuality::Critical => 0.2,
        }
    }

    /// Buckets a summed 0–9 score into a level.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=1 => NetworkQuality::Excellent,
            2..=3 => NetworkQuality::Good,
            4..=5 => NetworkQuality::Fair,
            6..=7 => NetworkQuality::Poor,
            _ => NetworkQuality::Critical,
        }
    }
}

/// One measurement tick: one-way latency, loss ratio, jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    /// Estimated one-way latency (RTT halved), milliseconds.
    pub latency_ms: f64,
    /// Packet loss over the sampling interval, percent.
    pub packet_loss_pct: f64,
    /// Inter-arrival jitter, milliseconds.
    pub jitter_ms: f64,
}

/// Snapshot published for UI/telemetry consumers.
///
/// Mutated only by the quality controller; everyone else reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionQuality {
    pub latency_ms: f64,
    pub packet_loss_pct: f64,
    pub jitter_ms: f64,
    pub has_audio: bool,
    pub network_quality: NetworkQuality,
    pub current_bitrate: u32,
    pub target_bitrate: u32,
}

impl ConnectionQuality {
    /// The optimistic pre-sampling snapshot for a fresh connection.
    pub fn initial(target_bitrate: u32) -> Self {
        Self {
            latency_ms: 0.0,
            packet_loss_pct: 0.0,
            jitter_ms: 0.0,
            has_audio: false,
            network_quality: NetworkQuality::Excellent,
            current_bitrate: target_bitrate,
            target_bitrate,
        }
    }
}

/// Fixed-size rolling windows, one per metric.
///
/// No verdict is produced until every window is full; a half-warm window
/// scores artificially well and would trigger a premature adjustment.
#[derive(Debug, Default)]
pub struct QualityWindow {
    latency: VecDeque<f64>,
    loss: VecDeque<f64>,
    jitter: VecDeque<f64>,
}

impl QualityWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes one sample, evicting the oldest once the window is full.
    pub fn push(&mut self, sample: QualitySample) {
        push_capped(&mut self.latency, sample.latency_ms);
        push_capped(&mut self.loss, sample.packet_loss_pct);
        push_capped(&mut self.jitter, sample.jitter_ms);
    }

    pub fn is_full(&self) -> bool {
        self.latency.len() == WINDOW_SIZE
    }

    /// Windowed means, or `None` until the window is full.
    pub fn averages(&self) -> Option<QualitySample> {
        if !self.is_full() {
            return None;
        }
        Some(QualitySample {
            latency_ms: mean(&self.latency),
            packet_loss_pct: mean(&self.loss),
            jitter_ms: mean(&self.jitter),
        })
    }

    /// Scores the windowed averages, or `None` until the window is full.
    pub fn assess(&self) -> Option<NetworkQuality> {
        self.averages()
            .map(|avg| NetworkQuality::from_score(score(&avg)))
    }

    pub fn clear(&mut self) {
        self.latency.clear();
        self.loss.clear();
        self.jitter.clear();
    }
}

fn push_capped(window: &mut VecDeque<f64>, value: f64) {
    if window.len() == WINDOW_SIZE {
        window.pop_front();
    }
    window.push_back(value);
}

fn mean(window: &VecDeque<f64>) -> f64 {
    window.iter().sum::<f64>() / window.len() as f64
}

/// Sums the per-metric scores into the 0–9 total.
pub fn score(sample: &QualitySample) -> u8 {
    score_metric(sample.latency_ms, LATENCY_THRESHOLDS_MS)
        + score_metric(sample.packet_loss_pct, LOSS_THRESHOLDS_PCT)
        + score_metric(sample.jitter_ms, JITTER_THRESHOLDS_MS)
}

/// 0–3 points against three ascending thresholds; higher is worse.
fn score_metric(value: f64, (good, fair, poor): (f64, f64, f64)) -> u8 {
    if value <= good {
        0
    } else if value <= fair {
        1
    } else if value <= poor {
        2
    } else {
        3
    }
}

/// Decides whether, and to what, the outbound bitrate should change.
#[derive(Debug, Clone)]
pub struct BitratePolicy {
    /// The configured ceiling the multipliers scale from.
    pub target_bitrate: u32,
    /// Fraction of `target_bitrate` a change must exceed to be applied.
    pub min_delta_fraction: f64,
    /// Minimum spacing between applied adjustments.
    pub cooldown: Duration,
}

impl BitratePolicy {
    pub fn new(target_bitrate: u32) -> Self {
        Self {
            target_bitrate,
            min_delta_fraction: MIN_DELTA_FRACTION,
            cooldown: ADJUST_COOLDOWN,
        }
    }

    /// The ideal bitrate for a quality level, before any damping.
    pub fn bitrate_for(&self, level: NetworkQuality) -> u32 {
        (self.target_bitrate as f64 * level.bitrate_multiplier()).round() as u32
    }

    /// Returns `Some(new_bitrate)` when an adjustment should be applied.
    ///
    /// `since_last_adjust` is the time elapsed since the previous applied
    /// change (`None` when nothing has been applied yet, which waives the
    /// cooldown for the first adjustment).
    pub fn evaluate(
        &self,
        current_bitrate: u32,
        level: NetworkQuality,
        since_last_adjust: Option<Duration>,
    ) -> Option<u32> {
        let desired = self.bitrate_for(level);
        let delta = desired.abs_diff(current_bitrate) as f64;
        let noise_floor = self.target_bitrate as f64 * self.min_delta_fraction;
        if delta <= noise_floor {
            return None;
        }
        if let Some(elapsed) = since_last_adjust {
            if elapsed < self.cooldown {
                return None;
            }
        }
        Some(desired)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
