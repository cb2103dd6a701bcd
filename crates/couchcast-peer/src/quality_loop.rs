//! The adaptive-quality sampling loop.
//!
//! Every 500 ms the controller reads transport stats, derives a
//! [`QualitySample`], feeds the rolling windows, and — once they are full —
//! lets the core [`BitratePolicy`] decide whether to move the encoder
//! bitrate. Ticks run to completion before the next is scheduled, so a slow
//! `stats()` call stretches the cadence instead of stacking ticks.
//!
//! Encoder application failures are logged and skipped; the previous bitrate
//! simply stays in effect until a later tick succeeds. Disabling adaptive
//! mode resets the encoder to the original target immediately.
//!
//! The viewer side runs the same loop in observe-only mode: samples and
//! snapshots flow, but the encoder (which lives on the other peer) is never
//! touched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use couchcast_core::quality::{BitratePolicy, ConnectionQuality, QualitySample, QualityWindow};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::{PeerTransport, TransportStats};

/// Sampling cadence.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Derives one sample from consecutive stats readings.
///
/// Latency is the RTT halved (one-way estimate); loss is the lost/received
/// delta ratio over the interval, not the lifetime counters; jitter converts
/// from the stats API's seconds to milliseconds.
pub fn sample_between(prev: &TransportStats, current: &TransportStats) -> QualitySample {
    let lost_delta = current.packets_lost.saturating_sub(prev.packets_lost) as f64;
    let received_delta = current
        .packets_received
        .saturating_sub(prev.packets_received) as f64;
    let total = lost_delta + received_delta;
    let packet_loss_pct = if total > 0.0 {
        lost_delta / total * 100.0
    } else {
        0.0
    };

    QualitySample {
        latency_ms: current.rtt_ms / 2.0,
        packet_loss_pct,
        jitter_ms: current.jitter_s * 1000.0,
    }
}

/// Handle to a running controller.
pub struct QualityController {
    running: Arc<AtomicBool>,
    adaptive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl QualityController {
    /// Starts sampling against `transport`. Quality snapshots are published
    /// on the returned watch channel. With `drives_encoder` false the loop
    /// only observes: no bitrate is ever applied.
    pub fn spawn(
        transport: Arc<dyn PeerTransport>,
        target_bitrate: u32,
        drives_encoder: bool,
    ) -> (Self, watch::Receiver<ConnectionQuality>) {
        let (quality_tx, quality_rx) = watch::channel(ConnectionQuality::initial(target_bitrate));
        let running = Arc::new(AtomicBool::new(true));
        let adaptive = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(run_loop(
            transport,
            BitratePolicy::new(target_bitrate),
            quality_tx,
            Arc::clone(&running),
            Arc::clone(&adaptive),
            drives_encoder,
        ));

        (
            Self {
                running,
                adaptive,
                task,
            },
            quality_rx,
        )
    }

    /// Enables or disables adaptation. Disabling resets the encoder to the
    /// original target bitrate on the next tick.
    pub fn set_adaptive(&self, enabled: bool) {
        self.adaptive.store(enabled, Ordering::Relaxed);
    }

    /// Stops the loop. Idempotent; safe to call after the task ended.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.task.abort();
    }
}

async fn run_loop(
    transport: Arc<dyn PeerTransport>,
    policy: BitratePolicy,
    quality_tx: watch::Sender<ConnectionQuality>,
    running: Arc<AtomicBool>,
    adaptive: Arc<AtomicBool>,
    drives_encoder: bool,
) {
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut window = QualityWindow::new();
    let mut prev_stats: Option<TransportStats> = None;
    let mut current_bitrate = policy.target_bitrate;
    let mut last_adjust: Option<Instant> = None;
    let mut was_adaptive = true;

    while running.load(Ordering::Relaxed) {
        interval.tick().await;

        let stats = match transport.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                debug!("stats read failed, skipping tick: {e}");
                continue;
            }
        };

        if drives_encoder {
            let is_adaptive = adaptive.load(Ordering::Relaxed);
            if !is_adaptive {
                if was_adaptive {
                    // Leaving adaptive mode: snap back to the configured target.
                    match transport.set_video_bitrate(policy.target_bitrate).await {
                        Ok(()) => current_bitrate = policy.target_bitrate,
                        Err(e) => warn!("bitrate reset failed: {e}"),
                    }
                    window.clear();
                    last_adjust = None;
                }
                was_adaptive = false;
                prev_stats = Some(stats);
                continue;
            }
            was_adaptive = true;
        }

        let Some(prev) = prev_stats.replace(stats) else {
            // First reading only establishes the counter baseline.
            continue;
        };
        let sample = sample_between(&prev, &stats);
        window.push(sample);

        let Some(level) = window.assess() else {
            continue;
        };

        if drives_encoder {
            if let Some(new_bitrate) =
                policy.evaluate(current_bitrate, level, last_adjust.map(|at| at.elapsed()))
            {
                match transport.set_video_bitrate(new_bitrate).await {
                    Ok(()) => {
                        debug!("bitrate adjusted {current_bitrate} -> {new_bitrate} ({level:?})");
                        current_bitrate = new_bitrate;
                        last_adjust = Some(Instant::now());
                    }
                    // Non-fatal: the previous bitrate stays in effect.
                    Err(e) => warn!("bitrate apply failed, keeping {current_bitrate}: {e}"),
                }
            }
        }

        let _ = quality_tx.send(ConnectionQuality {
            latency_ms: sample.latency_ms,
            packet_loss_pct: sample.packet_loss_pct,
            jitter_ms: sample.jitter_ms,
            has_audio: stats.has_audio,
            network_quality: level,
            current_bitrate,
            target_bitrate: policy.target_bitrate,
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
