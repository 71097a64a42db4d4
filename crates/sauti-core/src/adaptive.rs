//! Self-tuning buffer control driven by live playback telemetry.
//!
//! The controller runs as a periodic loop, never per chunk: it trades
//! latency against stability by growing the target buffer after a window
//! with underruns and shrinking it once playback has been clean but
//! time-to-first-audio sits above target. Changes are clamped to the
//! configured bounds and rate-limited to one adjustment per window so the
//! loop cannot oscillate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::audio::AudioFormat;

/// Buffering parameters read by the producer and daemon.
///
/// Recomputed by the controller and replaced wholesale (via a `watch`
/// channel at the call site), never mutated in place, so concurrent
/// readers cannot observe a partial update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Target playback depth the ring should hold.
    pub target_buffer_ms: u32,
    /// Ring capacity sized for the target depth.
    pub buffer_size_bytes: usize,
    /// Producer slice size.
    pub chunk_size_bytes: usize,
    /// Chunks per second implied by the chunk duration.
    pub delivery_rate_hz: f64,
}

impl BufferConfig {
    /// Derive a config for a target depth at the given chunk duration.
    pub fn for_target(target_buffer_ms: u32, chunk_ms: u32, format: AudioFormat) -> Self {
        let chunk_size_bytes = format.bytes_for_ms(chunk_ms).max(2);
        Self {
            target_buffer_ms,
            buffer_size_bytes: format.bytes_for_ms(target_buffer_ms).max(chunk_size_bytes),
            chunk_size_bytes,
            delivery_rate_hz: 1000.0 / chunk_ms as f64,
        }
    }
}

/// Telemetry fed into the control loop, per session or sampled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackMetrics {
    pub time_to_first_audio_ms: f64,
    /// Cumulative underruns observed so far.
    pub underrun_count: u64,
    /// Fraction of wall time the sink was fed, in [0, 1].
    pub streaming_efficiency: f64,
}

/// Bounds and cadence for the control loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferTuning {
    pub min_target_ms: u32,
    pub max_target_ms: u32,
    /// Control window; at most one adjustment per window.
    pub window: Duration,
    /// TTFA above this invites a shrink once playback is clean.
    pub ttfa_target_ms: f64,
    pub grow_step_ms: u32,
    pub shrink_step_ms: u32,
    pub chunk_ms: u32,
}

impl Default for BufferTuning {
    fn default() -> Self {
        Self {
            min_target_ms: 100,
            max_target_ms: 2000,
            window: Duration::from_secs(5),
            ttfa_target_ms: 300.0,
            grow_step_ms: 150,
            shrink_step_ms: 50,
            chunk_ms: 100,
        }
    }
}

/// Overall buffer health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Good,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferHealth {
    pub status: HealthStatus,
    /// Composite score in [0, 1].
    pub score: f64,
}

/// One benchmark run's aggregate, input to [`generate_optimal_config`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSample {
    pub time_to_first_audio_ms: f64,
    pub underruns: u64,
    pub streaming_efficiency: f64,
}

/// Periodic control loop recomputing [`BufferConfig`] from telemetry.
pub struct AdaptiveBufferController {
    tuning: BufferTuning,
    format: AudioFormat,
    current: BufferConfig,
    last_adjustment: Option<Instant>,
    seen_underruns: u64,
}

impl AdaptiveBufferController {
    pub fn new(tuning: BufferTuning, format: AudioFormat) -> Self {
        let initial = tuning
            .min_target_ms
            .max(tuning.ttfa_target_ms as u32)
            .min(tuning.max_target_ms);
        let current = BufferConfig::for_target(initial, tuning.chunk_ms, format);
        Self {
            tuning,
            format,
            current,
            last_adjustment: None,
            seen_underruns: 0,
        }
    }

    pub fn current(&self) -> &BufferConfig {
        &self.current
    }

    /// Feed one telemetry sample. Returns the replacement config when an
    /// adjustment fires, `None` when rate-limited or already settled.
    pub fn update_buffer(&mut self, metrics: &PlaybackMetrics) -> Option<BufferConfig> {
        let now = Instant::now();
        if let Some(last) = self.last_adjustment {
            if now.duration_since(last) < self.tuning.window {
                return None;
            }
        }

        let window_underruns = metrics.underrun_count.saturating_sub(self.seen_underruns);
        self.seen_underruns = metrics.underrun_count;

        let current_target = self.current.target_buffer_ms;
        let new_target = if window_underruns > 0 {
            // Stability first: starved playback means the buffer is too shallow.
            (current_target + self.tuning.grow_step_ms).min(self.tuning.max_target_ms)
        } else if metrics.time_to_first_audio_ms > self.tuning.ttfa_target_ms {
            // Clean window with slow starts: shave latency incrementally.
            current_target
                .saturating_sub(self.tuning.shrink_step_ms)
                .max(self.tuning.min_target_ms)
        } else {
            debug!(target_ms = current_target, "buffer settled, no adjustment");
            return None;
        };

        if new_target == current_target {
            return None;
        }

        self.last_adjustment = Some(now);
        self.current = BufferConfig::for_target(new_target, self.tuning.chunk_ms, self.format);
        info!(
            from_ms = current_target,
            to_ms = new_target,
            window_underruns,
            ttfa_ms = metrics.time_to_first_audio_ms,
            "adjusted target buffer"
        );
        Some(self.current.clone())
    }

    /// Score the current playback health.
    pub fn buffer_health(&self, metrics: &PlaybackMetrics) -> BufferHealth {
        let efficiency = metrics.streaming_efficiency.clamp(0.0, 1.0);
        let underrun_factor = 1.0 / (1.0 + metrics.underrun_count as f64);
        let ttfa_factor = if metrics.time_to_first_audio_ms <= 0.0 {
            1.0
        } else {
            (self.tuning.ttfa_target_ms / metrics.time_to_first_audio_ms).clamp(0.0, 1.0)
        };

        let score = 0.5 * efficiency + 0.3 * underrun_factor + 0.2 * ttfa_factor;
        let status = if score >= 0.8 {
            HealthStatus::Good
        } else if score >= 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        };
        BufferHealth { status, score }
    }

    /// One-shot starting point from aggregated benchmark runs: size the
    /// buffer for the p95 time-to-first-audio, leaning deeper when runs
    /// showed underruns.
    pub fn generate_optimal_config(&self, samples: &[BenchmarkSample]) -> BufferConfig {
        if samples.is_empty() {
            return self.current.clone();
        }

        let mut ttfas: Vec<f64> = samples.iter().map(|s| s.time_to_first_audio_ms).collect();
        ttfas.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p95 = ttfas[((ttfas.len() - 1) as f64 * 0.95).round() as usize];

        let total_underruns: u64 = samples.iter().map(|s| s.underruns).sum();
        let underruns_per_run = total_underruns as f64 / samples.len() as f64;

        let mut target = p95 as u32;
        if underruns_per_run >= 1.0 {
            target += self.tuning.grow_step_ms * underruns_per_run.ceil() as u32;
        }
        let target = target.clamp(self.tuning.min_target_ms, self.tuning.max_target_ms);
        BufferConfig::for_target(target, self.tuning.chunk_ms, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> BufferTuning {
        BufferTuning {
            min_target_ms: 100,
            max_target_ms: 500,
            window: Duration::from_secs(5),
            ttfa_target_ms: 300.0,
            grow_step_ms: 150,
            shrink_step_ms: 50,
            chunk_ms: 100,
        }
    }

    fn metrics(ttfa: f64, underruns: u64, efficiency: f64) -> PlaybackMetrics {
        PlaybackMetrics {
            time_to_first_audio_ms: ttfa,
            underrun_count: underruns,
            streaming_efficiency: efficiency,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn underruns_grow_the_target() {
        let mut ctl = AdaptiveBufferController::new(tuning(), AudioFormat::default());
        let before = ctl.current().target_buffer_ms;
        let config = ctl.update_buffer(&metrics(200.0, 2, 0.9)).expect("adjust");
        assert_eq!(config.target_buffer_ms, before + 150);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_window_with_slow_ttfa_shrinks() {
        let mut ctl = AdaptiveBufferController::new(tuning(), AudioFormat::default());
        let before = ctl.current().target_buffer_ms;
        let config = ctl.update_buffer(&metrics(450.0, 0, 0.95)).expect("adjust");
        assert_eq!(config.target_buffer_ms, before - 50);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_adjustment_per_window() {
        let mut ctl = AdaptiveBufferController::new(tuning(), AudioFormat::default());
        assert!(ctl.update_buffer(&metrics(200.0, 1, 0.9)).is_some());
        // Second sample inside the same window is rate-limited.
        assert!(ctl.update_buffer(&metrics(200.0, 5, 0.9)).is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(ctl.update_buffer(&metrics(200.0, 9, 0.9)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn target_never_leaves_bounds() {
        let mut ctl = AdaptiveBufferController::new(tuning(), AudioFormat::default());
        let mut underruns = 0;
        for round in 0..20 {
            underruns += 1;
            if let Some(config) = ctl.update_buffer(&metrics(200.0, underruns, 0.5)) {
                assert!(config.target_buffer_ms <= 500, "round {round}");
                assert!(config.target_buffer_ms >= 100);
            }
            tokio::time::advance(Duration::from_secs(6)).await;
        }
        assert_eq!(ctl.current().target_buffer_ms, 500);

        // Now all clean and slow to start: walk back down, never below min.
        for _ in 0..20 {
            if let Some(config) = ctl.update_buffer(&metrics(1000.0, underruns, 1.0)) {
                assert!(config.target_buffer_ms >= 100);
            }
            tokio::time::advance(Duration::from_secs(6)).await;
        }
        assert_eq!(ctl.current().target_buffer_ms, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_stream_returns_none() {
        let mut ctl = AdaptiveBufferController::new(tuning(), AudioFormat::default());
        assert!(ctl.update_buffer(&metrics(150.0, 0, 0.98)).is_none());
    }

    #[test]
    fn health_scoring_bands() {
        let ctl = AdaptiveBufferController::new(tuning(), AudioFormat::default());

        let good = ctl.buffer_health(&metrics(150.0, 0, 0.97));
        assert_eq!(good.status, HealthStatus::Good);

        let degraded = ctl.buffer_health(&metrics(600.0, 2, 0.8));
        assert_eq!(degraded.status, HealthStatus::Degraded);

        let critical = ctl.buffer_health(&metrics(2000.0, 20, 0.3));
        assert_eq!(critical.status, HealthStatus::Critical);
        assert!(critical.score < degraded.score);
    }

    #[test]
    fn optimal_config_tracks_p95_and_underruns() {
        let ctl = AdaptiveBufferController::new(tuning(), AudioFormat::default());

        let clean: Vec<BenchmarkSample> = (0..20)
            .map(|i| BenchmarkSample {
                time_to_first_audio_ms: 150.0 + i as f64,
                underruns: 0,
                streaming_efficiency: 0.95,
            })
            .collect();
        let config = ctl.generate_optimal_config(&clean);
        assert!(config.target_buffer_ms >= 100 && config.target_buffer_ms < 200);

        let choppy: Vec<BenchmarkSample> = (0..20)
            .map(|i| BenchmarkSample {
                time_to_first_audio_ms: 150.0 + i as f64,
                underruns: 2,
                streaming_efficiency: 0.6,
            })
            .collect();
        let deeper = ctl.generate_optimal_config(&choppy);
        assert!(deeper.target_buffer_ms > config.target_buffer_ms);
        assert!(deeper.target_buffer_ms <= 500);
    }

    #[test]
    fn config_derivation_is_consistent() {
        let config = BufferConfig::for_target(400, 100, AudioFormat::default());
        assert_eq!(config.chunk_size_bytes, 4800);
        assert_eq!(config.buffer_size_bytes, 19200);
        assert!((config.delivery_rate_hz - 10.0).abs() < 1e-9);
    }
}
