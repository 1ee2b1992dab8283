//! Rolling-window success/latency metrics.
//!
//! Samples live in a fixed-capacity circular buffer; queries only consider
//! samples whose timestamp falls within the configured window, so stale
//! results age out without explicit pruning.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use infergrid_core::{epoch_millis, ConfigError};

/// One recorded request or probe outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
struct MetricSample {
    at_ms: u64,
    success: bool,
    /// Latency of the call; only meaningful for successes.
    latency_ms: Option<f64>,
}

/// Aggregates computed over the in-window samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    /// Successes / total, 0.0 when the window is empty.
    pub success_rate: f64,
    /// Mean latency over successful samples only.
    pub avg_latency_ms: f64,
    /// Samples currently inside the window.
    pub sample_count: usize,
    /// Streak of successes at the newest end of the window.
    pub consecutive_successes: u32,
    /// Streak of failures at the newest end of the window.
    pub consecutive_failures: u32,
}

/// Time-windowed success/latency accumulator.
///
/// The buffer holds at most `max_samples` entries; once full, the oldest
/// sample is overwritten. `snapshot()` filters to samples recorded within
/// `window_ms` of the call.
#[derive(Debug)]
pub struct RollingWindowMetrics {
    window_ms: u64,
    max_samples: usize,
    samples: VecDeque<MetricSample>,
}

impl RollingWindowMetrics {
    /// Create a new window. Rejects a non-positive window or capacity.
    pub fn new(window_ms: u64, max_samples: usize) -> Result<Self, ConfigError> {
        if window_ms == 0 {
            return Err(ConfigError::NonPositive("window_ms"));
        }
        if max_samples == 0 {
            return Err(ConfigError::NonPositive("max_samples"));
        }
        Ok(Self {
            window_ms,
            max_samples,
            samples: VecDeque::with_capacity(max_samples),
        })
    }

    /// Record a successful call and its latency.
    pub fn record_success(&mut self, latency_ms: f64) {
        self.push(MetricSample {
            at_ms: epoch_millis(),
            success: true,
            latency_ms: Some(latency_ms),
        });
    }

    /// Record a failed call.
    pub fn record_failure(&mut self) {
        self.push(MetricSample {
            at_ms: epoch_millis(),
            success: false,
            latency_ms: None,
        });
    }

    /// Drop all samples.
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Compute aggregates over the samples inside the window.
    pub fn snapshot(&self) -> WindowMetrics {
        self.snapshot_at(epoch_millis())
    }

    fn push(&mut self, sample: MetricSample) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn snapshot_at(&self, now_ms: u64) -> WindowMetrics {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        let valid: Vec<&MetricSample> = self
            .samples
            .iter()
            .filter(|s| s.at_ms >= cutoff)
            .collect();

        if valid.is_empty() {
            return WindowMetrics {
                success_rate: 0.0,
                avg_latency_ms: 0.0,
                sample_count: 0,
                consecutive_successes: 0,
                consecutive_failures: 0,
            };
        }

        let successes = valid.iter().filter(|s| s.success).count();
        let success_rate = successes as f64 / valid.len() as f64;

        let latencies: Vec<f64> = valid
            .iter()
            .filter(|s| s.success)
            .filter_map(|s| s.latency_ms)
            .collect();
        let avg_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        // Streaks are scanned from the newest sample backward until the
        // first sample of the opposite kind.
        let mut consecutive_successes = 0u32;
        let mut consecutive_failures = 0u32;
        for sample in valid.iter().rev() {
            if sample.success {
                if consecutive_failures > 0 {
                    break;
                }
                consecutive_successes += 1;
            } else {
                if consecutive_successes > 0 {
                    break;
                }
                consecutive_failures += 1;
            }
        }

        WindowMetrics {
            success_rate,
            avg_latency_ms,
            sample_count: valid.len(),
            consecutive_successes,
            consecutive_failures,
        }
    }

    #[cfg(test)]
    fn push_at(&mut self, at_ms: u64, success: bool, latency_ms: Option<f64>) {
        self.push(MetricSample {
            at_ms,
            success,
            latency_ms,
        });
    }
}
