//! Circuit breaker and health probe for a single node.
//!
//! `NodeHealthTracker` wraps one node's rolling-window metrics in a
//! five-state circuit breaker with exponential backoff. `http_probe`
//! performs the deadline-bounded check against the node's cluster
//! health endpoint.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use infergrid_core::{epoch_millis, HealthConfig, NodeHealthSnapshot, NodeStatus};

use crate::metrics::RollingWindowMetrics;

/// Samples required before a healthy node can be degraded.
const DEGRADED_MIN_SAMPLES: usize = 5;
/// Samples required before an unhealthy node can go offline.
const OFFLINE_MIN_SAMPLES: usize = 10;
/// Consecutive successes needed to recover from unhealthy/offline.
const RECOVERY_SUCCESSES: u32 = 2;

/// Why a single health check failed. The three kinds are recorded
/// distinctly so status snapshots can tell a dead node from a slow one.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("health check timed out")]
    Timeout,

    #[error("health endpoint returned status {0}")]
    BadStatus(u16),

    #[error("connection failed: {0}")]
    Connect(String),
}

/// Circuit breaker over one node's rolling-window metrics.
///
/// Status transitions are evaluated after every recorded sample, whether
/// it came from a periodic probe or from real traffic.
#[derive(Debug)]
pub struct NodeHealthTracker {
    status: NodeStatus,
    metrics: RollingWindowMetrics,
    degraded_threshold: f64,
    unhealthy_threshold: f64,
    max_consecutive_failures: u32,
    /// Current backoff delay; grows on failure, resets on success.
    current_delay_ms: u64,
    initial_delay_ms: u64,
    backoff_multiplier: f64,
    max_delay_ms: u64,
    last_error: Option<String>,
    last_check_ms: Option<u64>,
}

impl NodeHealthTracker {
    /// Create a tracker from the cluster health config.
    ///
    /// The config is assumed validated; an invalid window or capacity
    /// still fails here rather than panicking.
    pub fn new(config: &HealthConfig) -> Result<Self, infergrid_core::ConfigError> {
        Ok(Self {
            status: NodeStatus::Initializing,
            metrics: RollingWindowMetrics::new(config.window_ms, config.max_samples)?,
            degraded_threshold: config.degraded_threshold,
            unhealthy_threshold: config.unhealthy_threshold,
            max_consecutive_failures: config.max_consecutive_failures,
            current_delay_ms: config.initial_backoff_ms,
            initial_delay_ms: config.initial_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
            max_delay_ms: config.max_backoff_ms,
            last_error: None,
            last_check_ms: None,
        })
    }

    /// Record a successful check or request. Returns the new status.
    pub fn record_success(&mut self, latency_ms: f64) -> NodeStatus {
        self.metrics.record_success(latency_ms);
        self.last_check_ms = Some(epoch_millis());
        self.current_delay_ms = self.initial_delay_ms;
        self.update_status()
    }

    /// Record a failed check or request. Returns the new status.
    pub fn record_failure(&mut self, error: &str) -> NodeStatus {
        self.metrics.record_failure();
        self.last_check_ms = Some(epoch_millis());
        self.last_error = Some(error.to_string());
        let scaled = (self.current_delay_ms as f64 * self.backoff_multiplier) as u64;
        self.current_delay_ms = scaled.min(self.max_delay_ms);
        self.update_status()
    }

    /// Current circuit-breaker status.
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Backoff delay for the next check, with 0–25% jitter so probes
    /// across nodes don't synchronize.
    pub fn next_check_delay(&self) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.25);
        let delay = self.current_delay_ms as f64 * (1.0 + jitter);
        Duration::from_millis(delay as u64)
    }

    /// Backoff delay without jitter (for tests and diagnostics).
    pub fn current_delay_ms(&self) -> u64 {
        self.current_delay_ms
    }

    /// Full health snapshot for status reporting and routing.
    pub fn health_snapshot(&self) -> NodeHealthSnapshot {
        let window = self.metrics.snapshot();
        NodeHealthSnapshot {
            status: self.status,
            success_rate: window.success_rate,
            avg_latency_ms: window.avg_latency_ms,
            consecutive_successes: window.consecutive_successes,
            consecutive_failures: window.consecutive_failures,
            sample_count: window.sample_count,
            last_error: self.last_error.clone(),
            last_check_ms: self.last_check_ms,
        }
    }

    fn update_status(&mut self) -> NodeStatus {
        let window = self.metrics.snapshot();
        let previous = self.status;

        self.status = match self.status {
            NodeStatus::Initializing => {
                if window.consecutive_successes >= 1 {
                    NodeStatus::Healthy
                } else if window.consecutive_failures >= self.max_consecutive_failures {
                    // A node that fails every check before its first success
                    // enters the backoff/recovery path instead of staying
                    // unprobed in limbo.
                    NodeStatus::Unhealthy
                } else {
                    NodeStatus::Initializing
                }
            }
            NodeStatus::Healthy => {
                if window.consecutive_failures >= self.max_consecutive_failures {
                    NodeStatus::Unhealthy
                } else if window.sample_count >= DEGRADED_MIN_SAMPLES
                    && window.success_rate < self.degraded_threshold
                {
                    NodeStatus::Degraded
                } else {
                    NodeStatus::Healthy
                }
            }
            NodeStatus::Degraded => {
                if window.consecutive_failures >= self.max_consecutive_failures {
                    NodeStatus::Unhealthy
                } else if window.success_rate >= self.degraded_threshold {
                    NodeStatus::Healthy
                } else {
                    NodeStatus::Degraded
                }
            }
            NodeStatus::Unhealthy => {
                if window.consecutive_successes >= RECOVERY_SUCCESSES {
                    NodeStatus::Healthy
                } else if window.sample_count >= OFFLINE_MIN_SAMPLES
                    && window.success_rate < self.unhealthy_threshold
                {
                    NodeStatus::Offline
                } else {
                    NodeStatus::Unhealthy
                }
            }
            NodeStatus::Offline => {
                if window.consecutive_successes >= RECOVERY_SUCCESSES {
                    NodeStatus::Healthy
                } else {
                    NodeStatus::Offline
                }
            }
        };

        if self.status != previous {
            debug!(
                from = ?previous,
                to = ?self.status,
                success_rate = window.success_rate,
                failures = window.consecutive_failures,
                "node status changed"
            );
        }
        self.status
    }
}

/// Perform an HTTP health check against `{url}{path}`.
///
/// Returns the observed latency in milliseconds on a 2xx response.
/// Any other status, a connection error, or deadline expiry is a
/// distinct [`ProbeError`]; the in-flight request is aborted when the
/// deadline fires, never left to hang.
pub async fn http_probe(url: &str, path: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let address = authority(url);
    let uri = format!("{}{}", url.trim_end_matches('/'), path);
    let started = std::time::Instant::now();

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", &address)
            .header("user-agent", "infergrid-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| ProbeError::Connect(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::BadStatus(resp.status().as_u16()))
        }
    })
    .await;

    match result {
        Ok(Ok(())) => Ok(started.elapsed().as_secs_f64() * 1_000.0),
        Ok(Err(e)) => {
            debug!(%uri, error = %e, "health probe failed");
            Err(e)
        }
        Err(_) => {
            warn!(%uri, timeout_ms = timeout.as_millis() as u64, "health probe timed out");
            Err(ProbeError::Timeout)
        }
    }
}

/// Strip the scheme from a node URL, leaving `host:port`.
fn authority(url: &str) -> String {
    let stripped = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    stripped
        .split('/')
        .next()
        .unwrap_or(stripped)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> HealthConfig {
        HealthConfig {
            max_consecutive_failures: 3,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 8_000,
            ..HealthConfig::default()
        }
    }

    fn tracker() -> NodeHealthTracker {
        NodeHealthTracker::new(&test_config()).unwrap()
    }

    #[test]
    fn starts_initializing() {
        let t = tracker();
        assert_eq!(t.status(), NodeStatus::Initializing);
    }

    #[test]
    fn first_success_goes_healthy() {
        let mut t = tracker();
        assert_eq!(t.record_success(50.0), NodeStatus::Healthy);
    }

    #[test]
    fn initializing_node_that_only_fails_goes_unhealthy() {
        let mut t = tracker();
        t.record_failure("connect refused");
        t.record_failure("connect refused");
        assert_eq!(t.status(), NodeStatus::Initializing);
        assert_eq!(t.record_failure("connect refused"), NodeStatus::Unhealthy);
    }

    #[test]
    fn consecutive_failures_trip_the_breaker() {
        let mut t = tracker();
        t.record_success(50.0);
        t.record_failure("timeout");
        t.record_failure("timeout");
        assert_eq!(t.status(), NodeStatus::Healthy);
        assert_eq!(t.record_failure("timeout"), NodeStatus::Unhealthy);
    }

    #[test]
    fn low_success_rate_degrades() {
        let mut t = tracker();
        // 3 successes, then alternate to keep streaks short while the
        // rate sinks below 0.8: s s s f s f → rate 4/6 ≈ 0.67.
        t.record_success(10.0);
        t.record_success(10.0);
        t.record_success(10.0);
        t.record_failure("500");
        t.record_success(10.0);
        assert_eq!(t.record_failure("500"), NodeStatus::Degraded);
    }

    #[test]
    fn degraded_recovers_when_rate_climbs() {
        let mut t = tracker();
        t.record_success(10.0);
        t.record_success(10.0);
        t.record_success(10.0);
        t.record_failure("500");
        t.record_success(10.0);
        t.record_failure("500");
        assert_eq!(t.status(), NodeStatus::Degraded);

        // Pile on successes until the rate is back above 0.8.
        for _ in 0..10 {
            t.record_success(10.0);
        }
        assert_eq!(t.status(), NodeStatus::Healthy);
    }

    #[test]
    fn unhealthy_node_goes_offline_below_threshold() {
        let mut t = tracker();
        // 10 straight failures: 3 trip the breaker, the rest push the
        // sample count to 10 at a 0.0 success rate.
        for _ in 0..9 {
            t.record_failure("down");
        }
        assert_eq!(t.status(), NodeStatus::Unhealthy);
        assert_eq!(t.record_failure("down"), NodeStatus::Offline);
    }

    #[test]
    fn two_successes_recover_from_unhealthy() {
        let mut t = tracker();
        for _ in 0..3 {
            t.record_failure("down");
        }
        assert_eq!(t.status(), NodeStatus::Unhealthy);
        t.record_success(10.0);
        assert_eq!(t.status(), NodeStatus::Unhealthy);
        assert_eq!(t.record_success(10.0), NodeStatus::Healthy);
    }

    #[test]
    fn two_successes_recover_from_offline() {
        let mut t = tracker();
        for _ in 0..10 {
            t.record_failure("down");
        }
        assert_eq!(t.status(), NodeStatus::Offline);
        t.record_success(10.0);
        assert_eq!(t.record_success(10.0), NodeStatus::Healthy);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut t = tracker();
        assert_eq!(t.current_delay_ms(), 1_000);
        t.record_failure("down");
        assert_eq!(t.current_delay_ms(), 2_000);
        t.record_failure("down");
        assert_eq!(t.current_delay_ms(), 4_000);
        t.record_failure("down");
        assert_eq!(t.current_delay_ms(), 8_000);
        t.record_failure("down");
        // Capped at max.
        assert_eq!(t.current_delay_ms(), 8_000);
    }

    #[test]
    fn backoff_is_monotonic_until_success() {
        let mut t = tracker();
        let mut last = t.current_delay_ms();
        for _ in 0..10 {
            t.record_failure("down");
            let now = t.current_delay_ms();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn backoff_resets_on_success() {
        let mut t = tracker();
        t.record_failure("down");
        t.record_failure("down");
        assert_eq!(t.current_delay_ms(), 4_000);
        t.record_success(10.0);
        assert_eq!(t.current_delay_ms(), 1_000);
    }

    #[test]
    fn next_check_delay_jitter_bounds() {
        let t = tracker();
        for _ in 0..50 {
            let d = t.next_check_delay().as_millis() as u64;
            assert!(d >= 1_000);
            assert!(d <= 1_250);
        }
    }

    #[test]
    fn snapshot_carries_last_error() {
        let mut t = tracker();
        t.record_failure("connection refused");
        let snap = t.health_snapshot();
        assert_eq!(snap.last_error.as_deref(), Some("connection refused"));
        assert!(snap.last_check_ms.is_some());
    }

    #[test]
    fn authority_strips_scheme_and_path() {
        assert_eq!(authority("http://10.0.0.1:8080"), "10.0.0.1:8080");
        assert_eq!(authority("https://node-a:9000/base"), "node-a:9000");
        assert_eq!(authority("10.0.0.1:8080"), "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn probe_to_closed_port_is_connect_error() {
        let result = http_probe(
            "http://127.0.0.1:1",
            "/v1/cluster/health",
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result, Err(ProbeError::Connect(_))));
    }
}
