//! Cluster configuration.
//!
//! The coordinator consumes an already-loaded settings object; this module
//! defines its shape and the validation applied before initialization
//! touches the network.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::RoutingStrategy;

/// Health monitoring parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between checks for a healthy/degraded node.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Deadline for a single health check.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before a node is marked unhealthy.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Success rate below which an unhealthy node goes offline.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: f64,
    /// Success rate below which a healthy node is degraded.
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: f64,
    /// Rolling metrics window.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Sample buffer capacity per node.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    /// Starting backoff delay for failing nodes.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff growth factor per consecutive failure.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Backoff ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Cache warmup and synchronization parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Registry entries older than this are expired.
    #[serde(default = "default_max_cache_age_secs")]
    pub max_cache_age_secs: u64,
    /// Nodes warmed concurrently per batch.
    #[serde(default = "default_warmup_concurrency")]
    pub warmup_concurrency: usize,
    /// Deadline for a single warmup call.
    #[serde(default = "default_warmup_timeout_ms")]
    pub warmup_timeout_ms: u64,
    /// Retries per node after a failed warmup call; 0 disables retrying.
    #[serde(default = "default_warmup_retries")]
    pub warmup_retries: u32,
    /// Interval between cache sync sweeps.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// The prompt primed into every node's cache.
    pub system_prompt: String,
}

/// Routing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: RoutingStrategy,
    /// Sticky session time-to-live.
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    /// Routing retry budget for the calling proxy layer.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between routing retries.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Validated settings for the cluster coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub health: HealthConfig,
    pub cache: CacheConfig,
    pub routing: RoutingConfig,
}

impl ClusterConfig {
    /// Check every field that must be positive or within range.
    ///
    /// Called by cluster initialization before any network activity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.check_interval_ms == 0 {
            return Err(ConfigError::NonPositive("health.check_interval_ms"));
        }
        if self.health.timeout_ms == 0 {
            return Err(ConfigError::NonPositive("health.timeout_ms"));
        }
        if self.health.max_consecutive_failures == 0 {
            return Err(ConfigError::NonPositive("health.max_consecutive_failures"));
        }
        if self.health.window_ms == 0 {
            return Err(ConfigError::NonPositive("health.window_ms"));
        }
        if self.health.max_samples == 0 {
            return Err(ConfigError::NonPositive("health.max_samples"));
        }
        if self.health.initial_backoff_ms == 0 {
            return Err(ConfigError::NonPositive("health.initial_backoff_ms"));
        }
        if self.health.max_backoff_ms < self.health.initial_backoff_ms {
            return Err(ConfigError::BackoffRange);
        }
        if self.health.backoff_multiplier < 1.0 {
            return Err(ConfigError::OutOfRange("health.backoff_multiplier"));
        }
        for (name, value) in [
            ("health.unhealthy_threshold", self.health.unhealthy_threshold),
            ("health.degraded_threshold", self.health.degraded_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::OutOfRange(name));
            }
        }
        if self.cache.max_cache_age_secs == 0 {
            return Err(ConfigError::NonPositive("cache.max_cache_age_secs"));
        }
        if self.cache.warmup_concurrency == 0 {
            return Err(ConfigError::NonPositive("cache.warmup_concurrency"));
        }
        if self.cache.warmup_timeout_ms == 0 {
            return Err(ConfigError::NonPositive("cache.warmup_timeout_ms"));
        }
        if self.cache.sync_interval_ms == 0 {
            return Err(ConfigError::NonPositive("cache.sync_interval_ms"));
        }
        if self.routing.session_ttl_ms == 0 {
            return Err(ConfigError::NonPositive("routing.session_ttl_ms"));
        }
        Ok(())
    }
}

fn default_check_interval_ms() -> u64 {
    10_000
}
fn default_timeout_ms() -> u64 {
    5_000
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_unhealthy_threshold() -> f64 {
    0.1
}
fn default_degraded_threshold() -> f64 {
    0.8
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_max_samples() -> usize {
    100
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_max_cache_age_secs() -> u64 {
    300
}
fn default_warmup_concurrency() -> usize {
    3
}
fn default_warmup_timeout_ms() -> u64 {
    30_000
}
fn default_warmup_retries() -> u32 {
    1
}
fn default_sync_interval_ms() -> u64 {
    60_000
}
fn default_strategy() -> RoutingStrategy {
    RoutingStrategy::CacheAware
}
fn default_session_ttl_ms() -> u64 {
    30 * 60 * 1_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            timeout_ms: default_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            unhealthy_threshold: default_unhealthy_threshold(),
            degraded_threshold: default_degraded_threshold(),
            window_ms: default_window_ms(),
            max_samples: default_max_samples(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_age_secs: default_max_cache_age_secs(),
            warmup_concurrency: default_warmup_concurrency(),
            warmup_timeout_ms: default_warmup_timeout_ms(),
            warmup_retries: default_warmup_retries(),
            sync_interval_ms: default_sync_interval_ms(),
            system_prompt: String::new(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            session_ttl_ms: default_session_ttl_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}
