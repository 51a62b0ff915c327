//! Unified engine configuration
//!
//! One structure consolidating the pool, backpressure, work-stealing,
//! circuit-breaker, and DAG settings, with a fluent builder for partial
//! configuration on top of sensible defaults.
//!
//! ```
//! use gantry::config::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .worker_count(8)
//!     .queue_capacity(5_000)
//!     .enable_work_stealing()
//!     .build()
//!     .unwrap();
//! assert_eq!(config.pool.worker_count, 8);
//! ```

use std::time::Duration;

use crate::breaker::CircuitBreakerConfig;
use crate::dag::DagConfig;
use crate::error::EngineResult;
use crate::pool::PoolConfig;
use crate::queue::{BackpressureConfig, BackpressurePolicy, RateLimitConfig};
use crate::stealing::WorkStealingConfig;

/// Unified configuration for the engine
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Worker pool and queue settings
    pub pool: PoolConfig,
    /// Circuit breaker settings (consumed by the breaker policy)
    pub breaker: CircuitBreakerConfig,
    /// DAG scheduler settings
    pub dag: DagConfig,
}

impl EngineConfig {
    /// Start building a configuration
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Validate every section
    ///
    /// Pool and backpressure settings validate through
    /// [`PoolConfig::validate`]; the breaker and DAG sections validate
    /// through their own `validate` methods. A zero worker count is
    /// accepted: such a pool starts and stops cleanly and only queues.
    pub fn validate(&self) -> EngineResult<()> {
        self.pool.validate()?;
        self.breaker.validate()?;
        self.dag.validate()
    }
}

/// Fluent builder for [`EngineConfig`]
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Number of worker threads
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.pool.worker_count = count;
        self
    }

    /// Shared queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.pool.queue_capacity = capacity;
        self
    }

    /// Replace the whole backpressure section
    pub fn backpressure(mut self, backpressure: BackpressureConfig) -> Self {
        self.config.pool.backpressure = backpressure;
        self
    }

    /// Select the overflow policy
    pub fn backpressure_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.config.pool.backpressure.policy = policy;
        self
    }

    /// Watermark band for pressure signaling
    pub fn watermarks(mut self, low: f64, high: f64) -> Self {
        self.config.pool.backpressure.low_watermark = low;
        self.config.pool.backpressure.high_watermark = high;
        self
    }

    /// Enable token-bucket rate limiting on the queue
    pub fn rate_limit(mut self, tokens_per_second: u64, burst_size: u64) -> Self {
        self.config.pool.backpressure.rate_limit = RateLimitConfig {
            enabled: true,
            tokens_per_second,
            burst_size,
        };
        self
    }

    /// How long idle workers park between polls
    pub fn wake_interval(mut self, interval: Duration) -> Self {
        self.config.pool.wake_interval = interval;
        self
    }

    /// Drain budget for graceful stops
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.shutdown_timeout = timeout;
        self
    }

    /// Enable work stealing with default knobs
    pub fn enable_work_stealing(mut self) -> Self {
        self.config.pool.stealing.enabled = true;
        self
    }

    /// Replace the whole stealing section
    pub fn stealing(mut self, stealing: WorkStealingConfig) -> Self {
        self.config.pool.stealing = stealing;
        self
    }

    /// Replace the circuit breaker section
    pub fn circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.config.breaker = breaker;
        self
    }

    /// Replace the DAG section
    pub fn dag(mut self, dag: DagConfig) -> Self {
        self.config.dag = dag;
        self
    }

    /// Validate and produce the configuration
    pub fn build(self) -> EngineResult<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_are_valid() {
        let config = EngineConfig::builder().build().unwrap();
        assert!(config.pool.worker_count > 0);
        assert_eq!(config.pool.queue_capacity, 10_000);
        assert!(!config.pool.stealing.enabled);
    }

    #[test]
    fn test_builder_sections_compose() {
        let config = EngineConfig::builder()
            .worker_count(4)
            .queue_capacity(256)
            .watermarks(0.4, 0.9)
            .rate_limit(500, 50)
            .enable_work_stealing()
            .build()
            .unwrap();

        assert_eq!(config.pool.worker_count, 4);
        assert_eq!(config.pool.queue_capacity, 256);
        assert!(config.pool.stealing.enabled);
        assert!(config.pool.backpressure.rate_limit.enabled);
        assert_eq!(config.pool.backpressure.rate_limit.burst_size, 50);
    }

    #[test]
    fn test_builder_rejects_bad_watermarks() {
        let result = EngineConfig::builder().watermarks(0.9, 0.4).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_validates_breaker_section() {
        let result = EngineConfig::builder()
            .circuit_breaker(CircuitBreakerConfig {
                half_open_max_requests: 0,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_validates_dag_section() {
        let result = EngineConfig::builder()
            .dag(crate::dag::DagConfig {
                failure_policy: crate::dag::DagFailurePolicy::Retry,
                max_retries: 0,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_workers_is_a_valid_boundary() {
        let config = EngineConfig::builder().worker_count(0).build().unwrap();
        assert_eq!(config.pool.worker_count, 0);
    }
}
