//! Engine configuration.
//!
//! All tunables are carried in an explicit [`EngineConfig`] handed to the
//! orchestrator and restore flow engine constructors; there is no
//! process-wide configuration state.

use std::time::Duration;

/// Configuration for the protection orchestrator and restore flow engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between stack status polls during restore synchronization.
    pub sync_status_interval: Duration,
    /// Bound on any single call to an external service.
    pub service_timeout: Duration,
    /// Maximum number of flow tasks executing concurrently.
    pub max_concurrency: usize,
    /// Size of one chunked artifact record written to the bank.
    pub artifact_chunk_size: usize,
    /// Region used when resolving service endpoints.
    pub region: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_status_interval: Duration::from_secs(60),
            service_timeout: Duration::from_secs(30),
            max_concurrency: 8,
            artifact_chunk_size: 65536,
            region: "RegionOne".to_string(),
        }
    }
}

impl EngineConfig {
    /// Override the stack status polling interval.
    pub fn with_sync_status_interval(mut self, interval: Duration) -> Self {
        self.sync_status_interval = interval;
        self
    }

    /// Override the per-call external service timeout.
    pub fn with_service_timeout(mut self, timeout: Duration) -> Self {
        self.service_timeout = timeout;
        self
    }

    /// Override the flow concurrency bound. Clamped to at least 1.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Override the artifact chunk size. Clamped to at least 1 byte.
    pub fn with_artifact_chunk_size(mut self, bytes: usize) -> Self {
        self.artifact_chunk_size = bytes.max(1);
        self
    }

    /// Override the endpoint resolution region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}
