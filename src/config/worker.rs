//! Worker-supervisor configuration

use serde::{Deserialize, Serialize};

/// Supervisor and job-lifecycle thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Supervisor tick interval (seconds)
    pub poll_interval_secs: u64,
    /// Heartbeat and cancel-poll cadence inside the engine (seconds)
    pub heartbeat_interval_secs: u64,
    /// Frontier lease TTL (seconds)
    pub lease_ttl_secs: u64,
    /// Bound on the in-flight drain during engine shutdown (seconds)
    pub drain_timeout_secs: u64,
    /// Heartbeat silence after which a running job counts as orphaned (seconds)
    pub orphaned_threshold_secs: i64,
    /// Progress silence after which a running job counts as stalled (seconds)
    pub stalled_threshold_secs: i64,
    /// Time a running job may sit at zero pages before hard-stall (seconds)
    pub hard_stalled_threshold_secs: i64,
    /// Job TTL from creation (hours)
    pub job_expiry_hours: i64,
    /// Restarts allowed before an orphaned/stalled job is failed
    pub max_restarts: u32,
    /// Fetch retries allowed per frontier entry
    pub max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            heartbeat_interval_secs: 15,
            lease_ttl_secs: 30,
            drain_timeout_secs: 60,
            orphaned_threshold_secs: 120,
            stalled_threshold_secs: 300,
            hard_stalled_threshold_secs: 180,
            job_expiry_hours: 24,
            max_restarts: 2,
            max_retries: 3,
        }
    }
}
