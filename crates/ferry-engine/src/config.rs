//! Engine and worker pool configuration.

use std::time::Duration;

/// Migration behaviour shared by every phase.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// A FAILED record is retried only while its attempt count is below this.
    pub max_attempts: u32,
    /// Acting user when the legacy record names none.
    pub default_user: String,
    /// Department used when the legacy record names none.
    pub default_department: String,
    /// Destination tenant.
    pub tenant: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_user: "migration-user".to_string(),
            default_department: "COF".to_string(),
            tenant: "ITBA".to_string(),
        }
    }
}

/// Sizing for the creation worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub core_size: usize,
    pub max_size: usize,
    pub queue_capacity: usize,
    /// Idle time after which an overflow worker exits.
    pub keep_alive: Duration,
    pub name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: 5,
            max_size: 10,
            queue_capacity: 50,
            keep_alive: Duration::from_secs(60),
            name_prefix: "creation-worker-".to_string(),
        }
    }
}
