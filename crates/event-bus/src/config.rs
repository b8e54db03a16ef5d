//! Event bus configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Worker tasks started for each event type's pool
    ///
    /// A firing holds one worker until its last subscriber resolves. Firing
    /// the same type from inside a handler does not need a free worker, but a
    /// handler that waits on such a firing made from another task does: with
    /// every worker waiting that way, the pool stalls.
    pub workers_per_type: usize,

    /// Worker tasks in the default pool
    pub default_workers: usize,

    /// How long shutdown waits for each worker to stop
    pub shutdown_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            workers_per_type: num_cpus::get(),
            default_workers: num_cpus::get(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}
