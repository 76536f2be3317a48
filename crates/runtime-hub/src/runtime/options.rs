//! Runtime creation options

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Blocked thread check interval used in debug mode. Large enough that the
/// checker never wakes up while a debugger holds a thread at a breakpoint.
pub const BLOCKED_THREAD_CHECK_DISABLED_MS: u64 = u64::MAX / 2;

/// Shortest blocked thread check interval; smaller values are raised to it
pub const MIN_BLOCKED_THREAD_CHECK_INTERVAL_MS: u64 = 1;

/// Options consumed once when a runtime is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Number of event loop threads
    pub event_loop_pool_size: usize,

    /// How often the blocked thread checker wakes up, in milliseconds
    pub blocked_thread_check_interval_ms: u64,

    /// How long a single task may run on an event loop before it is reported
    pub max_event_loop_execute_time_ms: u64,

    /// Disable caching in [`crate::Runtime::resolve_file`]. `None` defers to
    /// the process-wide setting applied by the initializer.
    pub disable_file_caching: Option<bool>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            event_loop_pool_size: 2 * cores,
            blocked_thread_check_interval_ms: 1_000,
            max_event_loop_execute_time_ms: 2_000,
            disable_file_caching: None,
        }
    }
}

impl RuntimeOptions {
    pub fn with_event_loop_pool_size(mut self, size: usize) -> Self {
        self.event_loop_pool_size = size;
        self
    }

    pub fn with_blocked_thread_check_interval(mut self, interval: Duration) -> Self {
        self.blocked_thread_check_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_max_event_loop_execute_time(mut self, limit: Duration) -> Self {
        self.max_event_loop_execute_time_ms = duration_ms(limit);
        self
    }

    pub fn with_disable_file_caching(mut self, disabled: bool) -> Self {
        self.disable_file_caching = Some(disabled);
        self
    }

    pub fn blocked_thread_check_interval(&self) -> Duration {
        Duration::from_millis(self.blocked_thread_check_interval_ms.max(MIN_BLOCKED_THREAD_CHECK_INTERVAL_MS))
    }

    pub fn max_event_loop_execute_time(&self) -> Duration {
        Duration::from_millis(self.max_event_loop_execute_time_ms)
    }

    /// Whether the blocked thread checker has been switched off for debugging
    pub fn blocked_thread_check_disabled(&self) -> bool {
        self.blocked_thread_check_interval_ms >= BLOCKED_THREAD_CHECK_DISABLED_MS
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
