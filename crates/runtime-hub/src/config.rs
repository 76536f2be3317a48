//! Hub configuration

use std::env;

use crate::runtime::RuntimeOptions;

/// Process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Name of the runtime the binary creates at startup
    pub default_runtime: String,

    /// Event loop threads per runtime (defaults to twice the core count)
    pub event_loop_pool_size: Option<usize>,

    /// Blocked thread check interval in milliseconds
    pub blocked_thread_check_interval_ms: Option<u64>,

    /// Longest a task may hold an event loop before it is reported, in milliseconds
    pub max_event_loop_execute_time_ms: Option<u64>,

    /// Running under a debugger: the blocked thread check is switched off
    pub debug: bool,

    /// Explicit process-wide file caching setting; unset means disabled
    pub disable_file_caching: Option<bool>,

    /// Heartbeat instances deployed by the binary
    pub heartbeat_instances: usize,
}

impl HubConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            default_runtime: lookup("RUNTIME_HUB_DEFAULT_RUNTIME")
                .unwrap_or_else(|| "default".to_string()),

            event_loop_pool_size: lookup("RUNTIME_HUB_EVENT_LOOP_POOL_SIZE")
                .and_then(|s| s.parse().ok()),

            blocked_thread_check_interval_ms: lookup("RUNTIME_HUB_BLOCKED_THREAD_CHECK_INTERVAL_MS")
                .and_then(|s| s.parse().ok()),

            max_event_loop_execute_time_ms: lookup("RUNTIME_HUB_MAX_EVENT_LOOP_EXECUTE_TIME_MS")
                .and_then(|s| s.parse().ok()),

            debug: lookup("RUNTIME_HUB_DEBUG")
                .and_then(|s| parse_flag(&s))
                .unwrap_or(false),

            disable_file_caching: lookup("RUNTIME_HUB_DISABLE_FILE_CACHING")
                .and_then(|s| parse_flag(&s)),

            heartbeat_instances: lookup("RUNTIME_HUB_HEARTBEAT_INSTANCES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
        }
    }

    /// Runtime options with the configured overrides applied
    pub fn runtime_options(&self) -> RuntimeOptions {
        let mut options = RuntimeOptions::default();
        if let Some(size) = self.event_loop_pool_size {
            options.event_loop_pool_size = size;
        }
        if let Some(interval) = self.blocked_thread_check_interval_ms {
            options.blocked_thread_check_interval_ms = interval;
        }
        if let Some(limit) = self.max_event_loop_execute_time_ms {
            options.max_event_loop_execute_time_ms = limit;
        }
        options
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
