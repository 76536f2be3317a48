//! Runtime initializer
//!
//! Builds new runtimes, applying the environment-sensitive settings every
//! runtime in the process should share: debug mode and file caching.

use std::sync::OnceLock;

use crate::config::HubConfig;
use crate::error::RuntimeError;
use crate::runtime::{Runtime, RuntimeOptions, BLOCKED_THREAD_CHECK_DISABLED_MS};

/// Creates runtime instances for the registry
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, name: &str, options: Option<RuntimeOptions>) -> Result<Runtime, RuntimeError>;
}

/// Process-wide "disable file caching" setting.
///
/// Written at most once: an explicit setting made up front is never
/// clobbered, otherwise the first runtime creation settles it to disabled.
#[derive(Debug, Default)]
pub struct FileCachingToggle {
    disabled: OnceLock<bool>,
}

impl FileCachingToggle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A toggle that already carries an explicit setting
    pub fn with_explicit(disabled: bool) -> Self {
        let toggle = Self::new();
        let _ = toggle.disabled.set(disabled);
        toggle
    }

    /// Settle the toggle if nobody has yet and return its value
    pub fn apply(&self) -> bool {
        *self.disabled.get_or_init(|| true)
    }

    pub fn get(&self) -> Option<bool> {
        self.disabled.get().copied()
    }
}

/// Default [`RuntimeFactory`]
#[derive(Debug, Default)]
pub struct RuntimeInitializer {
    debug: bool,
    file_caching: FileCachingToggle,
}

impl RuntimeInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &HubConfig) -> Self {
        let file_caching = match config.disable_file_caching {
            Some(disabled) => FileCachingToggle::with_explicit(disabled),
            None => FileCachingToggle::new(),
        };
        Self {
            debug: config.debug,
            file_caching,
        }
    }

    /// Treat the process as running under a debugger
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_file_caching(mut self, toggle: FileCachingToggle) -> Self {
        self.file_caching = toggle;
        self
    }

    pub fn file_caching(&self) -> &FileCachingToggle {
        &self.file_caching
    }

    /// Options a runtime will actually be created with
    pub fn prepare_options(&self, options: Option<RuntimeOptions>) -> RuntimeOptions {
        let mut options = options.unwrap_or_default();

        if self.debug {
            // Breakpoints would otherwise be reported as blocked event loops
            options.blocked_thread_check_interval_ms = BLOCKED_THREAD_CHECK_DISABLED_MS;
            tracing::info!("In debug mode, disable blocked thread check");
        }

        let disabled = self.file_caching.apply();
        options.disable_file_caching.get_or_insert(disabled);
        options
    }
}

impl RuntimeFactory for RuntimeInitializer {
    fn create(&self, name: &str, options: Option<RuntimeOptions>) -> Result<Runtime, RuntimeError> {
        Runtime::create(name, self.prepare_options(options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_substituted() {
        let options = RuntimeInitializer::new().prepare_options(None);
        assert_eq!(options.event_loop_pool_size, RuntimeOptions::default().event_loop_pool_size);
        assert!(!options.blocked_thread_check_disabled());
        assert_eq!(options.disable_file_caching, Some(true));
    }

    #[test]
    fn test_debug_disables_blocked_thread_check() {
        let initializer = RuntimeInitializer::new().with_debug(true);
        let options = initializer.prepare_options(Some(RuntimeOptions::default().with_event_loop_pool_size(3)));
        assert!(options.blocked_thread_check_disabled());
        assert_eq!(options.event_loop_pool_size, 3);
    }

    #[test]
    fn test_toggle_set_only_once() {
        let toggle = FileCachingToggle::new();
        assert_eq!(toggle.get(), None);
        assert!(toggle.apply());
        assert!(toggle.apply());
        assert_eq!(toggle.get(), Some(true));
    }

    #[test]
    fn test_explicit_toggle_not_clobbered() {
        let initializer = RuntimeInitializer::new().with_file_caching(FileCachingToggle::with_explicit(false));
        let options = initializer.prepare_options(None);
        assert_eq!(options.disable_file_caching, Some(false));
        assert_eq!(initializer.file_caching().get(), Some(false));
    }

    #[test]
    fn test_per_runtime_setting_wins() {
        let initializer = RuntimeInitializer::new();
        let options = initializer.prepare_options(Some(RuntimeOptions::default().with_disable_file_caching(false)));
        assert_eq!(options.disable_file_caching, Some(false));
        // The process toggle is still settled
        assert_eq!(initializer.file_caching().get(), Some(true));
    }

    #[test]
    fn test_from_config() {
        let config = HubConfig {
            debug: true,
            disable_file_caching: Some(false),
            ..HubConfig::default()
        };
        let initializer = RuntimeInitializer::from_config(&config);
        let options = initializer.prepare_options(None);
        assert!(options.blocked_thread_check_disabled());
        assert_eq!(options.disable_file_caching, Some(false));
    }

    #[test]
    fn test_create_runtime() {
        let initializer = RuntimeInitializer::new();
        let runtime = initializer
            .create("init-create", Some(RuntimeOptions::default().with_event_loop_pool_size(1)))
            .unwrap();
        assert_eq!(runtime.name(), "init-create");
        assert_eq!(runtime.contexts().len(), 1);
        assert!(!runtime.file_caching_enabled());
        runtime.close();
    }
}
