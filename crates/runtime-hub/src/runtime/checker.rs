//! Blocked thread checker
//!
//! A watchdog thread that periodically looks at every event loop of a runtime
//! and warns about loops stuck in a single task for too long.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::context::ExecutionContext;
use super::options::MIN_BLOCKED_THREAD_CHECK_INTERVAL_MS;
use crate::error::RuntimeError;

/// Running checker; dropping it stops the watchdog
pub(crate) struct BlockedThreadChecker {
    _stop: Sender<()>,
}

impl BlockedThreadChecker {
    /// Start watching `contexts`.
    ///
    /// An interval too large to form a deadline makes the watchdog wait
    /// until it is stopped, which is how debug mode switches it off. A zero
    /// interval is raised to the minimum so the watchdog never spins.
    pub(crate) fn start(
        runtime_name: &str,
        contexts: Vec<ExecutionContext>,
        interval: Duration,
        limit: Duration,
    ) -> Result<Self, RuntimeError> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let interval = check_interval(interval);

        thread::Builder::new()
            .name(format!("{}-blocked-thread-checker", runtime_name))
            .spawn(move || watch(stop_rx, contexts, interval, limit))?;

        Ok(Self { _stop: stop_tx })
    }
}

fn watch(stop: Receiver<()>, contexts: Vec<ExecutionContext>, interval: Duration, limit: Duration) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }

        for context in &contexts {
            if let Some(blocked) = blocked_for(context, limit) {
                tracing::warn!(
                    context = %context.name(),
                    blocked_ms = blocked.as_millis() as u64,
                    limit_ms = limit.as_millis() as u64,
                    "Event loop thread has been blocked"
                );
            }
        }
    }
}

fn check_interval(interval: Duration) -> Duration {
    interval.max(Duration::from_millis(MIN_BLOCKED_THREAD_CHECK_INTERVAL_MS))
}

fn blocked_for(context: &ExecutionContext, limit: Duration) -> Option<Duration> {
    context.busy_for().filter(|busy| *busy > limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeOptions};

    #[test]
    fn test_detects_long_running_task() {
        let runtime = Runtime::create(
            "checker-detect",
            RuntimeOptions::default()
                .with_event_loop_pool_size(1)
                .with_max_event_loop_execute_time(Duration::from_millis(20)),
        )
        .unwrap();
        let context = runtime.contexts()[0].clone();

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        context
            .run_on_context(move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
            })
            .unwrap();

        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        thread::sleep(Duration::from_millis(60));
        assert!(blocked_for(&context, Duration::from_millis(20)).is_some());

        release_tx.send(()).unwrap();
        runtime.close();
    }

    #[test]
    fn test_idle_loop_is_not_blocked() {
        let runtime = Runtime::create("checker-idle", RuntimeOptions::default().with_event_loop_pool_size(1)).unwrap();
        let context = runtime.contexts()[0].clone();
        assert!(blocked_for(&context, Duration::ZERO).is_none());
        runtime.close();
    }

    #[test]
    fn test_unbounded_interval_stops_on_drop() {
        let checker = BlockedThreadChecker::start(
            "checker-debug",
            Vec::new(),
            Duration::from_millis(u64::MAX / 2),
            Duration::from_secs(1),
        )
        .unwrap();
        drop(checker);
    }

    #[test]
    fn test_zero_interval_does_not_spin() {
        assert_eq!(check_interval(Duration::ZERO), Duration::from_millis(MIN_BLOCKED_THREAD_CHECK_INTERVAL_MS));
        assert_eq!(check_interval(Duration::from_millis(250)), Duration::from_millis(250));

        let runtime = Runtime::create(
            "checker-zero",
            RuntimeOptions::default()
                .with_event_loop_pool_size(1)
                .with_blocked_thread_check_interval(Duration::ZERO),
        )
        .unwrap();
        assert_eq!(
            runtime.options().blocked_thread_check_interval(),
            Duration::from_millis(MIN_BLOCKED_THREAD_CHECK_INTERVAL_MS)
        );

        let checker = BlockedThreadChecker::start(
            "checker-zero-direct",
            runtime.contexts().to_vec(),
            Duration::ZERO,
            Duration::from_secs(1),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(checker);
        runtime.close();
    }
}
