//! Execution contexts
//!
//! An [`ExecutionContext`] identifies one event loop thread. Every task
//! scheduled on a context runs on that thread, in submission order.
//!
//! Code running on an event loop can ask for its context ambiently through
//! [`ExecutionContext::current`]. Prefer passing contexts explicitly and only
//! fall back to the ambient lookup at boundaries that have nothing else to go
//! on.

use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::instance::{Runtime, RuntimeInner};
use crate::error::RuntimeError;

/// A unit of work queued on an event loop
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Messages drained by an event loop thread
pub(crate) enum LoopMessage {
    Run(Task),
    Shutdown,
}

thread_local! {
    static CURRENT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

/// Identifier of an execution context, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

struct ContextInner {
    id: ContextId,
    name: String,
    sender: mpsc::UnboundedSender<LoopMessage>,
    handle: tokio::runtime::Handle,
    owner: Weak<RuntimeInner>,
    epoch: Instant,
    /// Milliseconds since `epoch` (plus one) when the running task started; 0 when idle
    busy_since: AtomicU64,
}

/// Handle to a specific event loop thread
///
/// Cheap to clone. Two handles are equal iff they refer to the same loop.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    pub(crate) fn new(
        name: String,
        sender: mpsc::UnboundedSender<LoopMessage>,
        handle: tokio::runtime::Handle,
        owner: Weak<RuntimeInner>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ContextId::next(),
                name,
                sender,
                handle,
                owner,
                epoch: Instant::now(),
                busy_since: AtomicU64::new(0),
            }),
        }
    }

    /// The context of the event loop the calling thread belongs to, if any
    pub fn current() -> Option<ExecutionContext> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Whether the calling thread is this context's event loop
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| current.borrow().as_ref() == Some(self))
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Thread name of the event loop
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The runtime that owns this context, unless it has been dropped
    pub fn owner(&self) -> Option<Runtime> {
        self.inner.owner.upgrade().map(Runtime::from_inner)
    }

    /// Queue a task on this context
    ///
    /// Returns immediately. Tasks run on the loop thread in the order they
    /// were submitted.
    pub fn run_on_context<F>(&self, task: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Box::new(task))
            .map_err(|_| RuntimeError::Closed(self.inner.name.clone()))
    }

    /// Spawn async work driven by this context's event loop
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Queue a boxed task, handing it back if the loop is gone
    pub(crate) fn schedule(&self, task: Task) -> Result<(), Task> {
        self.inner
            .sender
            .send(LoopMessage::Run(task))
            .map_err(|err| match err.0 {
                LoopMessage::Run(task) => task,
                LoopMessage::Shutdown => unreachable!("only run messages are scheduled"),
            })
    }

    /// Ask the event loop to exit after the tasks already queued
    pub(crate) fn shutdown(&self) {
        let _ = self.inner.sender.send(LoopMessage::Shutdown);
    }

    /// Install this context as the calling thread's current context
    pub(crate) fn enter(&self) {
        CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));
    }

    pub(crate) fn exit() {
        CURRENT.with(|current| current.borrow_mut().take());
    }

    pub(crate) fn mark_busy(&self) {
        let since = elapsed_ms(self.inner.epoch).saturating_add(1);
        self.inner.busy_since.store(since, Ordering::Release);
    }

    pub(crate) fn mark_idle(&self) {
        self.inner.busy_since.store(0, Ordering::Release);
    }

    /// How long the task currently running on this loop has been running
    pub(crate) fn busy_for(&self) -> Option<Duration> {
        match self.inner.busy_since.load(Ordering::Acquire) {
            0 => None,
            since => {
                let now = elapsed_ms(self.inner.epoch).saturating_add(1);
                Some(Duration::from_millis(now.saturating_sub(since)))
            }
        }
    }
}

fn elapsed_ms(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ExecutionContext {}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// The context of the calling thread, if it is an event loop
pub fn current_context() -> Option<ExecutionContext> {
    ExecutionContext::current()
}

/// The runtime owning the calling thread's context
pub fn try_current_runtime() -> Result<Runtime, RuntimeError> {
    ExecutionContext::current()
        .and_then(|context| context.owner())
        .ok_or(RuntimeError::NoCurrentContext)
}

/// The runtime owning the calling thread's context.
///
/// # Panics
///
/// Panics when called off an event loop thread. That is a programmer error,
/// not a condition worth retrying; use [`try_current_runtime`] where the
/// caller can legitimately run on either kind of thread.
pub fn require_current_runtime() -> Runtime {
    match try_current_runtime() {
        Ok(runtime) => runtime,
        Err(err) => panic!("get current runtime error: {}", err),
    }
}
