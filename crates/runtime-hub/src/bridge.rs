//! Completion bridge
//!
//! Hands a result produced on any thread back to the event loop that is
//! waiting for it. If the caller is already on the target loop the callback
//! runs inline, otherwise it is queued on the target loop and runs there in
//! that loop's task order.

use crate::error::unwrap_cause;
use crate::runtime::ExecutionContext;

/// Receiver of exactly one outcome
///
/// Implemented for every `FnOnce(anyhow::Result<T>)` closure.
pub trait AsyncCallback<T>: Send + 'static {
    fn success(self, value: T);

    fn fail(self, cause: anyhow::Error);
}

impl<T, F> AsyncCallback<T> for F
where
    F: FnOnce(anyhow::Result<T>) + Send + 'static,
{
    fn success(self, value: T) {
        self(Ok(value))
    }

    fn fail(self, cause: anyhow::Error) {
        self(Err(cause))
    }
}

/// Complete `callback` with `result` on `target`.
///
/// Runs inline when the calling thread is `target`'s loop, so the callback has
/// fired by the time this returns. Otherwise the completion is queued on
/// `target` and this returns without waiting. If `target`'s loop has already
/// shut down the callback runs inline rather than being lost.
///
/// A failure reaches the callback with one runtime [`ContextFailure`] layer
/// removed. Context the caller attached with `anyhow` stays on the error.
///
/// [`ContextFailure`]: crate::error::ContextFailure
pub fn run_in_context<T, C>(target: &ExecutionContext, callback: C, result: anyhow::Result<T>)
where
    T: Send + 'static,
    C: AsyncCallback<T>,
{
    if target.is_current() {
        complete(callback, result);
        return;
    }

    let task = Box::new(move || complete(callback, result));
    if let Err(task) = target.schedule(task) {
        tracing::warn!(
            context = %target.name(),
            "Target context is closed, completing on the calling thread"
        );
        task();
    }
}

/// Complete on `target` when there is one, otherwise right here
pub(crate) fn deliver<T, C>(target: Option<&ExecutionContext>, callback: C, result: anyhow::Result<T>)
where
    T: Send + 'static,
    C: AsyncCallback<T>,
{
    match target {
        Some(target) => run_in_context(target, callback, result),
        None => complete(callback, result),
    }
}

/// Dispatch to exactly one of `success`/`fail`
fn complete<T, C: AsyncCallback<T>>(callback: C, result: anyhow::Result<T>) {
    match result {
        Ok(value) => callback.success(value),
        Err(err) => callback.fail(unwrap_cause(err)),
    }
}
