//! Event loop threads
//!
//! Each loop is a dedicated OS thread running a single-threaded tokio runtime.
//! The loop drains its task queue in order; async work spawned through the
//! context is driven by the same runtime between tasks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Weak;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use super::context::{ExecutionContext, LoopMessage, Task};
use super::instance::RuntimeInner;
use crate::error::{panic_error, RuntimeError};

/// Spawn an event loop thread and return its context
pub(crate) fn spawn_event_loop(
    name: String,
    owner: Weak<RuntimeInner>,
) -> Result<(ExecutionContext, JoinHandle<()>), RuntimeError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let (tx, rx) = mpsc::unbounded_channel();
    let context = ExecutionContext::new(name.clone(), tx, rt.handle().clone(), owner);

    let loop_context = context.clone();
    let join = thread::Builder::new()
        .name(name)
        .spawn(move || run_event_loop(rt, loop_context, rx))?;

    Ok((context, join))
}

fn run_event_loop(
    rt: tokio::runtime::Runtime,
    context: ExecutionContext,
    mut rx: mpsc::UnboundedReceiver<LoopMessage>,
) {
    context.enter();
    tracing::debug!(context = %context.name(), "Event loop started");

    rt.block_on(async {
        while let Some(message) = rx.recv().await {
            match message {
                LoopMessage::Run(task) => run_task(&context, task),
                LoopMessage::Shutdown => break,
            }
        }
    });

    // Anything queued before the channel closed still runs; later sends fail
    // and hand the task back to the sender.
    rx.close();
    while let Ok(message) = rx.try_recv() {
        if let LoopMessage::Run(task) = message {
            run_task(&context, task);
        }
    }

    ExecutionContext::exit();
    drop(rt);
    tracing::debug!(context = %context.name(), "Event loop stopped");
}

fn run_task(context: &ExecutionContext, task: Task) {
    context.mark_busy();
    let result = catch_unwind(AssertUnwindSafe(task));
    context.mark_idle();

    if let Err(payload) = result {
        tracing::error!(
            context = %context.name(),
            "Event loop task failed: {}",
            panic_error(payload)
        );
    }
}
