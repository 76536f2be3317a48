//! Event loop runtime
//!
//! This module provides the runtime collaborator everything else builds on:
//! - Event loop threads with ordered task queues
//! - Execution contexts and the ambient current-context lookup
//! - Runtime instances hosting deployable units
//! - The blocked thread checker

pub mod context;
pub mod options;
mod checker;
mod event_loop;
mod instance;

pub use context::{current_context, require_current_runtime, try_current_runtime, ContextId, ExecutionContext};
pub use instance::{Runtime, UndeployHandler};
pub use options::{RuntimeOptions, BLOCKED_THREAD_CHECK_DISABLED_MS, MIN_BLOCKED_THREAD_CHECK_INTERVAL_MS};
