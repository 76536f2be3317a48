//! Error types for the runtime hub

use std::fmt;

use thiserror::Error;

/// Errors raised synchronously by runtime operations
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Runtime closed: {0}")]
    Closed(String),

    #[error("Invalid instance count {0}, at least one instance is required")]
    InvalidInstanceCount(usize),

    #[error("Failed to spawn event loop thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("Unknown deployment: {0}")]
    UnknownDeployment(String),

    #[error("No execution context is active on the current thread")]
    NoCurrentContext,
}

impl RuntimeError {
    /// Programmer errors are never worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::ThreadSpawn(_))
    }
}

/// A failure raised while running on an execution context.
///
/// The runtime wraps unit start/stop failures and task panics in this type so
/// logs can name the context. Consumers of completions only ever see the
/// wrapped cause; see [`unwrap_cause`].
#[derive(Debug)]
pub struct ContextFailure {
    context: String,
    cause: anyhow::Error,
}

impl ContextFailure {
    pub fn new(context: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            context: context.into(),
            cause,
        }
    }

    /// Name of the context the failure happened on
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn into_cause(self) -> anyhow::Error {
        self.cause
    }
}

impl fmt::Display for ContextFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failure on {}: {}", self.context, self.cause)
    }
}

impl std::error::Error for ContextFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// Strip one level of [`ContextFailure`] wrapping.
///
/// Only the runtime's own wrapper is removed. Errors that were never wrapped,
/// including ones the caller decorated with [`anyhow::Context`], are returned
/// as they are; their chain still leads to the originating cause through
/// [`anyhow::Error::root_cause`].
pub fn unwrap_cause(err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<ContextFailure>() {
        Ok(failure) => failure.into_cause(),
        Err(err) => err,
    }
}

/// Render a caught panic payload as an error
pub(crate) fn panic_error(payload: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    anyhow::anyhow!("panicked: {}", message)
}
