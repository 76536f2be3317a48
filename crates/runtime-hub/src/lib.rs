//! Runtime Hub - named event loop runtimes with blocking deployment
//!
//! This crate provides:
//! - A registry of named runtimes with lazy, at-most-once creation
//! - A runtime initializer applying debug and file caching settings
//! - Fire-and-forget, blocking and async deployment of units
//! - A completion bridge that hands results back to a specific event loop
//! - Client pools bound to the event loops they were created on

pub mod bridge;
pub mod client;
pub mod config;
pub mod deploy;
pub mod error;
pub mod initializer;
pub mod registry;
pub mod runtime;
pub mod unit;

pub mod prelude {
    //! Common imports for code hosting units on a runtime
    pub use crate::bridge::{run_in_context, AsyncCallback};
    pub use crate::deploy::{deploy, deploy_async, deploy_blocking, DeploymentOutcome};
    pub use crate::registry::RuntimeRegistry;
    pub use crate::runtime::{current_context, require_current_runtime, ExecutionContext, Runtime, RuntimeOptions};
    pub use crate::unit::{Deployable, DeploymentDescriptor, UnitConfig, UnitContext, UnitType};
}

// Re-export key types at crate root
pub use bridge::{run_in_context, AsyncCallback};
pub use config::HubConfig;
pub use deploy::{build_deployment_descriptor, deploy, deploy_async, deploy_blocking, Deployer, DeploymentOutcome};
pub use error::{ContextFailure, RuntimeError};
pub use initializer::{FileCachingToggle, RuntimeFactory, RuntimeInitializer};
pub use registry::RuntimeRegistry;
pub use runtime::{current_context, require_current_runtime, try_current_runtime, ExecutionContext, Runtime, RuntimeOptions};
pub use unit::{Deployable, DeploymentDescriptor, DeploymentId, UnitConfig, UnitContext, UnitType};
