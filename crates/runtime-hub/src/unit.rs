//! Deployable units
//!
//! A deployable unit is a piece of logic the runtime instantiates one or more
//! times, each instance bound to an event loop context for its whole life.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::runtime::{ExecutionContext, Runtime};

/// Logic hosted by a runtime
///
/// `start` runs on the instance's event loop. Returning an error fails the
/// whole deployment; the runtime stops the instances that did start.
pub trait Deployable: Send + 'static {
    fn start(&mut self, ctx: &UnitContext) -> anyhow::Result<()>;

    fn stop(&mut self, _ctx: &UnitContext) -> anyhow::Result<()> {
        Ok(())
    }
}

type UnitFactory = dyn Fn() -> Box<dyn Deployable> + Send + Sync;

/// Type identifier plus factory for a deployable unit
#[derive(Clone)]
pub struct UnitType {
    name: String,
    factory: Arc<UnitFactory>,
}

impl UnitType {
    /// Unit type for a `Default`-constructible unit, named after the Rust type
    pub fn of<T: Deployable + Default>() -> Self {
        Self::from_fn(std::any::type_name::<T>(), || T::default())
    }

    /// Unit type built by an arbitrary factory
    pub fn from_fn<T, F>(name: impl Into<String>, factory: F) -> Self
    where
        T: Deployable,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Deployable>),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn instantiate(&self) -> Box<dyn Deployable> {
        (self.factory)()
    }
}

impl fmt::Debug for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitType").field("name", &self.name).finish()
    }
}

/// Identifier handed out for a successful deployment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentId(String);

impl DeploymentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DeploymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration blob handed to every instance of a deployment
///
/// Holds plain JSON values as well as opaque shared objects, such as a client
/// pool manager, that units read back by key at start.
#[derive(Clone, Default)]
pub struct UnitConfig {
    values: JsonMap<String, JsonValue>,
    objects: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl UnitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_value(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn put_object<T: Any + Send + Sync>(&mut self, key: impl Into<String>, object: Arc<T>) -> &mut Self {
        self.objects.insert(key.into(), object);
        self
    }

    pub fn value(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key)
    }

    pub fn u64_value(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(JsonValue::as_u64)
    }

    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(JsonValue::as_str)
    }

    /// Opaque object stored under `key`, if present and of type `T`
    pub fn object<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.objects
            .get(key)
            .cloned()
            .and_then(|object| object.downcast::<T>().ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key) || self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len() + self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for UnitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitConfig")
            .field("values", &self.values)
            .field("objects", &self.objects.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// What to deploy: instance count and configuration
///
/// Immutable once handed to a deployer.
#[derive(Debug, Clone)]
pub struct DeploymentDescriptor {
    instances: usize,
    config: Arc<UnitConfig>,
}

impl DeploymentDescriptor {
    pub fn new(instances: usize) -> Self {
        Self {
            instances,
            config: Arc::new(UnitConfig::new()),
        }
    }

    pub fn with_config(mut self, config: UnitConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn instances(&self) -> usize {
        self.instances
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    pub(crate) fn shared_config(&self) -> Arc<UnitConfig> {
        Arc::clone(&self.config)
    }
}

impl Default for DeploymentDescriptor {
    fn default() -> Self {
        Self::new(1)
    }
}

/// What a unit instance sees of its deployment
#[derive(Clone)]
pub struct UnitContext {
    deployment_id: DeploymentId,
    instance: usize,
    context: ExecutionContext,
    config: Arc<UnitConfig>,
}

impl UnitContext {
    pub(crate) fn new(
        deployment_id: DeploymentId,
        instance: usize,
        context: ExecutionContext,
        config: Arc<UnitConfig>,
    ) -> Self {
        Self {
            deployment_id,
            instance,
            context,
            config,
        }
    }

    pub fn deployment_id(&self) -> &DeploymentId {
        &self.deployment_id
    }

    /// Index of this instance within its deployment
    pub fn instance(&self) -> usize {
        self.instance
    }

    /// The event loop this instance is bound to
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    /// The runtime hosting this instance
    pub fn runtime(&self) -> Option<Runtime> {
        self.context.owner()
    }

    /// Spawn async work on this instance's event loop
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.context.spawn(future)
    }
}

impl fmt::Debug for UnitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitContext")
            .field("deployment_id", &self.deployment_id)
            .field("instance", &self.instance)
            .field("context", &self.context)
            .finish()
    }
}
