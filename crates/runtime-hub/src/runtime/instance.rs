//! Event loop runtime instances
//!
//! A [`Runtime`] owns a fixed pool of event loops and hosts deployable units
//! on them. Each unit instance is bound to one loop for its whole life, picked
//! round robin at deploy time.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use bytes::Bytes;
use dashmap::DashMap;

use super::checker::BlockedThreadChecker;
use super::context::ExecutionContext;
use super::event_loop::spawn_event_loop;
use super::options::RuntimeOptions;
use crate::bridge::deliver;
use crate::deploy::{DeployHandler, Deployer};
use crate::error::{panic_error, ContextFailure, RuntimeError};
use crate::unit::{Deployable, DeploymentDescriptor, DeploymentId, UnitContext, UnitType};

/// Handler notified once an undeploy has finished
pub type UndeployHandler = Box<dyn FnOnce(anyhow::Result<()>) + Send + 'static>;

/// Handle to a running event loop runtime
///
/// Cheap to clone; every clone refers to the same instance.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    name: String,
    options: RuntimeOptions,
    contexts: OnceLock<Vec<ExecutionContext>>,
    next_context: AtomicUsize,
    deployments: DashMap<DeploymentId, Deployment>,
    closed: AtomicBool,
    files: FileResolver,
    checker: Mutex<Option<BlockedThreadChecker>>,
}

struct Deployment {
    unit: String,
    instances: Vec<UnitInstance>,
}

/// A started unit together with the loop it lives on
struct UnitInstance {
    unit: Arc<Mutex<Box<dyn Deployable>>>,
    ctx: UnitContext,
}

impl UnitInstance {
    /// Run the unit's `stop` on its own loop, reporting the result to `done`
    fn stop<F>(self, done: F)
    where
        F: FnOnce(anyhow::Result<()>) + Send + 'static,
    {
        let context = self.ctx.context().clone();
        let scheduled = context.run_on_context(move || {
            let result = catch_unwind(AssertUnwindSafe(|| {
                let mut unit = self.unit.lock().unwrap_or_else(PoisonError::into_inner);
                unit.stop(&self.ctx)
            }))
            .unwrap_or_else(|payload| Err(panic_error(payload)));

            done(result.map_err(|err| ContextFailure::new(self.ctx.context().name(), err).into()));
        });

        if let Err(err) = scheduled {
            tracing::warn!(context = %context.name(), "Unit could not be stopped: {}", err);
        }
    }
}

impl Runtime {
    /// Create a runtime and start its event loops and blocked thread checker
    pub fn create(name: impl Into<String>, options: RuntimeOptions) -> Result<Self, RuntimeError> {
        let name = name.into();
        let disable_file_caching = options.disable_file_caching.unwrap_or(true);

        let inner = Arc::new(RuntimeInner {
            name: name.clone(),
            options: options.clone(),
            contexts: OnceLock::new(),
            next_context: AtomicUsize::new(0),
            deployments: DashMap::new(),
            closed: AtomicBool::new(false),
            files: FileResolver::new(!disable_file_caching),
            checker: Mutex::new(None),
        });

        let pool_size = options.event_loop_pool_size.max(1);
        let mut contexts = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let loop_name = format!("{}-eventloop-{}", name, index);
            match spawn_event_loop(loop_name, Arc::downgrade(&inner)) {
                Ok((context, _join)) => contexts.push(context),
                Err(err) => {
                    contexts.iter().for_each(ExecutionContext::shutdown);
                    return Err(err);
                }
            }
        }

        let checker = BlockedThreadChecker::start(
            &name,
            contexts.clone(),
            options.blocked_thread_check_interval(),
            options.max_event_loop_execute_time(),
        );
        let checker = match checker {
            Ok(checker) => checker,
            Err(err) => {
                contexts.iter().for_each(ExecutionContext::shutdown);
                return Err(err);
            }
        };
        *inner.checker.lock().unwrap_or_else(PoisonError::into_inner) = Some(checker);
        let _ = inner.contexts.set(contexts);

        tracing::info!(
            runtime = %name,
            event_loops = pool_size,
            file_caching = !disable_file_caching,
            blocked_thread_check = !options.blocked_thread_check_disabled(),
            "Runtime started"
        );

        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Options the runtime was created with
    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    /// All event loop contexts of this runtime
    pub fn contexts(&self) -> &[ExecutionContext] {
        self.inner.contexts.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Next context in round robin order
    pub fn next_context(&self) -> Option<ExecutionContext> {
        let contexts = self.contexts();
        if contexts.is_empty() {
            return None;
        }
        let index = self.inner.next_context.fetch_add(1, Ordering::Relaxed) % contexts.len();
        Some(contexts[index].clone())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same runtime
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Identifiers of all live deployments
    pub fn deployment_ids(&self) -> Vec<DeploymentId> {
        self.inner.deployments.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Unit type name and instance count of a live deployment
    pub fn deployment_info(&self, id: &DeploymentId) -> Option<(String, usize)> {
        self.inner
            .deployments
            .get(id)
            .map(|deployment| (deployment.unit.clone(), deployment.instances.len()))
    }

    /// Stop every instance of a deployment on its own loop.
    ///
    /// `handler` fires once all instances have stopped, on the calling
    /// context if there is one.
    pub fn undeploy(&self, id: &DeploymentId, handler: UndeployHandler) -> Result<(), RuntimeError> {
        let (_, deployment) = self
            .inner
            .deployments
            .remove(id)
            .ok_or_else(|| RuntimeError::UnknownDeployment(id.to_string()))?;

        tracing::info!(runtime = %self.inner.name, deployment = %id, unit = %deployment.unit, "Undeploying");
        stop_all(deployment.instances, ExecutionContext::current(), handler);
        Ok(())
    }

    /// Stop all deployments, then shut the event loops down.
    ///
    /// Returns without waiting; unit `stop` calls run before the loops exit.
    /// Deploys issued after this are rejected.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let ids = self.deployment_ids();
        for id in ids {
            if let Some((_, deployment)) = self.inner.deployments.remove(&id) {
                for instance in deployment.instances {
                    instance.stop(|result| {
                        if let Err(err) = result {
                            tracing::warn!("Unit failed to stop during close: {:#}", err);
                        }
                    });
                }
            }
        }

        self.inner.shutdown_loops();
        tracing::info!(runtime = %self.inner.name, "Runtime closed");
    }

    /// Read a file, caching its bytes unless file caching is disabled
    pub fn resolve_file(&self, path: impl AsRef<Path>) -> std::io::Result<Bytes> {
        self.inner.files.resolve(path.as_ref())
    }

    /// Whether [`Runtime::resolve_file`] caches file contents
    pub fn file_caching_enabled(&self) -> bool {
        self.inner.files.caching
    }
}

impl RuntimeInner {
    /// Publish a started deployment, returning its instance count.
    ///
    /// The closed flag is checked after the insert: a `close` that raced with
    /// it either saw the entry and stopped it, or left it for this call to
    /// take back out and stop.
    fn register_deployment(&self, id: DeploymentId, deployment: Deployment) -> Result<usize, RuntimeError> {
        let instances = deployment.instances.len();
        self.deployments.insert(id.clone(), deployment);

        if self.closed.load(Ordering::Acquire) {
            if let Some((_, deployment)) = self.deployments.remove(&id) {
                for instance in deployment.instances {
                    instance.stop(|_| {});
                }
            }
            return Err(RuntimeError::Closed(self.name.clone()));
        }
        Ok(instances)
    }

    fn shutdown_loops(&self) {
        self.checker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(contexts) = self.contexts.get() {
            contexts.iter().for_each(ExecutionContext::shutdown);
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown_loops();
        }
    }
}

impl Deployer for Runtime {
    fn deploy(
        &self,
        unit: &UnitType,
        descriptor: DeploymentDescriptor,
        handler: DeployHandler,
    ) -> Result<(), RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::Closed(self.inner.name.clone()));
        }
        let instances = descriptor.instances();
        if instances == 0 {
            return Err(RuntimeError::InvalidInstanceCount(instances));
        }

        let deployment_id = DeploymentId::new();
        tracing::debug!(
            runtime = %self.inner.name,
            deployment = %deployment_id,
            unit = %unit.name(),
            instances,
            "Deploying"
        );

        let tracker = Arc::new(StartTracker {
            deployment_id: deployment_id.clone(),
            unit: unit.name().to_string(),
            remaining: AtomicUsize::new(instances),
            state: Mutex::new(StartState::default()),
            handler: Mutex::new(Some(handler)),
            caller: ExecutionContext::current(),
            runtime: Arc::downgrade(&self.inner),
        });

        let config = descriptor.shared_config();
        for index in 0..instances {
            let Some(context) = self.next_context() else {
                tracker.report(Err(RuntimeError::Closed(self.inner.name.clone()).into()));
                continue;
            };

            let unit_ctx = UnitContext::new(deployment_id.clone(), index, context.clone(), Arc::clone(&config));
            let instance = unit.instantiate();
            let task_tracker = Arc::clone(&tracker);
            let scheduled = context.run_on_context(move || {
                task_tracker.report(start_instance(instance, unit_ctx));
            });

            if let Err(err) = scheduled {
                tracker.report(Err(err.into()));
            }
        }

        Ok(())
    }
}

fn start_instance(mut instance: Box<dyn Deployable>, ctx: UnitContext) -> anyhow::Result<UnitInstance> {
    let result = catch_unwind(AssertUnwindSafe(|| instance.start(&ctx)))
        .unwrap_or_else(|payload| Err(panic_error(payload)));

    match result {
        Ok(()) => Ok(UnitInstance {
            unit: Arc::new(Mutex::new(instance)),
            ctx,
        }),
        Err(err) => Err(ContextFailure::new(ctx.context().name(), err).into()),
    }
}

#[derive(Default)]
struct StartState {
    started: Vec<UnitInstance>,
    failure: Option<anyhow::Error>,
}

/// Collects per-instance start results and fires the deploy handler once
struct StartTracker {
    deployment_id: DeploymentId,
    unit: String,
    remaining: AtomicUsize,
    state: Mutex<StartState>,
    handler: Mutex<Option<DeployHandler>>,
    caller: Option<ExecutionContext>,
    runtime: Weak<RuntimeInner>,
}

impl StartTracker {
    fn report(&self, result: anyhow::Result<UnitInstance>) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match result {
                Ok(instance) => state.started.push(instance),
                Err(err) => {
                    if state.failure.is_none() {
                        state.failure = Some(err);
                    }
                }
            }
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let state = std::mem::take(&mut *self.state.lock().unwrap_or_else(PoisonError::into_inner));

        let result = match (state.failure, self.runtime.upgrade()) {
            (None, Some(runtime)) => {
                let deployment = Deployment {
                    unit: self.unit.clone(),
                    instances: state.started,
                };
                match runtime.register_deployment(self.deployment_id.clone(), deployment) {
                    Ok(instances) => {
                        tracing::info!(
                            runtime = %runtime.name,
                            deployment = %self.deployment_id,
                            unit = %self.unit,
                            instances,
                            "Deployment succeeded"
                        );
                        Ok(self.deployment_id.clone())
                    }
                    Err(err) => Err(err.into()),
                }
            }
            (failure, _) => {
                for instance in state.started {
                    instance.stop(|_| {});
                }
                Err(failure.unwrap_or_else(|| anyhow::anyhow!("runtime dropped during deployment")))
            }
        };

        let handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handler) = handler {
            deliver(self.caller.as_ref(), handler, result);
        }
    }
}

/// Stop `instances`, firing `handler` once after the last one
fn stop_all(instances: Vec<UnitInstance>, caller: Option<ExecutionContext>, handler: UndeployHandler) {
    if instances.is_empty() {
        deliver(caller.as_ref(), handler, Ok(()));
        return;
    }

    struct StopTracker {
        remaining: AtomicUsize,
        failure: Mutex<Option<anyhow::Error>>,
        handler: Mutex<Option<UndeployHandler>>,
        caller: Option<ExecutionContext>,
    }

    let tracker = Arc::new(StopTracker {
        remaining: AtomicUsize::new(instances.len()),
        failure: Mutex::new(None),
        handler: Mutex::new(Some(handler)),
        caller,
    });

    for instance in instances {
        let tracker = Arc::clone(&tracker);
        instance.stop(move |result| {
            if let Err(err) = result {
                tracker
                    .failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert(err);
            }
            if tracker.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let failure = tracker.failure.lock().unwrap_or_else(PoisonError::into_inner).take();
                let handler = tracker.handler.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(handler) = handler {
                    let result = match failure {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                    deliver(tracker.caller.as_ref(), handler, result);
                }
            }
        });
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.inner.name)
            .field("event_loops", &self.contexts().len())
            .field("deployments", &self.inner.deployments.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reads files for units, optionally keeping their bytes in memory
struct FileResolver {
    caching: bool,
    cache: DashMap<PathBuf, Bytes>,
}

impl FileResolver {
    fn new(caching: bool) -> Self {
        Self {
            caching,
            cache: DashMap::new(),
        }
    }

    fn resolve(&self, path: &Path) -> std::io::Result<Bytes> {
        if self.caching {
            if let Some(bytes) = self.cache.get(path) {
                return Ok(bytes.clone());
            }
        }

        let bytes = Bytes::from(std::fs::read(path)?);
        if self.caching {
            self.cache.insert(path.to_path_buf(), bytes.clone());
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::deploy::deploy_blocking;

    /// Counts how many instances were stopped
    struct Tracked {
        stopped: Arc<AtomicUsize>,
    }

    impl Deployable for Tracked {
        fn start(&mut self, _ctx: &UnitContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn stop(&mut self, _ctx: &UnitContext) -> anyhow::Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn tracked_unit(stopped: &Arc<AtomicUsize>) -> UnitType {
        let stopped = Arc::clone(stopped);
        UnitType::from_fn("tracked", move || Tracked {
            stopped: Arc::clone(&stopped),
        })
    }

    fn runtime(name: &str, loops: usize) -> Runtime {
        Runtime::create(name, RuntimeOptions::default().with_event_loop_pool_size(loops)).unwrap()
    }

    #[test]
    fn test_instances_spread_round_robin() {
        let runtime = runtime("rt-spread", 2);
        let first = runtime.next_context().unwrap();
        let second = runtime.next_context().unwrap();
        let third = runtime.next_context().unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(first.id(), third.id());
        runtime.close();
    }

    #[test]
    fn test_deployment_registered_and_undeployed() {
        let runtime = runtime("rt-undeploy", 2);
        let stopped = Arc::new(AtomicUsize::new(0));

        let outcome = deploy_blocking(&runtime, &tracked_unit(&stopped), DeploymentDescriptor::new(3));
        let id = outcome.into_result().unwrap();
        assert_eq!(runtime.deployment_ids(), vec![id.clone()]);
        assert_eq!(runtime.deployment_info(&id), Some(("tracked".to_string(), 3)));

        let (tx, rx) = mpsc::channel();
        runtime
            .undeploy(
                &id,
                Box::new(move |result| {
                    let _ = tx.send(result.is_ok());
                }),
            )
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
        assert!(runtime.deployment_ids().is_empty());
        runtime.close();
    }

    #[test]
    fn test_undeploy_unknown_id() {
        let runtime = runtime("rt-unknown", 1);
        let err = runtime
            .undeploy(&DeploymentId::from_string("nope".to_string()), Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownDeployment(_)));
        runtime.close();
    }

    #[test]
    fn test_close_stops_units_and_rejects_deploys() {
        let runtime = runtime("rt-close", 1);
        let stopped = Arc::new(AtomicUsize::new(0));
        let unit = tracked_unit(&stopped);

        assert!(deploy_blocking(&runtime, &unit, DeploymentDescriptor::new(2)).is_success());
        runtime.close();
        assert!(runtime.is_closed());

        let outcome = deploy_blocking(&runtime, &unit, DeploymentDescriptor::new(1));
        assert!(!outcome.is_success());

        // Stops queued before shutdown still run
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stopped.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_runs_on_deploying_loop() {
        let runtime = runtime("rt-caller", 2);
        let stopped = Arc::new(AtomicUsize::new(0));
        let unit = tracked_unit(&stopped);
        let caller = runtime.contexts()[0].clone();

        let (tx, rx) = mpsc::channel();
        let task_runtime = runtime.clone();
        let expected = caller.clone();
        caller
            .run_on_context(move || {
                let handler: DeployHandler = Box::new(move |result| {
                    let on_caller = ExecutionContext::current().as_ref() == Some(&expected);
                    let _ = tx.send((on_caller, result.is_ok()));
                });
                task_runtime
                    .deploy(&unit, DeploymentDescriptor::new(2), handler)
                    .unwrap();
            })
            .unwrap();

        let (on_caller, ok) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(on_caller);
        assert!(ok);
        runtime.close();
    }

    #[test]
    fn test_resolve_file_caching() {
        let path = std::env::temp_dir().join(format!("runtime-hub-{}.txt", DeploymentId::new()));
        std::fs::write(&path, b"first").unwrap();

        let cached = Runtime::create(
            "rt-files-cached",
            RuntimeOptions::default()
                .with_event_loop_pool_size(1)
                .with_disable_file_caching(false),
        )
        .unwrap();
        let uncached = runtime("rt-files-uncached", 1);
        assert!(cached.file_caching_enabled());
        assert!(!uncached.file_caching_enabled());

        assert_eq!(&cached.resolve_file(&path).unwrap()[..], b"first");
        std::fs::write(&path, b"second").unwrap();
        assert_eq!(&cached.resolve_file(&path).unwrap()[..], b"first");
        assert_eq!(&uncached.resolve_file(&path).unwrap()[..], b"second");

        let _ = std::fs::remove_file(&path);
        cached.close();
        uncached.close();
    }

    #[test]
    fn test_registration_after_close_is_rolled_back() {
        let runtime = runtime("rt-late-register", 1);
        let stopped = Arc::new(AtomicUsize::new(0));
        let context = runtime.contexts()[0].clone();
        let config = Arc::new(crate::unit::UnitConfig::new());
        let ctx = UnitContext::new(DeploymentId::new(), 0, context, config);
        let deployment = Deployment {
            unit: "tracked".to_string(),
            instances: vec![UnitInstance {
                unit: Arc::new(Mutex::new(Box::new(Tracked {
                    stopped: Arc::clone(&stopped),
                }) as Box<dyn Deployable>)),
                ctx,
            }],
        };

        // close() has already taken its snapshot of the deployments
        runtime.inner.closed.store(true, Ordering::Release);
        let err = runtime
            .inner
            .register_deployment(DeploymentId::new(), deployment)
            .unwrap_err();

        assert!(matches!(err, RuntimeError::Closed(_)));
        assert!(runtime.deployment_ids().is_empty());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stopped.load(Ordering::SeqCst) < 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        runtime.inner.shutdown_loops();
    }

    struct EventCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventCounter {
        fn on_event(&self, _event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_failed_start_left_to_handler_to_log() {
        use tracing_subscriber::layer::SubscriberExt;

        let runtime = runtime("rt-quiet-failure", 1);
        let (tx, rx) = mpsc::channel();
        let handler: DeployHandler = Box::new(move |result| {
            let _ = tx.send(result.is_err());
        });
        let tracker = StartTracker {
            deployment_id: DeploymentId::new(),
            unit: "tracked".to_string(),
            remaining: AtomicUsize::new(1),
            state: Mutex::new(StartState::default()),
            handler: Mutex::new(Some(handler)),
            caller: None,
            runtime: Arc::downgrade(&runtime.inner),
        };

        let events = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(EventCounter(Arc::clone(&events)));
        tracing::subscriber::with_default(subscriber, || {
            tracker.report(Err(anyhow::anyhow!("port already bound")));
        });

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(events.load(Ordering::SeqCst), 0);
        runtime.close();
    }
}
