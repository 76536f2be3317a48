//! Deployment manager
//!
//! Deploys units onto anything implementing [`Deployer`], either
//! fire-and-forget or blocking until the deployment has completed.
//!
//! # Deadlock hazard
//!
//! [`deploy_blocking`] parks the calling thread until the deployer reports
//! back. Never call it from one of the target runtime's own event loops: the
//! completion is delivered to the calling context, which is the loop that is
//! blocked, so the wait could never be satisfied. The underlying one-shot
//! receive panics when called from an event loop instead of hanging. Use
//! [`deploy`] from async code or [`deploy_async`] from event loops.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::client::{ClientPoolManager, CLIENT_MGR, CLIENT_OPTIONS, POOL_COUNT};
use crate::error::RuntimeError;
use crate::unit::{DeploymentDescriptor, DeploymentId, UnitConfig, UnitType};

/// Handler notified once a deployment has completed
pub type DeployHandler = Box<dyn FnOnce(anyhow::Result<DeploymentId>) + Send + 'static>;

/// Something that can host deployable units
pub trait Deployer: Send + Sync {
    /// Submit a deployment.
    ///
    /// On `Ok`, `handler` fires exactly once when every instance has started
    /// or the deployment has failed. On `Err` the request was rejected before
    /// it was accepted and `handler` never fires.
    fn deploy(
        &self,
        unit: &UnitType,
        descriptor: DeploymentDescriptor,
        handler: DeployHandler,
    ) -> Result<(), RuntimeError>;
}

/// Outcome of one deployment request
#[derive(Debug)]
pub struct DeploymentOutcome {
    result: anyhow::Result<DeploymentId>,
}

impl DeploymentOutcome {
    pub fn succeeded(deployment_id: DeploymentId) -> Self {
        Self {
            result: Ok(deployment_id),
        }
    }

    pub fn failed(cause: anyhow::Error) -> Self {
        Self { result: Err(cause) }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn deployment_id(&self) -> Option<&DeploymentId> {
        self.result.as_ref().ok()
    }

    /// Why the deployment failed
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> anyhow::Result<DeploymentId> {
        self.result
    }
}

/// The single point a deployment outcome flows through.
///
/// Shared by the deploy handler and the synchronous rejection path; whichever
/// reaches it first wins, every later attempt is ignored.
#[derive(Clone)]
struct Completion {
    sender: Arc<Mutex<Option<oneshot::Sender<DeploymentOutcome>>>>,
    unit: String,
}

impl Completion {
    fn new(unit: &UnitType) -> (Self, oneshot::Receiver<DeploymentOutcome>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            sender: Arc::new(Mutex::new(Some(tx))),
            unit: unit.name().to_string(),
        };
        (completion, rx)
    }

    fn complete(&self, result: anyhow::Result<DeploymentId>) {
        let Some(sender) = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };

        if let Err(err) = &result {
            tracing::error!(unit = %self.unit, "Deploy failed, cause: {:#}", err);
        }
        let _ = sender.send(DeploymentOutcome { result });
    }

    fn handler(&self) -> DeployHandler {
        let completion = self.clone();
        Box::new(move |result| completion.complete(result))
    }
}

/// Submit through a fresh completion point and return its receiving end.
///
/// Only the handler keeps the completion alive afterwards, so a handler that
/// is dropped unfired closes the channel instead of leaving the caller waiting.
fn submit<D>(deployer: &D, unit: &UnitType, descriptor: DeploymentDescriptor) -> oneshot::Receiver<DeploymentOutcome>
where
    D: Deployer + ?Sized,
{
    let (completion, rx) = Completion::new(unit);
    if let Err(err) = deployer.deploy(unit, descriptor, completion.handler()) {
        completion.complete(Err(err.into()));
    }
    rx
}

/// Treat a handler dropped unfired as a failure
fn outcome_from(received: Result<DeploymentOutcome, oneshot::error::RecvError>) -> DeploymentOutcome {
    received.unwrap_or_else(|_| {
        DeploymentOutcome::failed(anyhow::anyhow!("deployment handler dropped without completing"))
    })
}

/// Submit a deployment and return immediately.
///
/// The outcome is only logged: failures at `error`, successes at `debug`.
pub fn deploy_async<D>(deployer: &D, unit: &UnitType, descriptor: DeploymentDescriptor)
where
    D: Deployer + ?Sized,
{
    let unit_name = unit.name().to_string();
    let handler: DeployHandler = Box::new(move |result| match result {
        Ok(id) => tracing::debug!(unit = %unit_name, deployment = %id, "Deployed"),
        Err(err) => tracing::error!(unit = %unit_name, "Deploy failed, cause: {:#}", err),
    });

    if let Err(err) = deployer.deploy(unit, descriptor, handler) {
        tracing::error!(unit = %unit.name(), "Deploy rejected: {}", err);
    }
}

/// Submit a deployment and block the calling thread until it completes.
///
/// Both a synchronous rejection and an asynchronous failure come back as a
/// failed [`DeploymentOutcome`]; there is no timeout.
///
/// # Panics
///
/// Panics when called from within an async runtime, including the event
/// loops of any [`crate::Runtime`]. See the module docs.
pub fn deploy_blocking<D>(deployer: &D, unit: &UnitType, descriptor: DeploymentDescriptor) -> DeploymentOutcome
where
    D: Deployer + ?Sized,
{
    outcome_from(submit(deployer, unit, descriptor).blocking_recv())
}

/// Submit a deployment and wait for it without blocking a thread
pub async fn deploy<D>(deployer: &D, unit: &UnitType, descriptor: DeploymentDescriptor) -> DeploymentOutcome
where
    D: Deployer + ?Sized,
{
    outcome_from(submit(deployer, unit, descriptor).await)
}

/// Descriptor for deploying client units.
///
/// The manager, per-instance pool count and client options travel in the
/// config under [`CLIENT_MGR`], [`POOL_COUNT`] and [`CLIENT_OPTIONS`]. Counts
/// are not validated here.
pub fn build_deployment_descriptor<P, O>(
    manager: Arc<ClientPoolManager<P>>,
    instance_count: usize,
    pool_count_per_instance: usize,
    client_options: O,
) -> DeploymentDescriptor
where
    P: Send + Sync + 'static,
    O: Any + Send + Sync,
{
    let mut config = UnitConfig::new();
    config
        .put_object(CLIENT_MGR, manager)
        .put_value(POOL_COUNT, pool_count_per_instance)
        .put_object(CLIENT_OPTIONS, Arc::new(client_options));

    DeploymentDescriptor::new(instance_count).with_config(config)
}
