//! Client pools bound to event loops
//!
//! A client unit creates its connection pools on the event loop it was
//! deployed to and registers them with a shared [`ClientPoolManager`]. Callers
//! running on one of those loops get the pool bound to their own loop, so a
//! client is only ever driven from a single thread.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::anyhow;

use crate::runtime::{ContextId, ExecutionContext};
use crate::unit::{Deployable, UnitContext};

/// Config key of the shared [`ClientPoolManager`]
pub const CLIENT_MGR: &str = "clientMgr";

/// Config key of the number of pools each instance creates
pub const POOL_COUNT: &str = "poolCount";

/// Config key of the client options handed to the pool factory
pub const CLIENT_OPTIONS: &str = "clientOptions";

/// Builds client pools for a [`ClientVerticle`]
pub trait ClientPoolFactory: Send + Sync + 'static {
    type Pool: Send + Sync + 'static;
    type Options: Send + Sync + 'static;

    /// Create a pool; called on the event loop the pool will be bound to
    fn create_pool(options: &Self::Options, context: &ExecutionContext) -> anyhow::Result<Self::Pool>;
}

struct BoundPool<P> {
    context: ContextId,
    pool: Arc<P>,
}

/// Client pools of every instance of a client deployment
pub struct ClientPoolManager<P> {
    pools: RwLock<Vec<BoundPool<P>>>,
    next: AtomicUsize,
}

impl<P: Send + Sync + 'static> ClientPoolManager<P> {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// Register a pool bound to `context`
    pub fn register(&self, context: &ExecutionContext, pool: P) -> Arc<P> {
        let pool = Arc::new(pool);
        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BoundPool {
                context: context.id(),
                pool: Arc::clone(&pool),
            });
        pool
    }

    /// Pool for the caller.
    ///
    /// On an event loop that has pools, one of that loop's pools; anywhere
    /// else, round robin across all pools.
    pub fn find_client_pool(&self) -> Option<Arc<P>> {
        if let Some(context) = ExecutionContext::current() {
            if let Some(pool) = self.find_by_context(context.id()) {
                return Some(pool);
            }
        }
        self.next_pool(|_| true)
    }

    /// A pool bound to the given context, round robin if it has several
    pub fn find_by_context(&self, context: ContextId) -> Option<Arc<P>> {
        self.next_pool(|bound| bound.context == context)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn next_pool(&self, filter: impl Fn(&BoundPool<P>) -> bool) -> Option<Arc<P>> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        let candidates: Vec<&BoundPool<P>> = pools.iter().filter(|bound| filter(*bound)).collect();
        if candidates.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(&candidates[index].pool))
    }
}

impl<P: Send + Sync + 'static> Default for ClientPoolManager<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> std::fmt::Debug for ClientPoolManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.pools.read().map(|pools| pools.len()).unwrap_or(0);
        f.debug_struct("ClientPoolManager").field("pools", &count).finish()
    }
}

/// Deployable unit that creates client pools on its event loop
///
/// Reads [`CLIENT_MGR`], [`POOL_COUNT`] and [`CLIENT_OPTIONS`] from its
/// deployment config at start.
pub struct ClientVerticle<F> {
    _factory: PhantomData<fn() -> F>,
}

impl<F> Default for ClientVerticle<F> {
    fn default() -> Self {
        Self {
            _factory: PhantomData,
        }
    }
}

impl<F: ClientPoolFactory> Deployable for ClientVerticle<F> {
    fn start(&mut self, ctx: &UnitContext) -> anyhow::Result<()> {
        let config = ctx.config();
        let manager = config
            .object::<ClientPoolManager<F::Pool>>(CLIENT_MGR)
            .ok_or_else(|| anyhow!("{} missing from client deployment config", CLIENT_MGR))?;
        let options = config
            .object::<F::Options>(CLIENT_OPTIONS)
            .ok_or_else(|| anyhow!("{} missing from client deployment config", CLIENT_OPTIONS))?;
        let pool_count = config.u64_value(POOL_COUNT).unwrap_or(1);

        for _ in 0..pool_count {
            let pool = F::create_pool(&options, ctx.context())?;
            manager.register(ctx.context(), pool);
        }

        tracing::debug!(
            context = %ctx.context().name(),
            deployment = %ctx.deployment_id(),
            pools = pool_count,
            "Client pools created"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::deploy::{build_deployment_descriptor, deploy_blocking};
    use crate::runtime::{Runtime, RuntimeOptions};
    use crate::unit::UnitType;

    struct EchoOptions {
        endpoint: String,
    }

    struct EchoPool {
        endpoint: String,
        context: ContextId,
    }

    struct EchoFactory;

    impl ClientPoolFactory for EchoFactory {
        type Pool = EchoPool;
        type Options = EchoOptions;

        fn create_pool(options: &EchoOptions, context: &ExecutionContext) -> anyhow::Result<EchoPool> {
            Ok(EchoPool {
                endpoint: options.endpoint.clone(),
                context: context.id(),
            })
        }
    }

    #[test]
    fn test_client_deployment_creates_pools_per_instance() {
        let runtime = Runtime::create("client-pools", RuntimeOptions::default().with_event_loop_pool_size(2)).unwrap();
        let manager = Arc::new(ClientPoolManager::<EchoPool>::new());
        let descriptor = build_deployment_descriptor(
            Arc::clone(&manager),
            2,
            3,
            EchoOptions {
                endpoint: "10.0.0.1:7070".to_string(),
            },
        );

        let outcome = deploy_blocking(&runtime, &UnitType::of::<ClientVerticle<EchoFactory>>(), descriptor);
        assert!(outcome.is_success());
        assert_eq!(manager.pool_count(), 6);

        // On a loop, the pool handed out is bound to that loop
        let context = runtime.contexts()[1].clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let task_manager = Arc::clone(&manager);
        let expected = context.id();
        context
            .run_on_context(move || {
                let pool = task_manager.find_client_pool().unwrap();
                let _ = tx.send((pool.context == expected, pool.endpoint.clone()));
            })
            .unwrap();
        let (bound, endpoint) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(bound);
        assert_eq!(endpoint, "10.0.0.1:7070");
        runtime.close();
    }

    #[test]
    fn test_missing_manager_fails_deployment() {
        let runtime = Runtime::create("client-missing", RuntimeOptions::default().with_event_loop_pool_size(1)).unwrap();

        let outcome = deploy_blocking(
            &runtime,
            &UnitType::of::<ClientVerticle<EchoFactory>>(),
            crate::unit::DeploymentDescriptor::new(1),
        );

        assert!(!outcome.is_success());
        assert!(outcome.cause().unwrap().to_string().contains(CLIENT_MGR));
        runtime.close();
    }

    #[test]
    fn test_round_robin_off_loop() {
        let runtime = Runtime::create("client-rr", RuntimeOptions::default().with_event_loop_pool_size(2)).unwrap();
        let manager = ClientPoolManager::new();
        for (i, context) in runtime.contexts().iter().enumerate() {
            manager.register(context, i);
        }

        let first = *manager.find_client_pool().unwrap();
        let second = *manager.find_client_pool().unwrap();
        assert_ne!(first, second);
        assert!(manager.find_by_context(runtime.contexts()[0].id()).is_some());
        runtime.close();
    }

    #[test]
    fn test_empty_manager() {
        let manager = ClientPoolManager::<u8>::new();
        assert!(manager.find_client_pool().is_none());
        assert_eq!(manager.pool_count(), 0);
    }
}
