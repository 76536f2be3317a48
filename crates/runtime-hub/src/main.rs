//! Runtime Hub - boot binary
//!
//! Creates the configured runtime through the registry, deploys a heartbeat
//! unit and runs until interrupted.

use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runtime_hub::{
    deploy_blocking, Deployable, DeploymentDescriptor, HubConfig, RuntimeInitializer, RuntimeRegistry, UnitContext,
    UnitType,
};

/// Logs a line from its event loop at a fixed interval
#[derive(Default)]
struct Heartbeat;

impl Deployable for Heartbeat {
    fn start(&mut self, ctx: &UnitContext) -> Result<()> {
        let context = ctx.context().name().to_string();
        let instance = ctx.instance();
        ctx.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                tracing::info!(context = %context, instance, "Heartbeat");
            }
        });
        Ok(())
    }
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,runtime_hub=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Runtime Hub");

    // Load configuration
    let config = HubConfig::from_env();
    tracing::info!("Configuration loaded: {:?}", config);

    let registry = RuntimeRegistry::new(RuntimeInitializer::from_config(&config));
    let runtime = registry.get_or_create(&config.default_runtime, Some(config.runtime_options()))?;

    let outcome = deploy_blocking(
        &runtime,
        &UnitType::of::<Heartbeat>(),
        DeploymentDescriptor::new(config.heartbeat_instances),
    );
    let deployment = outcome.into_result()?;
    tracing::info!(deployment = %deployment, "Heartbeat deployed");

    // Park the main thread until Ctrl-C
    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    signals.block_on(tokio::signal::ctrl_c())?;

    tracing::info!("Shutting down");
    runtime.close();
    Ok(())
}
