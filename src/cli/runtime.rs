use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autoflow_driver::NullDriverFactory;
use autoflow_event_bus::EventHub;
use autoflow_flow::builtin_registry;
use autoflow_scheduler::ExecutionManager;
use autoflow_state_store::JsonFileStore;

use crate::config::Settings;

pub fn init_logging(level: &str, debug: bool) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        level.parse().context("Invalid log level")?
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Wire up a manager backed by the durable JSON store. The null driver stands
/// in until a browser backend is attached.
pub fn build_manager(settings: &Settings) -> Result<Arc<ExecutionManager>> {
    let store = JsonFileStore::new(settings.state_dir())
        .with_context(|| format!("failed to open state dir {}", settings.state_dir().display()))?;
    let events = EventHub::new(settings.event_capacity);
    let factory = Arc::new(NullDriverFactory);
    let registry = Arc::new(builtin_registry(factory.clone()));
    Ok(ExecutionManager::new(
        settings.scheduler_config()?,
        registry,
        factory,
        store,
        events,
    ))
}
