//! Node handler contract, the kind-keyed registry, and the per-node policy
//! envelope (waits, retry) shared by every action handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use autoflow_context::ExecutionContext;
use autoflow_core_types::{FlowError, Node};
use autoflow_driver::{BrowserDriver, DriverFactory};

use crate::retry::{execute_with_retry, RetryOptions};
use crate::wait::{execute_waits, WaitOptions, WaitTiming};

/// One node kind's behavior. Handlers are stateless; everything per-run
/// lives in the context.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<(), FlowError>;
}

/// Policy envelope a node's data may carry alongside its own fields.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodePolicies {
    pub retry: Option<RetryOptions>,
    pub waits: Option<WaitOptions>,
    pub wait_after_operation: bool,
}

pub fn node_policies(node: &Node) -> Result<NodePolicies, FlowError> {
    if node.data.is_null() {
        return Ok(NodePolicies::default());
    }
    serde_json::from_value(node.data.clone())
        .map_err(|err| FlowError::config(format!("node {} policies: {err}", node.id)))
}

pub fn require_page(
    node: &Node,
    ctx: &ExecutionContext,
) -> Result<Arc<dyn BrowserDriver>, FlowError> {
    ctx.page()
        .ok_or_else(|| FlowError::config(format!("node {} needs an open browser page", node.id)))
}

/// Shared action wrapper: waits on the configured side of the operation, the
/// retry policy around it, and a descriptive error when a fail-silent retry
/// came back empty so progress tracking never records a phantom success.
pub async fn run_node_action<F, Fut>(
    node: &Node,
    ctx: &ExecutionContext,
    action_label: &str,
    action: F,
) -> Result<(), FlowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), FlowError>>,
{
    let policies = node_policies(node)?;
    let waits = policies.waits.as_ref().filter(|options| !options.is_empty());
    let timing = if policies.wait_after_operation {
        WaitTiming::After
    } else {
        WaitTiming::Before
    };

    if let Some(options) = waits {
        if timing == WaitTiming::Before {
            execute_waits(require_page(node, ctx)?, options, ctx).await?;
        }
    }

    let driver = ctx.page();
    match &policies.retry {
        Some(retry) if retry.enabled => {
            let outcome = execute_with_retry(action, retry, driver.as_deref()).await?;
            if outcome.is_none() {
                return Err(FlowError::action(format!(
                    "node {} ({action_label}) did not succeed within its retry policy",
                    node.id
                )));
            }
        }
        _ => {
            let mut action = action;
            action().await?;
        }
    }

    if let Some(options) = waits {
        if timing == WaitTiming::After {
            execute_waits(require_page(node, ctx)?, options, ctx).await?;
        }
    }
    Ok(())
}

/// Kind-keyed handler lookup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in node kinds, wired against `factory` for browser
    /// creation.
    pub fn builtin(factory: Arc<dyn DriverFactory>) -> Self {
        crate::handlers::builtin_registry(factory)
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(kind).cloned()
    }
}
