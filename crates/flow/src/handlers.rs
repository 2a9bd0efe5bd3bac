//! Built-in node handlers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use autoflow_context::{ExecutionContext, PauseReason, ResumeCommand};
use autoflow_core_types::{FlowError, Node};
use autoflow_driver::{DriverFactory, SelectorKind};

use crate::handler::{require_page, run_node_action, HandlerRegistry, NodeHandler};
use crate::scope::{REUSABLE_KIND, TERMINATOR_KIND};
use crate::wait::{execute_waits, WaitOptions};

pub fn builtin_registry(factory: Arc<dyn DriverFactory>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("start", Arc::new(NoopHandler));
    registry.register(REUSABLE_KIND, Arc::new(NoopHandler));
    registry.register(TERMINATOR_KIND, Arc::new(NoopHandler));
    registry.register("openBrowser", Arc::new(OpenBrowserHandler { factory }));
    registry.register("navigate", Arc::new(NavigateHandler));
    registry.register("click", Arc::new(ClickHandler));
    registry.register("typeText", Arc::new(TypeTextHandler));
    registry.register("wait", Arc::new(WaitHandler));
    registry.register("setVariable", Arc::new(SetVariableHandler));
    registry.register("log", Arc::new(LogHandler));
    registry
}

fn require_str(node: &Node, key: &str) -> Result<String, FlowError> {
    node.data
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| FlowError::config(format!("node {} is missing `{key}`", node.id)))
}

fn selector_kind(node: &Node) -> SelectorKind {
    node.data
        .get("selectorKind")
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default()
}

struct NoopHandler;

#[async_trait]
impl NodeHandler for NoopHandler {
    async fn execute(&self, _node: &Node, _ctx: &ExecutionContext) -> Result<(), FlowError> {
        Ok(())
    }
}

/// Creates the execution's page via the driver factory. Every graph that
/// touches a page runs this first.
struct OpenBrowserHandler {
    factory: Arc<dyn DriverFactory>,
}

#[async_trait]
impl NodeHandler for OpenBrowserHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<(), FlowError> {
        let driver = self.factory.create().await.map_err(|err| {
            FlowError::action(format!("node {}: opening browser failed: {err}", node.id))
        })?;
        ctx.set_page(driver);
        Ok(())
    }
}

struct NavigateHandler;

#[async_trait]
impl NodeHandler for NavigateHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<(), FlowError> {
        let url = ctx.interpolate(&require_str(node, "url")?);
        let driver = require_page(node, ctx)?;
        run_node_action(node, ctx, &format!("navigate to {url}"), || {
            let driver = driver.clone();
            let url = url.clone();
            async move {
                driver
                    .navigate(&url)
                    .await
                    .map_err(|err| FlowError::action(format!("navigate to {url} failed: {err}")))
            }
        })
        .await
    }
}

struct ClickHandler;

#[async_trait]
impl NodeHandler for ClickHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<(), FlowError> {
        let selector = ctx.interpolate(&require_str(node, "selector")?);
        let kind = selector_kind(node);
        let driver = require_page(node, ctx)?;
        run_node_action(node, ctx, &format!("click {selector}"), || {
            let driver = driver.clone();
            let selector = selector.clone();
            async move {
                driver
                    .click(&selector, kind)
                    .await
                    .map_err(|err| FlowError::action(format!("click {selector} failed: {err}")))
            }
        })
        .await
    }
}

struct TypeTextHandler;

#[async_trait]
impl NodeHandler for TypeTextHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<(), FlowError> {
        let selector = ctx.interpolate(&require_str(node, "selector")?);
        let text = ctx.interpolate(&require_str(node, "text")?);
        let kind = selector_kind(node);
        let driver = require_page(node, ctx)?;
        run_node_action(node, ctx, &format!("type into {selector}"), || {
            let driver = driver.clone();
            let selector = selector.clone();
            let text = text.clone();
            async move {
                driver
                    .type_text(&selector, kind, &text)
                    .await
                    .map_err(|err| FlowError::action(format!("type into {selector} failed: {err}")))
            }
        })
        .await
    }
}

/// Waits for page conditions, a fixed duration, or (with `pause: true`)
/// suspends the execution until it is resumed from outside.
struct WaitHandler;

#[async_trait]
impl NodeHandler for WaitHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if node.data_flag("pause") {
            let control = ctx.flow_control().ok_or_else(|| {
                FlowError::internal(format!(
                    "node {} paused without flow control attached",
                    node.id
                ))
            })?;
            match control.request_pause(&node.id, PauseReason::WaitPause).await? {
                ResumeCommand::Stop => return Err(FlowError::Stopped),
                ResumeCommand::Skip => return Ok(()),
                ResumeCommand::Continue | ResumeCommand::ContinueWithoutBreakpoint => {}
            }
        }
        let options: WaitOptions = if node.data.is_null() {
            WaitOptions::default()
        } else {
            serde_json::from_value(node.data.clone()).map_err(|err| {
                FlowError::config(format!("node {} wait options: {err}", node.id))
            })?
        };
        if options.is_empty() {
            if let Some(ms) = node.data.get("durationMs").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            return Ok(());
        }
        execute_waits(require_page(node, ctx)?, &options, ctx).await
    }
}

/// Stores a value addressable by user-chosen name, falling back to the node
/// id.
struct SetVariableHandler;

#[async_trait]
impl NodeHandler for SetVariableHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<(), FlowError> {
        let name = node
            .data
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| node.id.0.clone());
        let value = match node.data.get("value").cloned().unwrap_or(Value::Null) {
            Value::String(raw) => Value::String(ctx.interpolate(&raw)),
            other => other,
        };
        ctx.set_variable(name, value);
        Ok(())
    }
}

struct LogHandler;

#[async_trait]
impl NodeHandler for LogHandler {
    async fn execute(&self, node: &Node, ctx: &ExecutionContext) -> Result<(), FlowError> {
        let message =
            ctx.interpolate(node.data.get("message").and_then(Value::as_str).unwrap_or(""));
        info!(target: "workflow", node = %node.id, "{message}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use autoflow_driver::{BrowserDriver, MockDriver};
    use serde_json::json;

    fn ctx_with_page(driver: &Arc<MockDriver>) -> Arc<ExecutionContext> {
        let ctx = ExecutionContext::new();
        let page: Arc<dyn BrowserDriver> = driver.clone();
        ctx.set_page(page);
        ctx
    }

    #[tokio::test]
    async fn click_retries_through_transient_failures() {
        let driver = MockDriver::new();
        driver.fail_clicks(2);
        let ctx = ctx_with_page(&driver);
        let node = Node::new("n1", "click").with_data(json!({
            "selector": "#go",
            "retry": {"enabled": true, "count": 2, "delayMs": 1}
        }));
        ClickHandler.execute(&node, &ctx).await.unwrap();
        assert_eq!(driver.calls().len(), 3);
    }

    #[tokio::test]
    async fn fail_silent_retry_still_raises_a_descriptive_error() {
        let driver = MockDriver::new();
        driver.fail_clicks(10);
        let ctx = ctx_with_page(&driver);
        let node = Node::new("n1", "click").with_data(json!({
            "selector": "#go",
            "retry": {"enabled": true, "count": 1, "delayMs": 1, "failSilently": true}
        }));
        let err = ClickHandler.execute(&node, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("n1"));
    }

    #[tokio::test]
    async fn navigate_without_a_page_is_a_config_error() {
        let ctx = ExecutionContext::new();
        let node = Node::new("n1", "navigate").with_data(json!({"url": "https://example.com"}));
        assert!(matches!(
            NavigateHandler.execute(&node, &ctx).await,
            Err(FlowError::Config(_))
        ));
    }

    #[tokio::test]
    async fn waits_run_before_the_action_by_default() {
        let driver = MockDriver::new();
        let ctx = ctx_with_page(&driver);
        let node = Node::new("n1", "click").with_data(json!({
            "selector": "#go",
            "waits": {"selector": "#missing", "selectorTimeoutMs": 30}
        }));
        assert!(ClickHandler.execute(&node, &ctx).await.is_err());
        // The click never happened behind the failed wait.
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn set_variable_interpolates_and_defaults_its_name() {
        let ctx = ExecutionContext::new();
        ctx.set_data("user", json!("alice"));
        let node = Node::new("v1", "setVariable").with_data(json!({"value": "hi {{user}}"}));
        SetVariableHandler.execute(&node, &ctx).await.unwrap();
        assert_eq!(ctx.variable("v1"), Some(json!("hi alice")));
    }
}
