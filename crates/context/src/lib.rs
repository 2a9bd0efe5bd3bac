//! Per-execution shared state: the key/value data store, graph-scoped
//! variables, the active page handle, and the typed pause/resume surface a
//! node handler uses to reach back into its executor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use autoflow_core_types::{FlowError, NodeId};
use autoflow_driver::BrowserDriver;

/// Why an execution is suspended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PauseReason {
    WaitPause,
    Breakpoint,
}

/// How a paused execution is released.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResumeCommand {
    Continue,
    Skip,
    Stop,
    ContinueWithoutBreakpoint,
}

/// Typed pause surface implemented by the executor and handed to node
/// handlers through the context. Replaces an untyped callback stashed in
/// shared state.
#[async_trait]
pub trait FlowControl: Send + Sync {
    /// Suspend graph advancement at `node` until released. Returns the
    /// command the execution was released with.
    async fn request_pause(
        &self,
        node: &NodeId,
        reason: PauseReason,
    ) -> Result<ResumeCommand, FlowError>;
}

#[derive(Default)]
struct ContextState {
    data: HashMap<String, Value>,
    variables: HashMap<String, Value>,
}

/// Execution-scoped shared state, shared via `Arc`; all interior access is
/// lock-guarded.
#[derive(Default)]
pub struct ExecutionContext {
    state: RwLock<ContextState>,
    page: RwLock<Option<Arc<dyn BrowserDriver>>>,
    control: RwLock<Option<Arc<dyn FlowControl>>>,
}

impl ExecutionContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn data(&self, key: &str) -> Option<Value> {
        self.state.read().data.get(key).cloned()
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        self.state.write().data.insert(key.into(), value);
    }

    pub fn remove_data(&self, key: &str) -> Option<Value> {
        self.state.write().data.remove(key)
    }

    /// Variables are addressable by node id or a user-chosen name.
    pub fn variable(&self, key: &str) -> Option<Value> {
        self.state.read().variables.get(key).cloned()
    }

    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.state.write().variables.insert(key.into(), value);
    }

    pub fn variables(&self) -> HashMap<String, Value> {
        self.state.read().variables.clone()
    }

    /// The active browser page, absent until an open-browser node runs.
    pub fn page(&self) -> Option<Arc<dyn BrowserDriver>> {
        self.page.read().clone()
    }

    pub fn set_page(&self, driver: Arc<dyn BrowserDriver>) {
        *self.page.write() = Some(driver);
    }

    pub fn flow_control(&self) -> Option<Arc<dyn FlowControl>> {
        self.control.read().clone()
    }

    pub fn set_flow_control(&self, control: Arc<dyn FlowControl>) {
        *self.control.write() = Some(control);
    }

    /// Substitute `{{key}}` placeholders from data first, then variables.
    /// Unknown keys are left as-is so misconfiguration stays visible.
    pub fn interpolate(&self, template: &str) -> String {
        let state = self.state.read();
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let key = after[..end].trim();
                    let value = state.data.get(key).or_else(|| state.variables.get(key));
                    match value {
                        Some(Value::String(s)) => out.push_str(s),
                        Some(other) => out.push_str(&other.to_string()),
                        None => {
                            out.push_str("{{");
                            out.push_str(&after[..end]);
                            out.push_str("}}");
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str("{{");
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_and_variables_are_independent() {
        let ctx = ExecutionContext::new();
        ctx.set_data("user", json!("alice"));
        ctx.set_variable("user", json!("bob"));
        assert_eq!(ctx.data("user"), Some(json!("alice")));
        assert_eq!(ctx.variable("user"), Some(json!("bob")));
    }

    #[test]
    fn interpolate_prefers_data_over_variables() {
        let ctx = ExecutionContext::new();
        ctx.set_data("name", json!("data-wins"));
        ctx.set_variable("name", json!("variable"));
        ctx.set_variable("count", json!(3));
        assert_eq!(
            ctx.interpolate("{{name}} x{{count}} {{missing}}"),
            "data-wins x3 {{missing}}"
        );
    }

    #[test]
    fn interpolate_handles_unterminated_placeholder() {
        let ctx = ExecutionContext::new();
        assert_eq!(ctx.interpolate("tail {{open"), "tail {{open");
    }
}
