//! Pre/post-action wait conditions: selector visibility, url match and page
//! predicate, each with its own timeout, run in parallel or in sequence.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use autoflow_context::ExecutionContext;
use autoflow_core_types::FlowError;
use autoflow_driver::{BrowserDriver, SelectorKind};

use crate::condition::{observe, ConditionKind, ConditionSpec};

pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 10_000;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    #[default]
    Parallel,
    Sequential,
}

/// Whether a node's waits run before or after its main action.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitTiming {
    #[default]
    Before,
    After,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitOptions {
    pub selector: Option<String>,
    pub selector_kind: SelectorKind,
    pub selector_timeout_ms: Option<u64>,
    pub url: Option<String>,
    pub url_timeout_ms: Option<u64>,
    pub predicate: Option<String>,
    pub predicate_timeout_ms: Option<u64>,
    pub wait_strategy: WaitStrategy,
    pub timing: WaitTiming,
    pub fail_silently: bool,
}

impl WaitOptions {
    pub fn is_empty(&self) -> bool {
        self.selector.is_none() && self.url.is_none() && self.predicate.is_none()
    }

    /// Resolve the configured conditions, interpolating `{{key}}`
    /// placeholders from the execution context.
    fn conditions(&self, ctx: &ExecutionContext) -> Vec<ConditionSpec> {
        let mut specs = Vec::new();
        if let Some(selector) = &self.selector {
            specs.push(ConditionSpec {
                kind: ConditionKind::Selector,
                expected: ctx.interpolate(selector),
                selector_kind: self.selector_kind,
                timeout_ms: self.selector_timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS),
            });
        }
        if let Some(url) = &self.url {
            specs.push(ConditionSpec {
                kind: ConditionKind::Url,
                expected: ctx.interpolate(url),
                selector_kind: SelectorKind::Css,
                timeout_ms: self.url_timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS),
            });
        }
        if let Some(predicate) = &self.predicate {
            specs.push(ConditionSpec {
                kind: ConditionKind::Predicate,
                expected: ctx.interpolate(predicate),
                selector_kind: SelectorKind::Css,
                timeout_ms: self.predicate_timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS),
            });
        }
        specs
    }
}

/// Poll one condition until it holds or its own timeout elapses.
async fn await_condition(
    driver: Arc<dyn BrowserDriver>,
    spec: ConditionSpec,
) -> Result<(), FlowError> {
    let timeout = Duration::from_millis(spec.timeout_ms);
    let started = Instant::now();
    loop {
        let (holds, observed) = observe(driver.as_ref(), &spec).await;
        if holds {
            debug!(
                target: "flow",
                expected = %spec.describe(), observed = %observed,
                "wait condition met"
            );
            return Ok(());
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            warn!(
                target: "flow",
                expected = %spec.describe(), observed = %observed,
                timeout_ms = spec.timeout_ms,
                "wait condition timed out"
            );
            return Err(FlowError::ConditionTimeout {
                expected: spec.describe(),
                observed,
                timeout_ms: spec.timeout_ms,
            });
        }
        sleep(POLL_INTERVAL.min(timeout - elapsed)).await;
    }
}

/// Run the configured waits. Parallel waits all run to completion before the
/// first failure is reported, so a fast failure never cuts short a slower
/// condition still inside its own timeout window.
pub async fn execute_waits(
    driver: Arc<dyn BrowserDriver>,
    options: &WaitOptions,
    ctx: &ExecutionContext,
) -> Result<(), FlowError> {
    let specs = options.conditions(ctx);
    if specs.is_empty() {
        return Ok(());
    }
    let result = match options.wait_strategy {
        WaitStrategy::Parallel => {
            let checks = specs
                .into_iter()
                .map(|spec| await_condition(driver.clone(), spec));
            join_all(checks)
                .await
                .into_iter()
                .collect::<Result<Vec<()>, FlowError>>()
                .map(|_| ())
        }
        WaitStrategy::Sequential => {
            let mut outcome = Ok(());
            for spec in specs {
                if let Err(err) = await_condition(driver.clone(), spec).await {
                    outcome = Err(err);
                    break;
                }
            }
            outcome
        }
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if options.fail_silently => {
            warn!(target: "flow", error = %err, "wait condition failed, continuing");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use autoflow_driver::MockDriver;
    use serde_json::json;

    fn page(driver: &Arc<MockDriver>) -> Arc<dyn BrowserDriver> {
        driver.clone()
    }

    #[tokio::test]
    async fn parallel_failure_is_no_faster_than_the_slower_condition() {
        let driver = MockDriver::new();
        driver.set_url("https://example.com/login");
        driver.set_visible_after("#late", Duration::from_millis(150));
        let ctx = ExecutionContext::new();
        let options = WaitOptions {
            selector: Some("#late".into()),
            selector_timeout_ms: Some(400),
            url: Some("dashboard".into()),
            url_timeout_ms: Some(60),
            ..WaitOptions::default()
        };
        let started = Instant::now();
        let result = execute_waits(page(&driver), &options, &ctx).await;
        assert!(matches!(result, Err(FlowError::ConditionTimeout { .. })));
        // The url check fails at 60ms but the selector check is still
        // legitimately waiting; the combined wait must not report earlier.
        assert!(started.elapsed() >= Duration::from_millis(140));
    }

    #[tokio::test]
    async fn sequential_stops_at_first_failure() {
        let driver = MockDriver::new();
        driver.set_url("https://example.com/cart");
        let ctx = ExecutionContext::new();
        let options = WaitOptions {
            url: Some("checkout".into()),
            url_timeout_ms: Some(40),
            predicate: Some("never-probed".into()),
            predicate_timeout_ms: Some(40),
            wait_strategy: WaitStrategy::Sequential,
            ..WaitOptions::default()
        };
        let started = Instant::now();
        let result = execute_waits(page(&driver), &options, &ctx).await;
        assert!(result.is_err());
        // The predicate behind the failed url check was never awaited.
        assert!(started.elapsed() < Duration::from_millis(75));
    }

    #[tokio::test]
    async fn fail_silently_swallows_timeouts() {
        let driver = MockDriver::new();
        let ctx = ExecutionContext::new();
        let options = WaitOptions {
            selector: Some("#missing".into()),
            selector_timeout_ms: Some(30),
            fail_silently: true,
            ..WaitOptions::default()
        };
        assert!(execute_waits(page(&driver), &options, &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn selectors_are_interpolated_from_the_context() {
        let driver = MockDriver::new();
        driver.set_visible("#submit");
        let ctx = ExecutionContext::new();
        ctx.set_data("button", json!("#submit"));
        let options = WaitOptions {
            selector: Some("{{button}}".into()),
            selector_timeout_ms: Some(200),
            ..WaitOptions::default()
        };
        assert!(execute_waits(page(&driver), &options, &ctx).await.is_ok());
    }
}
