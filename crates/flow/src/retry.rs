//! Retry policy for node actions: fixed-count with fixed or exponential
//! delays, or loop-until-condition against the live page.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use autoflow_core_types::FlowError;
use autoflow_driver::{BrowserDriver, SelectorKind};

use crate::condition::{observe, ConditionKind, ConditionSpec};

pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_CONDITION_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryStrategy {
    #[default]
    Count,
    UntilCondition,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayStrategy {
    #[default]
    Fixed,
    Exponential,
}

/// The page condition an until-condition retry loops toward.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryCondition {
    pub kind: ConditionKind,
    pub value: String,
    #[serde(default)]
    pub selector_kind: SelectorKind,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryOptions {
    pub enabled: bool,
    pub strategy: RetryStrategy,
    pub count: u32,
    pub condition: Option<RetryCondition>,
    pub delay_ms: u64,
    pub delay_strategy: DelayStrategy,
    pub max_delay_ms: Option<u64>,
    pub fail_silently: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: RetryStrategy::Count,
            count: DEFAULT_RETRY_COUNT,
            condition: None,
            delay_ms: DEFAULT_DELAY_MS,
            delay_strategy: DelayStrategy::Fixed,
            max_delay_ms: None,
            fail_silently: false,
        }
    }
}

/// Delay before retry `attempt` (1-based). Exponential doubles per attempt
/// and is capped by `maxDelayMs` when set.
pub fn compute_delay(options: &RetryOptions, attempt: u32) -> Duration {
    let ms = match options.delay_strategy {
        DelayStrategy::Fixed => options.delay_ms,
        DelayStrategy::Exponential => {
            let shift = attempt.saturating_sub(1).min(32);
            options.delay_ms.saturating_mul(1u64 << shift)
        }
    };
    let ms = match options.max_delay_ms {
        Some(cap) => ms.min(cap),
        None => ms,
    };
    Duration::from_millis(ms)
}

/// Run `operation` under the retry policy. `Ok(None)` means the policy
/// swallowed the failure (fail-silently, or a condition that turned out to be
/// satisfied despite a failing call); callers decide how loud that should be.
pub async fn execute_with_retry<T, F, Fut>(
    operation: F,
    options: &RetryOptions,
    driver: Option<&dyn BrowserDriver>,
) -> Result<Option<T>, FlowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FlowError>>,
{
    if !options.enabled {
        let mut operation = operation;
        return operation().await.map(Some);
    }
    match options.strategy {
        RetryStrategy::Count => retry_count(operation, options).await,
        RetryStrategy::UntilCondition => retry_until(operation, options, driver).await,
    }
}

async fn retry_count<T, F, Fut>(
    mut operation: F,
    options: &RetryOptions,
) -> Result<Option<T>, FlowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FlowError>>,
{
    let attempts = options.count.saturating_add(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(Some(value)),
            // Configuration problems and stop signals never improve on retry.
            Err(err @ (FlowError::Config(_) | FlowError::Stopped)) => return Err(err),
            Err(err) => {
                debug!(target: "flow", attempt, total = attempts, error = %err, "attempt failed");
                last = Some(err);
                if attempt < attempts {
                    sleep(compute_delay(options, attempt)).await;
                }
            }
        }
    }
    match last {
        Some(err) if options.fail_silently => {
            warn!(target: "flow", error = %err, "retries exhausted, failing silently");
            Ok(None)
        }
        Some(err) => Err(err),
        None => Err(FlowError::internal("retry loop finished without an attempt")),
    }
}

async fn retry_until<T, F, Fut>(
    mut operation: F,
    options: &RetryOptions,
    driver: Option<&dyn BrowserDriver>,
) -> Result<Option<T>, FlowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FlowError>>,
{
    let condition = options
        .condition
        .as_ref()
        .ok_or_else(|| FlowError::config("until-condition retry without a condition"))?;
    let driver =
        driver.ok_or_else(|| FlowError::config("until-condition retry requires an open page"))?;
    let spec = ConditionSpec {
        kind: condition.kind,
        expected: condition.value.clone(),
        selector_kind: condition.selector_kind,
        timeout_ms: condition.timeout_ms.unwrap_or(DEFAULT_CONDITION_TIMEOUT_MS),
    };
    let timeout = Duration::from_millis(spec.timeout_ms);
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match operation().await {
            Ok(value) => Ok(value),
            Err(err @ (FlowError::Config(_) | FlowError::Stopped)) => return Err(err),
            Err(err) => Err(err),
        };
        // The condition is probed even after a failing call; the page may
        // already be where the caller wanted it.
        let (holds, observed) = observe(driver, &spec).await;
        match (outcome, holds) {
            (Ok(value), true) => return Ok(Some(value)),
            (Err(err), true) => {
                warn!(
                    target: "flow",
                    attempt, error = %err,
                    "condition satisfied despite failing call"
                );
                return Ok(None);
            }
            (result, false) => {
                if let Err(err) = &result {
                    debug!(target: "flow", attempt, error = %err, "attempt failed, condition unmet");
                }
            }
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            if options.fail_silently {
                warn!(
                    target: "flow",
                    expected = %spec.describe(), observed = %observed,
                    "until-condition timed out, failing silently"
                );
                return Ok(None);
            }
            return Err(FlowError::ConditionTimeout {
                expected: spec.describe(),
                observed,
                timeout_ms: spec.timeout_ms,
            });
        }
        sleep(compute_delay(options, attempt).min(timeout - elapsed)).await;
    }
}
