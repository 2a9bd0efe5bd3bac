//! The automation-driver boundary. The engine core never talks browser
//! protocol directly; everything funnels through [`BrowserDriver`], and each
//! execution gets its own isolated instance via [`DriverFactory`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone)]
pub enum DriverError {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("driver i/o: {0}")]
    Io(String),
}

/// How a selector string should be interpreted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    #[default]
    Css,
    Xpath,
    Text,
}

/// The narrow surface node handlers and wait/retry conditions need.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;
    async fn click(&self, selector: &str, kind: SelectorKind) -> Result<(), DriverError>;
    async fn type_text(
        &self,
        selector: &str,
        kind: SelectorKind,
        text: &str,
    ) -> Result<(), DriverError>;
    async fn is_visible(&self, selector: &str, kind: SelectorKind) -> Result<bool, DriverError>;
    async fn current_url(&self) -> Result<String, DriverError>;
    /// Evaluate a boolean expression in the page. Used by predicate
    /// conditions only; the engine never inspects the expression itself.
    async fn eval_predicate(&self, expression: &str) -> Result<bool, DriverError>;
}

/// Creates one isolated driver instance per execution.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn BrowserDriver>, DriverError>;
}

/// Driver that accepts every action and reports everything visible. Stands
/// in where no real browser is attached (dry runs, the CLI default).
#[derive(Debug, Default)]
pub struct NullDriver {
    url: Mutex<String>,
}

#[async_trait]
impl BrowserDriver for NullDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        debug!(target: "driver", url, "null driver navigate");
        *self.url.lock() = url.to_string();
        Ok(())
    }

    async fn click(&self, selector: &str, kind: SelectorKind) -> Result<(), DriverError> {
        debug!(target: "driver", selector, ?kind, "null driver click");
        Ok(())
    }

    async fn type_text(
        &self,
        selector: &str,
        kind: SelectorKind,
        text: &str,
    ) -> Result<(), DriverError> {
        debug!(target: "driver", selector, ?kind, chars = text.len(), "null driver type");
        Ok(())
    }

    async fn is_visible(&self, _selector: &str, _kind: SelectorKind) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.url.lock().clone())
    }

    async fn eval_predicate(&self, _expression: &str) -> Result<bool, DriverError> {
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct NullDriverFactory;

#[async_trait]
impl DriverFactory for NullDriverFactory {
    async fn create(&self) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        Ok(Arc::new(NullDriver::default()))
    }
}

#[derive(Debug, Default)]
struct MockState {
    url: String,
    visible: HashSet<String>,
    visible_after: HashMap<String, Instant>,
    predicates: HashMap<String, bool>,
    failing_clicks: u32,
    calls: Vec<String>,
}

/// Scriptable driver for tests: selectors become visible on a schedule,
/// clicks can be made to fail N times, every call is recorded.
#[derive(Debug, Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_url(&self, url: impl Into<String>) {
        self.state.lock().url = url.into();
    }

    pub fn set_visible(&self, selector: impl Into<String>) {
        self.state.lock().visible.insert(selector.into());
    }

    pub fn set_visible_after(&self, selector: impl Into<String>, delay: Duration) {
        self.state
            .lock()
            .visible_after
            .insert(selector.into(), Instant::now() + delay);
    }

    pub fn set_predicate(&self, expression: impl Into<String>, value: bool) {
        self.state.lock().predicates.insert(expression.into(), value);
    }

    /// The next `count` clicks fail with an element-not-found error.
    pub fn fail_clicks(&self, count: u32) {
        self.state.lock().failing_clicks = count;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.record(format!("navigate:{url}"));
        self.state.lock().url = url.to_string();
        Ok(())
    }

    async fn click(&self, selector: &str, _kind: SelectorKind) -> Result<(), DriverError> {
        self.record(format!("click:{selector}"));
        let mut state = self.state.lock();
        if state.failing_clicks > 0 {
            state.failing_clicks -= 1;
            return Err(DriverError::ElementNotFound(selector.to_string()));
        }
        Ok(())
    }

    async fn type_text(
        &self,
        selector: &str,
        _kind: SelectorKind,
        text: &str,
    ) -> Result<(), DriverError> {
        self.record(format!("type:{selector}:{text}"));
        Ok(())
    }

    async fn is_visible(&self, selector: &str, _kind: SelectorKind) -> Result<bool, DriverError> {
        let state = self.state.lock();
        if state.visible.contains(selector) {
            return Ok(true);
        }
        if let Some(at) = state.visible_after.get(selector) {
            return Ok(Instant::now() >= *at);
        }
        Ok(false)
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.state.lock().url.clone())
    }

    async fn eval_predicate(&self, expression: &str) -> Result<bool, DriverError> {
        Ok(self
            .state
            .lock()
            .predicates
            .get(expression)
            .copied()
            .unwrap_or(false))
    }
}

/// Factory handing out one shared mock, so tests can script the instance an
/// execution will receive.
pub struct MockDriverFactory {
    driver: Arc<MockDriver>,
}

impl MockDriverFactory {
    pub fn new(driver: Arc<MockDriver>) -> Arc<Self> {
        Arc::new(Self { driver })
    }
}

#[async_trait]
impl DriverFactory for MockDriverFactory {
    async fn create(&self) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        Ok(self.driver.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_driver_scripts_visibility_and_failures() {
        let driver = MockDriver::new();
        driver.set_visible("#ready");
        driver.fail_clicks(1);

        assert!(driver.is_visible("#ready", SelectorKind::Css).await.unwrap());
        assert!(!driver.is_visible("#other", SelectorKind::Css).await.unwrap());
        assert!(driver.click("#go", SelectorKind::Css).await.is_err());
        assert!(driver.click("#go", SelectorKind::Css).await.is_ok());
        assert_eq!(driver.calls().len(), 2);
    }

    #[tokio::test]
    async fn mock_driver_delayed_visibility() {
        let driver = MockDriver::new();
        driver.set_visible_after("#late", Duration::from_millis(30));
        assert!(!driver.is_visible("#late", SelectorKind::Css).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(driver.is_visible("#late", SelectorKind::Css).await.unwrap());
    }

    #[tokio::test]
    async fn null_driver_tracks_url() {
        let driver = NullDriver::default();
        driver.navigate("https://example.com").await.unwrap();
        assert_eq!(driver.current_url().await.unwrap(), "https://example.com");
    }
}
