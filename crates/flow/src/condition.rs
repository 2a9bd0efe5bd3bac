//! Page condition probes shared by the wait helper and until-condition
//! retries.

use regex::Regex;
use serde::{Deserialize, Serialize};

use autoflow_driver::{BrowserDriver, SelectorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    Selector,
    Url,
    Predicate,
}

/// One fully-resolved condition: what must hold, against which selector
/// dialect, and for how long the caller is willing to wait.
#[derive(Clone, Debug)]
pub struct ConditionSpec {
    pub kind: ConditionKind,
    pub expected: String,
    pub selector_kind: SelectorKind,
    pub timeout_ms: u64,
}

impl ConditionSpec {
    pub fn describe(&self) -> String {
        match self.kind {
            ConditionKind::Selector => format!("selector `{}` visible", self.expected),
            ConditionKind::Url => format!("url matching `{}`", self.expected),
            ConditionKind::Predicate => format!("predicate `{}` true", self.expected),
        }
    }
}

/// Probe the page once. Returns whether the condition currently holds plus a
/// description of what was actually observed, for structured logging and
/// timeout errors. Probe failures count as unmet, never as errors.
pub async fn observe(driver: &dyn BrowserDriver, spec: &ConditionSpec) -> (bool, String) {
    match spec.kind {
        ConditionKind::Selector => {
            match driver.is_visible(&spec.expected, spec.selector_kind).await {
                Ok(true) => (true, format!("selector `{}` visible", spec.expected)),
                Ok(false) => (false, format!("selector `{}` not visible", spec.expected)),
                Err(err) => (false, format!("selector probe failed: {err}")),
            }
        }
        ConditionKind::Url => match driver.current_url().await {
            Ok(url) => (url_matches(&spec.expected, &url), format!("url `{url}`")),
            Err(err) => (false, format!("url probe failed: {err}")),
        },
        ConditionKind::Predicate => match driver.eval_predicate(&spec.expected).await {
            Ok(value) => (value, format!("predicate returned {value}")),
            Err(err) => (false, format!("predicate probe failed: {err}")),
        },
    }
}

/// Patterns that compile as a regex match as one; anything else falls back to
/// a plain substring check.
pub fn url_matches(pattern: &str, url: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(url),
        Err(_) => url.contains(pattern),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_matching_regex_and_substring() {
        assert!(url_matches(
            r"example\.com/(dash|home)",
            "https://app.example.com/dash"
        ));
        assert!(url_matches("login", "https://example.com/login?next=/"));
        // An invalid regex degrades to substring matching.
        assert!(url_matches("path[", "https://example.com/path["));
        assert!(!url_matches("checkout", "https://example.com/cart"));
    }
}
