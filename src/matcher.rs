//! Request Matcher
//!
//! Decides whether a request is cacheable, what its key is, how long it
//! lives, and whether it invalidates other entries.
//!
//! [`RuleMatcher`] covers the common configurations in one type:
//!
//! - exact or regex selection on the method name
//! - optional positional-parameter constraints (`"0.kind" == "full"`)
//! - per-attribute TTL overrides, combined by element-wise minimum
//! - extra key attributes read from the request's side-channel attributes
//! - expunge rules that purge stored keys after a mutating call succeeds
//!
//! # Example
//!
//! ```rust
//! use service_call_cache::{RuleMatcher, MethodRule, Selector, TtlConfig, RequestMatcher, Request};
//! use serde_json::json;
//!
//! let matcher = RuleMatcher::new()
//!     .rule(
//!         Selector::exact("getUser"),
//!         MethodRule::new(TtlConfig::new(10, 15, 30))
//!             .with_attribute_ttl("realtime", TtlConfig::new(1, 1, 0)),
//!     );
//!
//! let request = Request::new("getUser", vec![json!(7)]);
//! assert!(matcher.is_match(&request));
//! assert_eq!(matcher.get_ttl_config(&request), TtlConfig::new(10, 15, 30));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::call::Request;
use crate::key::CacheKeyBuilder;
use crate::path::{self, ValuePath};

/// `(value, error, grace)` lifetimes in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TtlConfig {
    pub value: u64,
    pub error: u64,
    pub grace: u64,
}

impl TtlConfig {
    pub const ZERO: Self = Self {
        value: 0,
        error: 0,
        grace: 0,
    };

    pub const fn new(value: u64, error: u64, grace: u64) -> Self {
        Self {
            value,
            error,
            grace,
        }
    }

    /// Element-wise minimum
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self {
            value: self.value.min(other.value),
            error: self.error.min(other.error),
            grace: self.grace.min(other.grace),
        }
    }

    /// Store expiry for a successful response
    pub fn value_expiry(&self) -> Duration {
        Duration::from_secs(self.value + self.grace)
    }

    /// Store expiry for an error response
    pub fn error_expiry(&self) -> Duration {
        Duration::from_secs(self.error + self.grace)
    }
}

/// Method-name comparison policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaseSensitivity {
    #[default]
    Sensitive,
    Insensitive,
}

/// How a rule selects methods
#[derive(Debug, Clone)]
pub enum Selector {
    Exact(String),
    Pattern(Regex),
}

impl Selector {
    pub fn exact(method: impl Into<String>) -> Self {
        Self::Exact(method.into())
    }

    /// Regex selector, anchored by the caller if needed
    pub fn pattern(pattern: &str) -> Result<Self> {
        let regex =
            Regex::new(pattern).with_context(|| format!("Invalid method pattern: {pattern}"))?;
        Ok(Self::Pattern(regex))
    }

    fn matches(&self, method: &str, case: CaseSensitivity) -> bool {
        match (self, case) {
            (Self::Exact(name), CaseSensitivity::Sensitive) => name == method,
            (Self::Exact(name), CaseSensitivity::Insensitive) => name.eq_ignore_ascii_case(method),
            (Self::Pattern(regex), CaseSensitivity::Sensitive) => regex.is_match(method),
            (Self::Pattern(regex), CaseSensitivity::Insensitive) => {
                RegexBuilder::new(regex.as_str())
                    .case_insensitive(true)
                    .build()
                    .is_ok_and(|r| r.is_match(method))
            }
        }
    }
}

/// Caching configuration of one method (or method pattern)
#[derive(Debug, Clone)]
pub struct MethodRule {
    fallback: TtlConfig,
    attribute_ttls: Vec<(ValuePath, TtlConfig)>,
    key_attributes: Vec<ValuePath>,
    param_constraints: Vec<(ValuePath, Value)>,
}

impl MethodRule {
    pub fn new(fallback: TtlConfig) -> Self {
        Self {
            fallback,
            attribute_ttls: Vec::new(),
            key_attributes: Vec::new(),
            param_constraints: Vec::new(),
        }
    }

    /// Shorten lifetimes whenever the request carries `attribute`
    ///
    /// Invalid paths are ignored with a warning.
    pub fn with_attribute_ttl(mut self, attribute: &str, ttl: TtlConfig) -> Self {
        if let Some(path) = parse_or_warn(attribute) {
            self.attribute_ttls.push((path, ttl));
        }
        self
    }

    /// Include the request attribute at `path` in the cache key when non-null
    pub fn with_key_attribute(mut self, path: &str) -> Self {
        if let Some(path) = parse_or_warn(path) {
            self.key_attributes.push(path);
        }
        self
    }

    /// Only match when the positional parameter at `path` equals `expected`
    pub fn with_param_constraint(mut self, path: &str, expected: Value) -> Self {
        if let Some(path) = parse_or_warn(path) {
            self.param_constraints.push((path, expected));
        }
        self
    }

    fn constraints_hold(&self, request: &Request) -> bool {
        if self.param_constraints.is_empty() {
            return true;
        }
        let params = request.params_value();
        self.param_constraints
            .iter()
            .all(|(path, expected)| path::get_path(&params, path) == Some(expected))
    }
}

fn parse_or_warn(raw: &str) -> Option<ValuePath> {
    match ValuePath::parse(raw) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::warn!(path = %raw, error = %e, "Ignoring invalid matcher path");
            None
        }
    }
}

type KeyPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Which stored entries a mutating request invalidates
///
/// `pattern` is a glob over unprefixed cache keys (`*`, `?`); `predicate`
/// narrows the scanned keys further when present.
#[derive(Clone)]
pub struct Expunger {
    pattern: String,
    predicate: Option<KeyPredicate>,
}

impl Expunger {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            predicate: None,
        }
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn accepts(&self, key: &str) -> bool {
        self.predicate.as_ref().is_none_or(|p| p(key))
    }
}

impl fmt::Debug for Expunger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expunger")
            .field("pattern", &self.pattern)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Matcher contract consumed by the cache coordinator
pub trait RequestMatcher: Send + Sync {
    fn is_match(&self, request: &Request) -> bool;

    /// Entries this request invalidates, if it mutates cached state
    fn is_expunger(&self, _request: &Request) -> Option<Expunger> {
        None
    }

    fn get_key(&self, request: &Request) -> String;

    fn get_ttl_config(&self, request: &Request) -> TtlConfig;
}

/// Rule-table matcher; the first matching rule wins
#[derive(Debug, Clone, Default)]
pub struct RuleMatcher {
    rules: Vec<(Selector, MethodRule)>,
    expungers: Vec<(Selector, Expunger)>,
    case: CaseSensitivity,
}

impl RuleMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, selector: Selector, rule: MethodRule) -> Self {
        self.rules.push((selector, rule));
        self
    }

    pub fn expunge(mut self, selector: Selector, expunger: Expunger) -> Self {
        self.expungers.push((selector, expunger));
        self
    }

    pub fn case_sensitivity(mut self, case: CaseSensitivity) -> Self {
        self.case = case;
        self
    }

    fn find_rule(&self, request: &Request) -> Option<&MethodRule> {
        self.rules
            .iter()
            .find(|(selector, rule)| {
                selector.matches(request.method(), self.case) && rule.constraints_hold(request)
            })
            .map(|(_, rule)| rule)
    }
}

impl RequestMatcher for RuleMatcher {
    fn is_match(&self, request: &Request) -> bool {
        self.find_rule(request).is_some()
    }

    fn is_expunger(&self, request: &Request) -> Option<Expunger> {
        self.expungers
            .iter()
            .find(|(selector, _)| selector.matches(request.method(), self.case))
            .map(|(_, expunger)| expunger.clone())
    }

    fn get_key(&self, request: &Request) -> String {
        let mut attributes = BTreeMap::new();
        attributes.insert("params".to_string(), request.params_value());

        if let Some(rule) = self.find_rule(request) {
            for path in &rule.key_attributes {
                if let Some(value) = request.attribute_at(path) {
                    attributes.insert(path.as_str().to_string(), value);
                }
            }
        }

        CacheKeyBuilder::build(request.method(), &attributes)
    }

    fn get_ttl_config(&self, request: &Request) -> TtlConfig {
        let Some(rule) = self.find_rule(request) else {
            return TtlConfig::ZERO;
        };

        rule.attribute_ttls
            .iter()
            .filter(|(path, _)| request.attribute_at(path).is_some())
            .fold(rule.fallback, |acc, (_, ttl)| acc.min(*ttl))
    }
}
