//! URI-based routing of HTTP traffic to destination services.
//!
//! Route tables arrive from the control plane per namespace. Rules are
//! evaluated in table order and the first match wins; table order is the
//! operator's priority.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Global regex cache to avoid recompiling patterns on every request.
static REGEX_CACHE: Lazy<RwLock<HashMap<String, Arc<Regex>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Gets or compiles a regex pattern, caching the result.
fn get_or_compile_regex(pattern: &str) -> Option<Arc<Regex>> {
    {
        let cache = REGEX_CACHE.read();
        if let Some(regex) = cache.get(pattern) {
            return Some(Arc::clone(regex));
        }
    }

    match Regex::new(pattern) {
        Ok(regex) => {
            let regex = Arc::new(regex);
            let mut cache = REGEX_CACHE.write();
            cache.insert(pattern.to_string(), Arc::clone(&regex));
            Some(regex)
        }
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid regex pattern");
            None
        }
    }
}

/// Condition for matching a request URI path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UriMatch {
    /// Path must be exactly this value.
    Exact { path: String },
    /// Path must start with this prefix.
    Prefix { prefix: String },
    /// Path must match this regex pattern.
    Regex { pattern: String },
}

impl UriMatch {
    pub fn exact(path: impl Into<String>) -> Self {
        Self::Exact { path: path.into() }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix {
            prefix: prefix.into(),
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::Regex {
            pattern: pattern.into(),
        }
    }

    /// Checks if the path matches. An uncompilable regex never matches.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            UriMatch::Exact { path: expected } => path == expected,
            UriMatch::Prefix { prefix } => path.starts_with(prefix),
            UriMatch::Regex { pattern } => {
                if let Some(regex) = get_or_compile_regex(pattern) {
                    regex.is_match(path)
                } else {
                    false
                }
            }
        }
    }
}

/// A single routing rule. All listed matches are alternatives; the rule
/// fires when any of them matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// URI conditions; an empty list matches everything.
    #[serde(default)]
    pub matches: Vec<UriMatch>,
    /// Qualified name of the destination service.
    pub destination_service: String,
    /// Destination port override; falls back to the table lookup when unset.
    pub destination_port: Option<u16>,
}

impl RouteRule {
    pub fn new(matches: Vec<UriMatch>, destination_service: impl Into<String>) -> Self {
        Self {
            matches,
            destination_service: destination_service.into(),
            destination_port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.destination_port = Some(port);
        self
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matches.is_empty() || self.matches.iter().any(|m| m.matches(path))
    }
}

/// Result of a route match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub service: String,
    pub port: Option<u16>,
}

/// An ordered rule list for one namespace's gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTable {
    pub namespace: String,
    pub rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(namespace: impl Into<String>, rules: Vec<RouteRule>) -> Self {
        Self {
            namespace: namespace.into(),
            rules,
        }
    }

    /// Returns the destination for a path, first match wins.
    pub fn route(&self, path: &str) -> Option<RouteTarget> {
        for rule in &self.rules {
            if rule.matches(path) {
                debug!(
                    namespace = %self.namespace,
                    service = %rule.destination_service,
                    path = %path,
                    "matched route"
                );
                return Some(RouteTarget {
                    service: rule.destination_service.clone(),
                    port: rule.destination_port,
                });
            }
        }
        debug!(namespace = %self.namespace, path = %path, "no matching route");
        None
    }
}

/// Route configuration as loaded from file or the control plane payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub tables: Vec<RouteTable>,
}

impl RoutingConfig {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }
}

/// Live route tables, keyed by namespace. Tables are swapped whole; a
/// request sees either the old table or the new one, never a mix.
#[derive(Default)]
pub struct RouteStore {
    tables: DashMap<String, Arc<RouteTable>>,
}

impl RouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn swap(&self, table: RouteTable) {
        self.tables.insert(table.namespace.clone(), Arc::new(table));
    }

    pub fn remove(&self, namespace: &str) {
        self.tables.remove(namespace);
    }

    pub fn get(&self, namespace: &str) -> Option<Arc<RouteTable>> {
        self.tables.get(namespace).map(|t| t.value().clone())
    }

    /// Routes a path within a namespace's table, if one is installed.
    pub fn route(&self, namespace: &str, path: &str) -> Option<RouteTarget> {
        self.get(namespace)?.route(path)
    }
}
