//! Instance selection across a service's live endpoints.
//!
//! Strategies are resolved per service from control-plane traffic policies,
//! with a configured default when a policy is missing or names an unknown
//! strategy. Consistent hashing delegates to the service's ring; the other
//! strategies work directly over the endpoint list.

use crate::error::{ProxyError, Result};
use crate::handler::HttpRequestHead;
use crate::metrics::Metrics;
use crate::ringcache::RingCache;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where the consistent-hash key comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HashKeySource {
    /// A named request header (or pseudo-header for raw TCP payloads).
    Header { name: String },
    /// The request host field.
    SourceIdentity,
    /// Declared but not supported; selection fails fast.
    Cookie { name: String },
}

/// Per-service traffic policy delivered by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficPolicy {
    /// Strategy name as declared, e.g. "ROUND_ROBIN".
    pub strategy: String,
    #[serde(default)]
    pub hash_key: Option<HashKeySource>,
}

impl TrafficPolicy {
    pub fn is_consistent_hash(&self) -> bool {
        StrategyKind::parse(&self.strategy) == Some(StrategyKind::ConsistentHash)
    }
}

/// The registered selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RoundRobin,
    Random,
    ConsistentHash,
}

impl StrategyKind {
    /// Parses a declared strategy name; `None` for anything unregistered.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ROUND_ROBIN" => Some(Self::RoundRobin),
            "RANDOM" => Some(Self::Random),
            "CONSISTENT_HASH" => Some(Self::ConsistentHash),
            _ => None,
        }
    }
}

/// Request data available to the key extractor.
pub enum RequestContext<'a> {
    Http(&'a HttpRequestHead),
    Tcp { preread: &'a [u8] },
}

impl RequestContext<'_> {
    /// Looks up a header by name, case-insensitive. For TCP payloads this
    /// scans the pre-read bytes for `Name: value` lines up to the first
    /// blank line.
    fn header(&self, name: &str) -> Option<String> {
        match self {
            RequestContext::Http(head) => head.header(name).map(|v| v.to_string()),
            RequestContext::Tcp { preread } => {
                let text = std::str::from_utf8(preread).ok()?;
                for line in text.lines() {
                    let line = line.trim_end_matches('\r');
                    if line.is_empty() {
                        break;
                    }
                    if let Some((key, value)) = line.split_once(':') {
                        if key.trim().eq_ignore_ascii_case(name) {
                            return Some(value.trim().to_string());
                        }
                    }
                }
                None
            }
        }
    }

    fn host(&self) -> Option<String> {
        match self {
            RequestContext::Http(head) => head.host().map(|v| v.to_string()),
            RequestContext::Tcp { .. } => self.header("host"),
        }
    }
}

/// Picks backend instances for intercepted connections.
pub struct LoadBalancer {
    default_strategy: StrategyKind,
    policies: DashMap<String, TrafficPolicy>,
    endpoints: DashMap<String, Vec<String>>,
    rings: Arc<RingCache>,
    rr_cursors: DashMap<String, Arc<AtomicUsize>>,
}

impl LoadBalancer {
    /// `default_strategy` is the configured fallback name; an unregistered
    /// name here falls back to round robin.
    pub fn new(default_strategy: &str, rings: Arc<RingCache>) -> Self {
        let default_strategy = StrategyKind::parse(default_strategy).unwrap_or_else(|| {
            warn!(strategy = %default_strategy, "unknown default strategy, using round robin");
            StrategyKind::RoundRobin
        });
        Self {
            default_strategy,
            policies: DashMap::new(),
            endpoints: DashMap::new(),
            rings,
            rr_cursors: DashMap::new(),
        }
    }

    pub fn set_policy(&self, service: &str, policy: TrafficPolicy) {
        self.policies.insert(service.to_string(), policy);
    }

    pub fn remove_policy(&self, service: &str) {
        self.policies.remove(service);
    }

    pub fn policy(&self, service: &str) -> Option<TrafficPolicy> {
        self.policies.get(service).map(|p| p.value().clone())
    }

    /// Replaces the live endpoint list for a service.
    pub fn set_endpoints(&self, service: &str, addresses: Vec<String>) {
        self.endpoints.insert(service.to_string(), addresses);
    }

    pub fn remove_endpoints(&self, service: &str) {
        self.endpoints.remove(service);
    }

    /// Drops every per-service entry: endpoints, policy and round-robin
    /// cursor. Called when the service itself goes away, so churn does not
    /// accumulate state.
    pub fn forget_service(&self, service: &str) {
        self.endpoints.remove(service);
        self.policies.remove(service);
        self.rr_cursors.remove(service);
    }

    pub fn endpoints_of(&self, service: &str) -> Vec<String> {
        self.endpoints
            .get(service)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Selects an instance address for one connection.
    pub fn pick(
        &self,
        namespace: &str,
        name: &str,
        _protocol: &str,
        context: &RequestContext<'_>,
    ) -> Result<String> {
        let service = format!("{namespace}.{name}");
        let strategy = self.resolve_strategy(&service);

        match strategy {
            StrategyKind::ConsistentHash => self.pick_consistent(&service, context),
            StrategyKind::RoundRobin | StrategyKind::Random => {
                let addresses = self.endpoints_of(&service);
                if addresses.is_empty() {
                    return Err(ProxyError::NoInstance { service });
                }
                let index = match strategy {
                    StrategyKind::RoundRobin => {
                        let cursor = self
                            .rr_cursors
                            .entry(service.clone())
                            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                            .clone();
                        cursor.fetch_add(1, Ordering::Relaxed) % addresses.len()
                    }
                    StrategyKind::Random => rand::thread_rng().gen_range(0..addresses.len()),
                    StrategyKind::ConsistentHash => unreachable!(),
                };
                debug!(service = %service, instance = %addresses[index], "picked instance");
                Ok(addresses[index].clone())
            }
        }
    }

    fn resolve_strategy(&self, service: &str) -> StrategyKind {
        match self.policies.get(service) {
            Some(policy) => match StrategyKind::parse(&policy.strategy) {
                Some(kind) => kind,
                None => {
                    warn!(
                        service = %service,
                        strategy = %policy.strategy,
                        "unregistered strategy, falling back to default"
                    );
                    Metrics::record_strategy_fallback();
                    self.default_strategy
                }
            },
            None => self.default_strategy,
        }
    }

    fn pick_consistent(&self, service: &str, context: &RequestContext<'_>) -> Result<String> {
        let ring = self.rings.get(service).ok_or_else(|| ProxyError::NoInstance {
            service: service.to_string(),
        })?;
        let key = self.hash_key(service, context)?;
        let instance = ring.locate(key.as_bytes()).map_err(|_| ProxyError::NoInstance {
            service: service.to_string(),
        })?;
        debug!(service = %service, instance = %instance.instance_ip, "picked instance");
        Ok(instance.instance_ip)
    }

    /// Extracts the hash key per the service's policy. A missing header or
    /// host yields the empty key, which still hashes deterministically.
    fn hash_key(&self, service: &str, context: &RequestContext<'_>) -> Result<String> {
        let source = self
            .policies
            .get(service)
            .and_then(|p| p.hash_key.clone())
            .unwrap_or(HashKeySource::SourceIdentity);
        match source {
            HashKeySource::Header { name } => Ok(context.header(&name).unwrap_or_default()),
            HashKeySource::SourceIdentity => Ok(context.host().unwrap_or_default()),
            HashKeySource::Cookie { name } => Err(ProxyError::UnsupportedHashKey(format!(
                "cookie-based hash key {name:?} is not supported"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingConfig;
    use crate::hashring::{HashRing, ServiceInstance};

    fn tcp_context() -> RequestContext<'static> {
        RequestContext::Tcp { preread: b"" }
    }

    fn balancer() -> LoadBalancer {
        LoadBalancer::new("ROUND_ROBIN", Arc::new(RingCache::new()))
    }

    #[test]
    fn test_round_robin_cycles_endpoints() {
        let lb = balancer();
        lb.set_endpoints("default.web", vec!["10.1.0.1".into(), "10.1.0.2".into()]);
        let picks: Vec<String> = (0..4)
            .map(|_| lb.pick("default", "web", "tcp", &tcp_context()).unwrap())
            .collect();
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
        assert_ne!(picks[0], picks[1]);
    }

    #[test]
    fn test_no_endpoints_is_no_instance() {
        let lb = balancer();
        let err = lb.pick("default", "web", "tcp", &tcp_context()).unwrap_err();
        assert!(matches!(err, ProxyError::NoInstance { .. }));
    }

    #[test]
    fn test_random_picks_known_endpoint() {
        let lb = LoadBalancer::new("RANDOM", Arc::new(RingCache::new()));
        lb.set_endpoints("default.web", vec!["10.1.0.1".into(), "10.1.0.2".into()]);
        for _ in 0..20 {
            let pick = lb.pick("default", "web", "tcp", &tcp_context()).unwrap();
            assert!(["10.1.0.1", "10.1.0.2"].contains(&pick.as_str()));
        }
    }

    #[test]
    fn test_unregistered_strategy_falls_back_to_default() {
        let lb = balancer();
        lb.set_endpoints("default.web", vec!["10.1.0.1".into()]);
        lb.set_policy(
            "default.web",
            TrafficPolicy {
                strategy: "LEAST_CONN".into(),
                hash_key: None,
            },
        );
        assert_eq!(
            lb.pick("default", "web", "tcp", &tcp_context()).unwrap(),
            "10.1.0.1"
        );
    }

    #[test]
    fn test_forget_service_clears_round_robin_cursor() {
        let lb = balancer();
        lb.set_endpoints("default.web", vec!["10.1.0.1".into(), "10.1.0.2".into()]);
        lb.set_policy(
            "default.web",
            TrafficPolicy {
                strategy: "ROUND_ROBIN".into(),
                hash_key: None,
            },
        );
        // Advance the cursor past an even boundary.
        let first = lb.pick("default", "web", "tcp", &tcp_context()).unwrap();
        lb.pick("default", "web", "tcp", &tcp_context()).unwrap();
        lb.pick("default", "web", "tcp", &tcp_context()).unwrap();

        lb.forget_service("default.web");
        assert!(lb.endpoints_of("default.web").is_empty());
        assert!(lb.policy("default.web").is_none());

        // A re-created service starts from a fresh cursor.
        lb.set_endpoints("default.web", vec!["10.1.0.1".into(), "10.1.0.2".into()]);
        assert_eq!(
            lb.pick("default", "web", "tcp", &tcp_context()).unwrap(),
            first
        );
    }

    #[test]
    fn test_consistent_hash_header_affinity() {
        let rings = Arc::new(RingCache::new());
        let ring = Arc::new(HashRing::with_members(
            RingConfig::default(),
            vec![
                ServiceInstance::new("default", "web", "10.1.0.1"),
                ServiceInstance::new("default", "web", "10.1.0.2"),
                ServiceInstance::new("default", "web", "10.1.0.3"),
            ],
        ));
        rings.insert_if_absent("default.web", ring);
        let lb = LoadBalancer::new("ROUND_ROBIN", rings);
        lb.set_policy(
            "default.web",
            TrafficPolicy {
                strategy: "CONSISTENT_HASH".into(),
                hash_key: Some(HashKeySource::Header {
                    name: "X-User".into(),
                }),
            },
        );

        let payload = b"GET / HTTP/1.1\r\nHost: web\r\nX-User: alice\r\n\r\n";
        let context = RequestContext::Tcp { preread: payload };
        let first = lb.pick("default", "web", "tcp", &context).unwrap();
        for _ in 0..10 {
            assert_eq!(lb.pick("default", "web", "tcp", &context).unwrap(), first);
        }
    }

    #[test]
    fn test_consistent_hash_without_ring_is_no_instance() {
        let lb = balancer();
        lb.set_policy(
            "default.web",
            TrafficPolicy {
                strategy: "CONSISTENT_HASH".into(),
                hash_key: None,
            },
        );
        let err = lb.pick("default", "web", "tcp", &tcp_context()).unwrap_err();
        assert!(matches!(err, ProxyError::NoInstance { .. }));
    }

    #[test]
    fn test_cookie_hash_key_fails_fast() {
        let rings = Arc::new(RingCache::new());
        rings.insert_if_absent(
            "default.web",
            Arc::new(HashRing::with_members(
                RingConfig::default(),
                vec![ServiceInstance::new("default", "web", "10.1.0.1")],
            )),
        );
        let lb = LoadBalancer::new("ROUND_ROBIN", rings);
        lb.set_policy(
            "default.web",
            TrafficPolicy {
                strategy: "CONSISTENT_HASH".into(),
                hash_key: Some(HashKeySource::Cookie {
                    name: "session".into(),
                }),
            },
        );
        let err = lb.pick("default", "web", "tcp", &tcp_context()).unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedHashKey(_)));
    }
}
