//! Service registry mapping virtual addresses to service metadata.
//!
//! Two maps are kept in lockstep: virtual address → service descriptor, and
//! service name → virtual address. Both are mutated under one lock so no
//! reader ever observes a half-updated pair.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One row of a service's port table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Protocol name ("tcp", "http").
    pub protocol: String,
    /// Port exposed on the virtual address.
    pub port: u16,
    /// Port the backend instances actually listen on.
    pub target_port: u16,
}

impl ServicePort {
    pub fn new(protocol: impl Into<String>, port: u16, target_port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            port,
            target_port,
        }
    }
}

/// Immutable snapshot of a registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Qualified service name, `namespace.name`.
    pub name: String,
    /// Cluster-assigned virtual address.
    pub virtual_address: String,
    /// Ordered port table.
    pub ports: Vec<ServicePort>,
}

impl ServiceDescriptor {
    pub fn new(
        name: impl Into<String>,
        virtual_address: impl Into<String>,
        ports: Vec<ServicePort>,
    ) -> Self {
        Self {
            name: name.into(),
            virtual_address: virtual_address.into(),
            ports,
        }
    }

    /// Splits the qualified name into (namespace, name).
    pub fn split_name(&self) -> Option<(&str, &str)> {
        self.name.split_once('.')
    }
}

/// Outcome of resolving an intercepted destination against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub protocol: String,
    pub namespace: String,
    pub name: String,
    /// Exposed port the connection was addressed to.
    pub port: u16,
    /// Backend port to dial.
    pub target_port: u16,
}

#[derive(Default)]
struct Maps {
    by_address: HashMap<String, Arc<ServiceDescriptor>>,
    address_by_name: HashMap<String, String>,
}

/// Concurrent store of service descriptors keyed by virtual address and name.
///
/// Explicitly constructed and passed by reference; not an ambient global.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<Maps>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a service. If the virtual address changed, the
    /// stale address key is removed in the same critical section.
    pub fn upsert(&self, descriptor: ServiceDescriptor) {
        let mut maps = self.inner.write();
        if let Some(old_addr) = maps.address_by_name.get(&descriptor.name) {
            if *old_addr != descriptor.virtual_address {
                let old_addr = old_addr.clone();
                maps.by_address.remove(&old_addr);
            }
        }
        debug!(service = %descriptor.name, addr = %descriptor.virtual_address, "registry upsert");
        maps.address_by_name
            .insert(descriptor.name.clone(), descriptor.virtual_address.clone());
        maps.by_address
            .insert(descriptor.virtual_address.clone(), Arc::new(descriptor));
    }

    /// Removes a service and its virtual address atomically. Redundant
    /// deletes are not errors.
    pub fn delete(&self, name: &str, virtual_address: &str) {
        let mut maps = self.inner.write();
        maps.address_by_name.remove(name);
        maps.by_address.remove(virtual_address);
        debug!(service = %name, addr = %virtual_address, "registry delete");
    }

    /// Looks up a service by its virtual address.
    pub fn lookup_by_address(&self, virtual_address: &str) -> Option<Arc<ServiceDescriptor>> {
        self.inner.read().by_address.get(virtual_address).cloned()
    }

    /// Looks up a service's virtual address by its qualified name.
    pub fn lookup_address(&self, name: &str) -> Option<String> {
        self.inner.read().address_by_name.get(name).cloned()
    }

    /// Resolves an intercepted destination to a service, protocol and
    /// backend port by matching the destination port against the service's
    /// port table.
    pub fn resolve(&self, virtual_address: &str, port: u16) -> Option<ResolvedService> {
        let descriptor = self.lookup_by_address(virtual_address)?;
        let (namespace, name) = descriptor.split_name()?;
        let entry = descriptor.ports.iter().find(|p| p.port == port)?;
        Some(ResolvedService {
            protocol: entry.protocol.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            port: entry.port,
            target_port: entry.target_port,
        })
    }

    /// Snapshot of every registered descriptor, for the admin dump.
    pub fn dump(&self) -> Vec<ServiceDescriptor> {
        self.inner
            .read()
            .by_address
            .values()
            .map(|d| (**d).clone())
            .collect()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.inner.read().address_by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new(
            "default.web",
            "10.0.0.5",
            vec![
                ServicePort::new("tcp", 80, 8080),
                ServicePort::new("http", 8000, 9000),
            ],
        )
    }

    #[test]
    fn test_upsert_then_lookup_round_trip() {
        let registry = ServiceRegistry::new();
        registry.upsert(web_descriptor());

        let found = registry.lookup_by_address("10.0.0.5").unwrap();
        assert_eq!(found.ports, web_descriptor().ports);
        assert_eq!(registry.lookup_address("default.web").unwrap(), "10.0.0.5");
    }

    #[test]
    fn test_delete_then_lookup_not_found() {
        let registry = ServiceRegistry::new();
        registry.upsert(web_descriptor());
        registry.delete("default.web", "10.0.0.5");

        assert!(registry.lookup_by_address("10.0.0.5").is_none());
        assert!(registry.lookup_address("default.web").is_none());

        // Redundant delete is not an error.
        registry.delete("default.web", "10.0.0.5");
    }

    #[test]
    fn test_upsert_with_changed_address_drops_stale_key() {
        let registry = ServiceRegistry::new();
        registry.upsert(web_descriptor());
        registry.upsert(ServiceDescriptor::new(
            "default.web",
            "10.0.0.6",
            vec![ServicePort::new("tcp", 80, 8080)],
        ));

        assert!(registry.lookup_by_address("10.0.0.5").is_none());
        assert!(registry.lookup_by_address("10.0.0.6").is_some());
        assert_eq!(registry.lookup_address("default.web").unwrap(), "10.0.0.6");
    }

    #[test]
    fn test_resolve_matches_port_row() {
        let registry = ServiceRegistry::new();
        registry.upsert(web_descriptor());

        let resolved = registry.resolve("10.0.0.5", 80).unwrap();
        assert_eq!(resolved.protocol, "tcp");
        assert_eq!(resolved.namespace, "default");
        assert_eq!(resolved.name, "web");
        assert_eq!(resolved.target_port, 8080);

        let resolved = registry.resolve("10.0.0.5", 8000).unwrap();
        assert_eq!(resolved.protocol, "http");
        assert_eq!(resolved.target_port, 9000);

        assert!(registry.resolve("10.0.0.5", 443).is_none());
        assert!(registry.resolve("10.0.0.9", 80).is_none());
    }
}
