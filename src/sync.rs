//! Applies control-plane change events to the proxy's shared state.
//!
//! The control-plane collaborator delivers an ordered stream of typed events
//! per resource kind through a bounded queue. Each kind is drained by its own
//! task, so ordering holds within a kind but not across kinds; every apply
//! below tolerates either arrival order (an endpoints update for a service
//! with no ring yet is a safe no-op on the ring side).

use crate::config::RingConfig;
use crate::hashring::{HashRing, ServiceInstance};
use crate::loadbalancer::{LoadBalancer, TrafficPolicy};
use crate::metrics::Metrics;
use crate::registry::{ServicePort, ServiceRegistry};
use crate::ringcache::RingCache;
use crate::router::{RouteStore, RouteTable};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// Service object change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event_type: EventType,
    /// Qualified name, `namespace.name`.
    pub name: String,
    pub virtual_address: String,
    pub ports: Vec<ServicePort>,
}

/// Endpoint-set change for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsEvent {
    pub event_type: EventType,
    pub service: String,
    /// Instance IPs currently backing the service.
    pub addresses: Vec<String>,
}

/// Traffic-policy change for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationRuleEvent {
    pub event_type: EventType,
    pub service: String,
    pub policy: Option<TrafficPolicy>,
}

/// Gateway route-table change for one namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event_type: EventType,
    pub namespace: String,
    pub table: Option<RouteTable>,
}

/// Wire envelope for a control-plane event of any kind, as delivered over
/// the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlPlaneEvent {
    Service(ServiceEvent),
    Endpoints(EndpointsEvent),
    DestinationRule(DestinationRuleEvent),
    Gateway(GatewayEvent),
}

/// Sending half of the per-kind event queues, handed to the control-plane
/// collaborator.
#[derive(Clone)]
pub struct EventSenders {
    pub services: mpsc::Sender<ServiceEvent>,
    pub endpoints: mpsc::Sender<EndpointsEvent>,
    pub destination_rules: mpsc::Sender<DestinationRuleEvent>,
    pub gateways: mpsc::Sender<GatewayEvent>,
}

impl EventSenders {
    /// Routes an envelope onto the queue for its kind. Returns `false` when
    /// the receiving drain task is gone.
    pub async fn deliver(&self, event: ControlPlaneEvent) -> bool {
        match event {
            ControlPlaneEvent::Service(e) => self.services.send(e).await.is_ok(),
            ControlPlaneEvent::Endpoints(e) => self.endpoints.send(e).await.is_ok(),
            ControlPlaneEvent::DestinationRule(e) => {
                self.destination_rules.send(e).await.is_ok()
            }
            ControlPlaneEvent::Gateway(e) => self.gateways.send(e).await.is_ok(),
        }
    }
}

/// Receiving half, consumed by [`ControlPlaneSync::spawn`].
pub struct EventReceivers {
    pub services: mpsc::Receiver<ServiceEvent>,
    pub endpoints: mpsc::Receiver<EndpointsEvent>,
    pub destination_rules: mpsc::Receiver<DestinationRuleEvent>,
    pub gateways: mpsc::Receiver<GatewayEvent>,
}

/// Creates the bounded per-kind queues.
pub fn event_channels(capacity: usize) -> (EventSenders, EventReceivers) {
    let (service_tx, service_rx) = mpsc::channel(capacity);
    let (endpoints_tx, endpoints_rx) = mpsc::channel(capacity);
    let (rule_tx, rule_rx) = mpsc::channel(capacity);
    let (gateway_tx, gateway_rx) = mpsc::channel(capacity);
    (
        EventSenders {
            services: service_tx,
            endpoints: endpoints_tx,
            destination_rules: rule_tx,
            gateways: gateway_tx,
        },
        EventReceivers {
            services: service_rx,
            endpoints: endpoints_rx,
            destination_rules: rule_rx,
            gateways: gateway_rx,
        },
    )
}

/// Computes the membership delta between a ring's current member keys and a
/// freshly observed key set. Duplicates in the input collapse; an unchanged
/// set yields two empty deltas.
pub fn diff_members(
    old_keys: &HashSet<String>,
    new_keys: &HashSet<String>,
) -> (Vec<String>, Vec<String>) {
    let added = new_keys.difference(old_keys).cloned().collect();
    let removed = old_keys.difference(new_keys).cloned().collect();
    (added, removed)
}

/// Drains control-plane events into the registry, balancer, rings and routes.
pub struct ControlPlaneSync {
    registry: Arc<ServiceRegistry>,
    balancer: Arc<LoadBalancer>,
    rings: Arc<RingCache>,
    routes: Arc<RouteStore>,
    ring_config: RingConfig,
}

impl ControlPlaneSync {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        balancer: Arc<LoadBalancer>,
        rings: Arc<RingCache>,
        routes: Arc<RouteStore>,
        ring_config: RingConfig,
    ) -> Self {
        Self {
            registry,
            balancer,
            rings,
            routes,
            ring_config,
        }
    }

    /// Spawns one drain loop per resource kind. Loops end when the queue
    /// closes or the shutdown signal fires.
    pub fn spawn(
        self: Arc<Self>,
        receivers: EventReceivers,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let EventReceivers {
            mut services,
            mut endpoints,
            mut destination_rules,
            mut gateways,
        } = receivers;

        let mut handles = Vec::with_capacity(4);

        let sync = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = services.recv() => match event {
                        Some(event) => sync.apply_service_event(event),
                        None => break,
                    },
                }
            }
            info!("service event loop stopped");
        }));

        let sync = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = endpoints.recv() => match event {
                        Some(event) => sync.apply_endpoints_event(event),
                        None => break,
                    },
                }
            }
            info!("endpoints event loop stopped");
        }));

        let sync = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = destination_rules.recv() => match event {
                        Some(event) => sync.apply_destination_rule_event(event),
                        None => break,
                    },
                }
            }
            info!("destination rule event loop stopped");
        }));

        let sync = self;
        let mut shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = gateways.recv() => match event {
                        Some(event) => sync.apply_gateway_event(event),
                        None => break,
                    },
                }
            }
            info!("gateway event loop stopped");
        }));

        handles
    }

    pub fn apply_service_event(&self, event: ServiceEvent) {
        match event.event_type {
            EventType::Added | EventType::Modified => {
                self.registry.upsert(crate::registry::ServiceDescriptor::new(
                    event.name,
                    event.virtual_address,
                    event.ports,
                ));
            }
            EventType::Deleted => {
                self.registry.delete(&event.name, &event.virtual_address);
                self.balancer.forget_service(&event.name);
                if self.rings.contains(&event.name) {
                    self.rings.remove(&event.name);
                    Metrics::record_ring_mutation("drop");
                }
            }
        }
    }

    pub fn apply_endpoints_event(&self, event: EndpointsEvent) {
        let addresses = match event.event_type {
            EventType::Deleted => Vec::new(),
            _ => event.addresses,
        };
        self.balancer.set_endpoints(&event.service, addresses.clone());

        // Diff-update the ring only if one exists; a rule for this service
        // may simply not have arrived yet.
        let Some(ring) = self.rings.get(&event.service) else {
            return;
        };
        let Some((namespace, name)) = event.service.split_once('.') else {
            warn!(service = %event.service, "unqualified service name in endpoints event");
            return;
        };
        let new_keys: HashSet<String> = addresses
            .iter()
            .map(|ip| ServiceInstance::new(namespace, name, ip.clone()).to_string())
            .collect();
        let old_keys: HashSet<String> = ring.member_keys().into_iter().collect();
        let (added, removed) = diff_members(&old_keys, &new_keys);
        if added.is_empty() && removed.is_empty() {
            return;
        }
        for key in &removed {
            ring.remove(key);
            Metrics::record_ring_mutation("remove");
        }
        for key in &added {
            if let Some(instance) = ServiceInstance::from_key(key) {
                ring.add(instance);
                Metrics::record_ring_mutation("add");
            }
        }
        debug!(
            service = %event.service,
            added = added.len(),
            removed = removed.len(),
            "ring membership updated"
        );
    }

    pub fn apply_destination_rule_event(&self, event: DestinationRuleEvent) {
        match event.event_type {
            EventType::Added | EventType::Modified => {
                let Some(policy) = event.policy else {
                    warn!(service = %event.service, "destination rule event without policy");
                    return;
                };
                let consistent = policy.is_consistent_hash();
                self.balancer.set_policy(&event.service, policy);
                if consistent {
                    self.ensure_ring(&event.service);
                } else if self.rings.contains(&event.service) {
                    self.rings.remove(&event.service);
                    Metrics::record_ring_mutation("drop");
                }
            }
            EventType::Deleted => {
                self.balancer.remove_policy(&event.service);
                if self.rings.contains(&event.service) {
                    self.rings.remove(&event.service);
                    Metrics::record_ring_mutation("drop");
                }
            }
        }
    }

    pub fn apply_gateway_event(&self, event: GatewayEvent) {
        match event.event_type {
            EventType::Added | EventType::Modified => {
                if let Some(table) = event.table {
                    self.routes.swap(table);
                }
            }
            EventType::Deleted => self.routes.remove(&event.namespace),
        }
    }

    /// Builds a ring from the service's current endpoint set, unless one
    /// already exists. Exactly one concurrent caller installs the ring.
    fn ensure_ring(&self, service: &str) {
        if self.rings.contains(service) {
            return;
        }
        let Some((namespace, name)) = service.split_once('.') else {
            warn!(service = %service, "unqualified service name in destination rule");
            return;
        };
        let instances = self
            .balancer
            .endpoints_of(service)
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .map(|ip| ServiceInstance::new(namespace, name, ip))
            .collect();
        let ring = Arc::new(HashRing::with_members(self.ring_config, instances));
        if self.rings.insert_if_absent(service, ring) {
            Metrics::record_ring_mutation("create");
            info!(service = %service, "consistent hash ring created");
        }
    }
}
