//! Bounded-load consistent hash ring over service instances.
//!
//! The key space is divided into a fixed number of partitions. Each member
//! contributes `replication_factor` virtual nodes; partitions are assigned to
//! the nearest virtual node whose owner is below the load cap
//! `ceil(partitions / members) * load`. Membership changes only move the
//! partitions owned by the affected member.

use crate::config::RingConfig;
use crate::error::{ProxyError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hasher;
use twox_hash::XxHash64;

fn hash64(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// One backend instance participating in a ring.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceInstance {
    pub namespace: String,
    pub name: String,
    pub instance_ip: String,
}

impl ServiceInstance {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        instance_ip: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            instance_ip: instance_ip.into(),
        }
    }

    /// Parses a member key of the form `namespace#name#ip`.
    pub fn from_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(3, '#');
        Some(Self {
            namespace: parts.next()?.to_string(),
            name: parts.next()?.to_string(),
            instance_ip: parts.next()?.to_string(),
        })
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{}", self.namespace, self.name, self.instance_ip)
    }
}

#[derive(Default)]
struct RingState {
    /// Member key → instance.
    members: HashMap<String, ServiceInstance>,
    /// Virtual node hash → member key. BTreeMap gives the sorted ring walk.
    ring: BTreeMap<u64, String>,
    /// Partition id → owning member key.
    partitions: HashMap<u64, String>,
    /// Member key → number of owned partitions.
    loads: HashMap<String, f64>,
}

impl RingState {
    fn distribute(&mut self, config: &RingConfig) {
        self.partitions.clear();
        self.loads.clear();
        if self.members.is_empty() {
            return;
        }
        let avg_load = self.average_load(config);
        for part_id in 0..config.partition_count as u64 {
            let key = hash64(part_id.to_string().as_bytes());
            self.assign_partition(part_id, key, avg_load);
        }
    }

    fn average_load(&self, config: &RingConfig) -> f64 {
        let per_member = config.partition_count as f64 / self.members.len() as f64;
        (per_member * config.load).ceil()
    }

    fn assign_partition(&mut self, part_id: u64, key: u64, avg_load: f64) {
        // Walk the ring clockwise from the partition's point until a member
        // below the load cap is found. Bounded by the virtual node count.
        let candidates: Vec<String> = self
            .ring
            .range(key..)
            .chain(self.ring.range(..key))
            .map(|(_, member)| member.clone())
            .collect();
        for member in candidates {
            let load = self.loads.entry(member.clone()).or_insert(0.0);
            if *load + 1.0 <= avg_load {
                *load += 1.0;
                self.partitions.insert(part_id, member);
                return;
            }
        }
        // Unreachable while avg_load * members >= partitions, which the
        // ceil above guarantees.
        if let Some((_, member)) = self.ring.iter().next() {
            let member = member.clone();
            *self.loads.entry(member.clone()).or_insert(0.0) += 1.0;
            self.partitions.insert(part_id, member);
        }
    }
}

/// A consistent hash ring for one service. Cheap to share behind an `Arc`.
pub struct HashRing {
    config: RingConfig,
    state: RwLock<RingState>,
}

impl HashRing {
    /// Creates an empty ring. An empty ring is legal; `locate` fails until a
    /// member is added.
    pub fn new(config: RingConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RingState::default()),
        }
    }

    /// Creates a ring pre-populated with the given instances.
    pub fn with_members(config: RingConfig, instances: Vec<ServiceInstance>) -> Self {
        let ring = Self::new(config);
        for instance in instances {
            ring.add(instance);
        }
        ring
    }

    /// Adds a member and redistributes partitions. Re-adding an existing
    /// member is a no-op beyond the redistribution.
    pub fn add(&self, instance: ServiceInstance) {
        let key = instance.to_string();
        let mut state = self.state.write();
        for i in 0..self.config.replication_factor {
            let vnode = hash64(format!("{key}{i}").as_bytes());
            state.ring.insert(vnode, key.clone());
        }
        state.members.insert(key, instance);
        state.distribute(&self.config);
    }

    /// Removes a member and redistributes its partitions. Removing an absent
    /// member is a no-op.
    pub fn remove(&self, key: &str) {
        let mut state = self.state.write();
        if state.members.remove(key).is_none() {
            return;
        }
        for i in 0..self.config.replication_factor {
            let vnode = hash64(format!("{key}{i}").as_bytes());
            state.ring.remove(&vnode);
        }
        state.distribute(&self.config);
    }

    /// Maps a request key to the owning instance.
    pub fn locate(&self, key: &[u8]) -> Result<ServiceInstance> {
        let state = self.state.read();
        if state.members.is_empty() {
            return Err(ProxyError::NoInstance {
                service: String::new(),
            });
        }
        let part_id = hash64(key) % self.config.partition_count as u64;
        let member = state
            .partitions
            .get(&part_id)
            .ok_or_else(|| ProxyError::NoInstance {
                service: String::new(),
            })?;
        // Members and partitions are updated under the same lock.
        Ok(state.members[member].clone())
    }

    /// Keys of all current members, in unspecified order.
    pub fn member_keys(&self) -> Vec<String> {
        self.state.read().members.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
