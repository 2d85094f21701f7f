//! Edge proxy data plane for a lightweight service mesh.
//!
//! Transparently intercepts redirected TCP connections, recovers their
//! original destination, resolves the destination service, and relays
//! traffic to a backend instance chosen by the configured load-balancing
//! strategy, including bounded-load consistent hashing.

pub mod admin;
pub mod config;
pub mod error;
pub mod handler;
pub mod hashring;
pub mod interceptor;
pub mod loadbalancer;
pub mod metrics;
pub mod registry;
pub mod ringcache;
pub mod router;
pub mod sync;
