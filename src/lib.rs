//! KubeDB operator
//!
//! Manages the lifecycle of Redis, Memcached and PgBouncer workloads on Kubernetes.
//! Each database kind is reconciled by the same engine: a watch-driven work queue,
//! a finalizer-guarded reconciler that converges owned children, and a dormant
//! protocol that archives a paused database's spec so it can be reactivated later.

pub mod admission;
pub mod config;
pub mod controller;
pub mod crd;
mod error;
pub mod server;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
