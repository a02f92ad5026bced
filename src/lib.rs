//! GPU Scheduler - annotation-driven Kubernetes placement for GPU workloads
//!
//! Pods opt in by setting `spec.schedulerName: gpu-scheduler` and declaring
//! their desired device topology in the `gpu-scheduling-map` annotation, one
//! line per replica ordinal:
//!
//! ```text
//! 0=node1:0,1
//! 1=node2:2
//! ```
//!
//! Two independent processes cooperate through the pod object alone:
//!
//! - The **scheduler** ([`scheduler`]) watches unscheduled opted-in pods,
//!   resolves each pod's assignment from its own annotation, maps the logical
//!   node name to a physical node via the `gpu-node-name` node label, and
//!   binds the pod there.
//! - The **webhook** ([`webhook`]) mutates opted-in pods at admission time,
//!   injecting `CUDA_VISIBLE_DEVICES` into every container so the runtime
//!   restricts device visibility once the pod starts.
//!
//! # Modules
//!
//! - [`assignment`] - Annotation parsing and replica-ordinal resolution
//! - [`node`] - Logical-to-physical node name resolution
//! - [`binding`] - Pod-to-node binding submission
//! - [`scheduler`] - Watch-driven reconciliation loop with bounded retry
//! - [`webhook`] - Mutating admission handler (JSON Patch construction)
//! - [`health`] - Liveness/readiness endpoints
//! - [`config`] - CLI / environment configuration for both roles
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod assignment;
pub mod binding;
pub mod config;
pub mod error;
pub mod health;
pub mod node;
pub mod scheduler;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Scheduler name pods declare to opt in to GPU placement
pub const SCHEDULER_NAME: &str = "gpu-scheduler";

/// Pod annotation carrying the ordinal -> `logicalNode:deviceList` map
pub const SCHEDULING_MAP_ANNOTATION: &str = "gpu-scheduling-map";

/// Node label mapping a logical GPU node name to the node that carries it
pub const GPU_NODE_LABEL: &str = "gpu-node-name";

/// Environment variable injected into containers to scope device visibility
pub const CUDA_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Default port for the TLS admission webhook
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// Default port for the plain-HTTP health endpoints
pub const DEFAULT_HEALTH_PORT: u16 = 8080;
