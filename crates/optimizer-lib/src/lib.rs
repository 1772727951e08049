//! Cost policy controller library
//!
//! This crate provides the core functionality for:
//! - Cost policy data model and policy storage
//! - Scanning a region for orphaned volumes, idle instances and untagged resources
//! - The reconciliation pass and its status state machine
//! - Scheduling passes per policy
//! - Health checks and observability

pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod reconciler;
pub mod scanner;
pub mod scheduler;
pub mod store;

pub use error::{ReconcileError, ScanError, StoreError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
pub use reconciler::{Action, ReconcileConfig, Reconciler};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{InMemoryPolicyStore, PolicyEvent, PolicyStore};
