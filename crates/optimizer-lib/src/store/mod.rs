//! Policy storage
//!
//! The store is the only source of truth for policy specs and the sink for
//! status updates. Reads must be consistent (no cached view) and status
//! writes use optimistic concurrency on `resource_version`.

mod memory;

pub use memory::{load_policies, InMemoryPolicyStore};

use crate::error::StoreError;
use crate::models::{CostPolicy, CostPolicyStatus, PolicyId};
use async_trait::async_trait;

/// Change notifications consumed by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// A policy was created or its spec changed
    Applied(PolicyId),
    /// A policy was removed
    Deleted(PolicyId),
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Consistent read of a policy; `Ok(None)` if it does not exist
    async fn fetch(&self, id: &PolicyId) -> Result<Option<CostPolicy>, StoreError>;

    /// Replace the status of a policy
    ///
    /// Fails with [`StoreError::Conflict`] if the policy's version is no longer
    /// `expected_version`. Returns the new version on success.
    async fn update_status(
        &self,
        id: &PolicyId,
        expected_version: u64,
        status: CostPolicyStatus,
    ) -> Result<u64, StoreError>;

    /// Identities of all known policies
    async fn list_ids(&self) -> Result<Vec<PolicyId>, StoreError>;
}
