//! In-memory policy store

use super::{PolicyEvent, PolicyStore};
use crate::error::StoreError;
use crate::models::{CostPolicy, CostPolicySpec, CostPolicyStatus, PolicyId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::path::Path;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Policy store held in process memory
///
/// Every read goes straight to the map, so callers always see the latest
/// committed version.
pub struct InMemoryPolicyStore {
    policies: DashMap<PolicyId, CostPolicy>,
    events_tx: broadcast::Sender<PolicyEvent>,
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            policies: DashMap::new(),
            events_tx,
        }
    }

    /// Subscribe to policy create/update/delete notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.events_tx.subscribe()
    }

    /// Create a policy or replace its spec, keeping any existing status
    ///
    /// Returns the new resource version.
    pub fn apply(&self, id: PolicyId, spec: CostPolicySpec) -> u64 {
        let version = {
            let mut entry = self
                .policies
                .entry(id.clone())
                .or_insert_with(|| CostPolicy {
                    id: id.clone(),
                    resource_version: 0,
                    spec: spec.clone(),
                    status: None,
                });
            entry.spec = spec;
            entry.resource_version += 1;
            entry.resource_version
        };

        debug!(policy = %id, version, "Applied cost policy");
        let _ = self.events_tx.send(PolicyEvent::Applied(id));
        version
    }

    /// Remove a policy
    pub fn delete(&self, id: &PolicyId) -> Option<CostPolicy> {
        let removed = self.policies.remove(id).map(|(_, v)| v);
        if removed.is_some() {
            debug!(policy = %id, "Deleted cost policy");
            let _ = self.events_tx.send(PolicyEvent::Deleted(id.clone()));
        }
        removed
    }

    /// Current status of a policy, if any
    pub fn status(&self, id: &PolicyId) -> Option<CostPolicyStatus> {
        self.policies.get(id).and_then(|p| p.status.clone())
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn fetch(&self, id: &PolicyId) -> Result<Option<CostPolicy>, StoreError> {
        Ok(self.policies.get(id).map(|p| p.clone()))
    }

    async fn update_status(
        &self,
        id: &PolicyId,
        expected_version: u64,
        status: CostPolicyStatus,
    ) -> Result<u64, StoreError> {
        let mut entry = self
            .policies
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if entry.resource_version != expected_version {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected_version,
                actual: entry.resource_version,
            });
        }

        entry.status = Some(status);
        entry.resource_version += 1;
        Ok(entry.resource_version)
    }

    async fn list_ids(&self) -> Result<Vec<PolicyId>, StoreError> {
        let mut ids: Vec<PolicyId> = self.policies.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Debug, Deserialize)]
struct PolicyManifest {
    id: PolicyId,
    spec: CostPolicySpec,
}

/// Load a JSON array of `{ "id": ..., "spec": {...} }` manifests into the store
pub async fn load_policies(store: &InMemoryPolicyStore, path: &Path) -> Result<usize> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read policies from {:?}", path))?;
    let manifests: Vec<PolicyManifest> = serde_json::from_slice(&raw)
        .with_context(|| format!("Invalid policy file {:?}", path))?;

    let count = manifests.len();
    for manifest in manifests {
        store.apply(manifest.id, manifest.spec);
    }

    info!(count, path = ?path, "Loaded cost policies");
    Ok(count)
}
