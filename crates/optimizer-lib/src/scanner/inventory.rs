//! Inventory-backed scanner
//!
//! Applies the orphaned/idle/tag rules on top of a [`ResourceInventory`].
//! [`FileInventory`] reads a JSON snapshot keyed by region, which is what the
//! controller binary uses when no live provider is wired in.

use super::{
    async_trait, count_untagged, validate_region, ResourceInventory, Scanner, ScannerFactory,
    INSTANCE_STATE_RUNNING, VOLUME_STATE_AVAILABLE,
};
use crate::error::ScanError;
use crate::models::{Instance, Volume};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Resources of a single region
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionInventory {
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

/// Static inventory loaded from a JSON file of the form
/// `{ "regions": { "us-east-1": { "volumes": [...], "instances": [...] } } }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInventory {
    #[serde(default)]
    regions: HashMap<String, RegionInventory>,
}

impl FileInventory {
    pub fn new(regions: HashMap<String, RegionInventory>) -> Self {
        Self { regions }
    }

    /// Load an inventory snapshot from disk
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read inventory from {:?}", path))?;
        let inventory: FileInventory = serde_json::from_slice(&raw)
            .with_context(|| format!("Invalid inventory file {:?}", path))?;
        debug!(regions = inventory.regions.len(), "Loaded resource inventory");
        Ok(inventory)
    }

    pub fn has_region(&self, region: &str) -> bool {
        self.regions.contains_key(region)
    }

    fn region(&self, region: &str) -> Result<&RegionInventory, ScanError> {
        self.regions
            .get(region)
            .ok_or_else(|| ScanError::NoCredentials(region.to_string()))
    }
}

#[async_trait]
impl ResourceInventory for FileInventory {
    async fn describe_volumes(&self, region: &str) -> Result<Vec<Volume>, ScanError> {
        Ok(self.region(region)?.volumes.clone())
    }

    async fn describe_instances(&self, region: &str) -> Result<Vec<Instance>, ScanError> {
        Ok(self.region(region)?.instances.clone())
    }
}

/// Scanner applying the detection rules to an inventory
pub struct InventoryScanner {
    inventory: Arc<dyn ResourceInventory>,
    region: String,
}

impl InventoryScanner {
    pub fn new(inventory: Arc<dyn ResourceInventory>, region: impl Into<String>) -> Self {
        Self {
            inventory,
            region: region.into(),
        }
    }

    async fn running_instances(&self) -> Result<Vec<Instance>, ScanError> {
        let instances = self.inventory.describe_instances(&self.region).await?;
        Ok(instances
            .into_iter()
            .filter(|i| i.state == INSTANCE_STATE_RUNNING)
            .collect())
    }
}

#[async_trait]
impl Scanner for InventoryScanner {
    fn region(&self) -> &str {
        &self.region
    }

    async fn scan_orphaned_volumes(&self) -> Result<Vec<Volume>, ScanError> {
        let volumes = self.inventory.describe_volumes(&self.region).await?;
        Ok(volumes
            .into_iter()
            .filter(|v| v.state == VOLUME_STATE_AVAILABLE)
            .collect())
    }

    // Every running instance is reported; cpuThreshold/monitoringDays are not applied.
    async fn scan_idle_instances(&self) -> Result<Vec<Instance>, ScanError> {
        self.running_instances().await
    }

    async fn scan_untagged_resources(&self, required_tags: &[String]) -> Result<u64, ScanError> {
        let instances = self.running_instances().await?;
        Ok(count_untagged(required_tags, instances.iter().map(|i| &i.tags)))
    }
}

/// Factory handing out [`InventoryScanner`]s for regions the inventory knows about
pub struct InventoryScannerFactory {
    inventory: Arc<FileInventory>,
}

impl InventoryScannerFactory {
    pub fn new(inventory: Arc<FileInventory>) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl ScannerFactory for InventoryScannerFactory {
    async fn connect(&self, region: &str) -> Result<Arc<dyn Scanner>, ScanError> {
        validate_region(region)?;
        if !self.inventory.has_region(region) {
            return Err(ScanError::NoCredentials(region.to_string()));
        }

        let inventory: Arc<dyn ResourceInventory> = self.inventory.clone();
        Ok(Arc::new(InventoryScanner::new(inventory, region)))
    }
}
