//! Cloud resource scanning
//!
//! The reconciler only talks to the [`Scanner`] and [`ScannerFactory`] traits.
//! Provider access sits behind [`ResourceInventory`], so the filtering rules
//! for orphaned volumes, idle instances and tag completeness live here and
//! can be exercised without a cloud account.

mod inventory;


pub use inventory::{FileInventory, InventoryScanner, InventoryScannerFactory, RegionInventory};

use crate::error::ScanError;
use crate::models::{Instance, Volume};
use std::collections::HashMap;
use std::sync::Arc;

pub use async_trait::async_trait;

/// Provider status of a volume that is not attached to anything
pub const VOLUME_STATE_AVAILABLE: &str = "available";

/// Provider state name of a running instance
pub const INSTANCE_STATE_RUNNING: &str = "running";

/// Read-only queries against a single region
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Region this scanner is bound to
    fn region(&self) -> &str;

    /// Volumes that are not attached to any instance
    async fn scan_orphaned_volumes(&self) -> Result<Vec<Volume>, ScanError>;

    /// Instances considered idle
    async fn scan_idle_instances(&self) -> Result<Vec<Instance>, ScanError>;

    /// Number of resources missing at least one of `required_tags`
    async fn scan_untagged_resources(&self, required_tags: &[String]) -> Result<u64, ScanError>;
}

/// Builds scanners bound to a region
#[async_trait]
pub trait ScannerFactory: Send + Sync {
    async fn connect(&self, region: &str) -> Result<Arc<dyn Scanner>, ScanError>;
}

/// Raw provider listing for a region
#[async_trait]
pub trait ResourceInventory: Send + Sync {
    async fn describe_volumes(&self, region: &str) -> Result<Vec<Volume>, ScanError>;

    async fn describe_instances(&self, region: &str) -> Result<Vec<Instance>, ScanError>;
}

/// A resource is untagged if any required key is absent. Values are not inspected.
pub fn is_untagged(required_tags: &[String], tags: &HashMap<String, String>) -> bool {
    required_tags.iter().any(|key| !tags.contains_key(key))
}

/// Count resources failing the tag check, one per resource regardless of how many keys are missing
pub fn count_untagged<'a, I>(required_tags: &[String], tag_sets: I) -> u64
where
    I: IntoIterator<Item = &'a HashMap<String, String>>,
{
    tag_sets
        .into_iter()
        .filter(|tags| is_untagged(required_tags, tags))
        .count() as u64
}

/// Check that a region name looks like a provider region (`us-east-1`, `eu-central-2`)
pub fn validate_region(region: &str) -> Result<(), ScanError> {
    let valid = !region.is_empty()
        && region
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !region.starts_with('-')
        && !region.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(ScanError::InvalidRegion(region.to_string()))
    }
}
