//! Core data models for the cost policy controller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Stable identity of a cost policy
///
/// Usually `namespace/name`, but any unique string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(String);

impl PolicyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build an identity from a namespace and a name
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self(format!("{}/{}", namespace, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PolicyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A cost policy: the unit of reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostPolicy {
    pub id: PolicyId,
    /// Bumped by the store on every write; status writes must name the version they read
    #[serde(default)]
    pub resource_version: u64,
    pub spec: CostPolicySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CostPolicyStatus>,
}

/// Desired state, read-only for the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostPolicySpec {
    /// Cloud region to scan
    #[serde(default)]
    pub region: String,
    /// Cron-like schedule, accepted but not enforced
    #[serde(default)]
    pub scan_schedule: String,
    #[serde(default)]
    pub orphaned_volumes: OrphanedVolumePolicy,
    #[serde(default)]
    pub idle_instances: IdleInstancePolicy,
    #[serde(default)]
    pub tagging_policy: TaggingPolicy,
}

/// Orphaned volume detection settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedVolumePolicy {
    pub enabled: bool,
    /// Accepted but never acted upon; remediation is out of scope
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub max_age_days: u32,
}

/// Idle instance detection settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleInstancePolicy {
    pub enabled: bool,
    #[serde(default)]
    pub cpu_threshold: f64,
    #[serde(default)]
    pub monitoring_days: u32,
    /// Accepted but never acted upon; remediation is out of scope
    #[serde(default)]
    pub auto_stop: bool,
}

/// Tag completeness settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggingPolicy {
    pub enabled: bool,
    #[serde(default)]
    pub required_tags: Vec<String>,
}

/// Reconciliation phase of a policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Scanning,
    Ready,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Scanning => "Scanning",
            Phase::Ready => "Ready",
            Phase::Failed => "Failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state, the only part of a policy the controller writes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostPolicyStatus {
    pub phase: Phase,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub orphaned_volumes: u64,
    #[serde(default)]
    pub idle_instances: u64,
    #[serde(default)]
    pub untagged_resources: u64,
    /// Never computed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_savings: Option<String>,
}

/// Block storage volume as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    /// Provider status, e.g. `available` or `in-use`
    pub state: String,
    #[serde(default)]
    pub size_gib: u64,
    #[serde(default)]
    pub volume_type: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// Compute instance as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    /// Provider state name, e.g. `running` or `stopped`
    pub state: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub launched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}
