//! Error types for scanning, policy storage and reconciliation

use thiserror::Error;

/// Errors raised by a scanner or its factory
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    #[error("invalid region {0:?}")]
    InvalidRegion(String),

    #[error("no credentials available for region {0}")]
    NoCredentials(String),

    #[error("{operation} failed: {message}")]
    Query {
        operation: &'static str,
        message: String,
    },
}

impl ScanError {
    pub fn query(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Query {
            operation,
            message: message.into(),
        }
    }
}

/// Errors raised by a policy store
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("policy {0} not found")]
    NotFound(String),

    #[error("policy {id} changed since it was read (expected version {expected}, found {actual})")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("policy store unavailable: {0}")]
    Unavailable(String),
}

/// Terminal error of a reconciliation pass
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A scanner could not be built for the policy's region
    #[error("failed to create scanner: {0}")]
    ScannerInit(#[source] ScanError),

    /// The store rejected a write because the policy changed underneath the pass
    #[error("status update conflict: {0}")]
    Conflict(#[source] StoreError),

    #[error("policy store error: {0}")]
    Store(#[source] StoreError),

    /// The pass ran past its deadline before the final status was written
    #[error("reconciliation cancelled before completion")]
    Cancelled,
}

impl ReconcileError {
    /// Whether the dispatcher should retry soon rather than back off
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Conflict(_) | ReconcileError::Cancelled)
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => ReconcileError::Conflict(err),
            other => ReconcileError::Store(other),
        }
    }
}
