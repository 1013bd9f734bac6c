//! Error types for the cluster store
//!
//! One taxonomy is shared by every layer (index, storage tiers, items and the
//! orchestrator) so that failures cross crate boundaries without re-wrapping.
//!
//! | Variant | Class | Retry |
//! |---------|-------|-------|
//! | InvalidAssignment | programmer error | never |
//! | MissingField | expected miss | statistics compute on demand |
//! | InvalidQuery | programmer error | never |
//! | InconsistentShape | programmer error | never |
//! | StorageIo | environment | a later `generate()` completes missing work |
//! | Corruption | environment | regenerate the affected field |
//! | InvalidConfig | programmer error | never |
//! | Serialization | environment | never |

use crate::types::ClusterId;
use thiserror::Error;

/// Result type for cluster store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// All cluster store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The spike-to-cluster assignment is empty or holds a negative id
    #[error("invalid assignment: {0}")]
    InvalidAssignment(String),

    /// A field was loaded before generation, or was never registered
    #[error("missing field '{field}'{}", cluster_suffix(.cluster))]
    MissingField {
        /// Field name
        field: String,
        /// Cluster the lookup was made for, if any
        cluster: Option<ClusterId>,
    },

    /// Ambiguous or absent selector, or a selector naming unknown ids
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A computed field does not match its declared shape
    #[error("inconsistent shape for '{field}': expected {expected:?}, got {actual:?}")]
    InconsistentShape {
        /// Field name
        field: String,
        /// Declared shape
        expected: Vec<usize>,
        /// Shape actually produced
        actual: Vec<usize>,
    },

    /// Disk read or write failure
    #[error("storage I/O error ({context}): {source}")]
    StorageIo {
        /// What the store was doing
        context: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A chunk file or manifest failed validation
    #[error("corruption: {0}")]
    Corruption(String),

    /// Invalid store configuration or field name
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Manifest or configuration (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn cluster_suffix(cluster: &Option<ClusterId>) -> String {
    match cluster {
        Some(c) => format!(" for cluster {}", c),
        None => String::new(),
    }
}

impl StoreError {
    /// Build a `StorageIo` error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::StorageIo {
            context: context.into(),
            source,
        }
    }

    /// Build a `MissingField` error for one cluster
    pub fn missing(field: impl Into<String>, cluster: ClusterId) -> Self {
        StoreError::MissingField {
            field: field.into(),
            cluster: Some(cluster),
        }
    }

    /// Build a `MissingField` error for an unregistered field
    pub fn unregistered(field: impl Into<String>) -> Self {
        StoreError::MissingField {
            field: field.into(),
            cluster: None,
        }
    }

    /// Check if a later `generate()` may succeed where this failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::StorageIo { .. })
    }

    /// Check if this is a missing-field miss.
    pub fn is_missing_field(&self) -> bool {
        matches!(self, StoreError::MissingField { .. })
    }

    /// Check if this error is a caller bug (fail fast, never retried).
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidAssignment(_)
                | StoreError::InvalidQuery(_)
                | StoreError::InconsistentShape { .. }
                | StoreError::InvalidConfig(_)
        )
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::io("io", e)
    }
}
