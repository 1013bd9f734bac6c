//! Core types for the cluster store
//!
//! - [`ClusterId`] / [`SpikeId`]: identifiers
//! - [`FieldSpec`]: a named per-cluster array with a declared per-spike shape and tier
//! - [`FieldState`]: lifecycle of one (cluster, field) cache entry

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Cluster identifier
///
/// Cluster ids are unique at any point in time but the set changes over the
/// recording's lifetime: merges and splits retire ids and introduce new ones.
pub type ClusterId = u64;

/// Spike identifier (row index into the raw recording arrays)
pub type SpikeId = usize;

/// Per-spike shape of a field (the leading spike dimension excluded)
pub type Shape = SmallVec<[usize; 4]>;

/// Storage tier of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Small derived values cached for the process lifetime
    Memory,
    /// Large per-spike arrays persisted in chunk files
    Disk,
}

/// Lifecycle of a (cluster, field) cache entry
///
/// `Ungenerated -> Generating -> Cached`. Invalidation moves an entry back to
/// `Ungenerated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldState {
    /// Never computed, or invalidated since
    Ungenerated,
    /// A computation for this entry is in flight
    Generating,
    /// Present in its tier
    Cached,
}

/// Declaration of a field owned by a store item
///
/// For disk-tier fields `shape` is the per-spike shape: a cluster's value has
/// shape `(n_spikes, *shape)`. For memory-tier fields `shape` is the shape of
/// the whole per-cluster value; `None` means the shape is only known once the
/// value is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name, also used as the chunk file stem for disk fields
    pub name: String,
    /// Declared shape (see type docs)
    pub shape: Option<Shape>,
    /// Storage tier
    pub tier: Tier,
}

impl FieldSpec {
    /// Declare a disk-tier per-spike field
    pub fn disk(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: Some(Shape::from_slice(shape)),
            tier: Tier::Disk,
        }
    }

    /// Declare a memory-tier per-cluster value with a known shape
    pub fn memory(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: Some(Shape::from_slice(shape)),
            tier: Tier::Memory,
        }
    }

    /// Declare a memory-tier value whose shape is discovered on first compute
    pub fn memory_dynamic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: None,
            tier: Tier::Memory,
        }
    }

    /// Number of scalars per spike (disk fields)
    pub fn row_len(&self) -> Option<usize> {
        self.shape.as_ref().map(|s| s.iter().product())
    }

    /// Full shape of a per-spike array holding `n_rows` spikes
    pub fn rows_shape(&self, n_rows: usize) -> Vec<usize> {
        let mut shape = Vec::with_capacity(1 + self.shape.as_ref().map_or(0, |s| s.len()));
        shape.push(n_rows);
        if let Some(s) = &self.shape {
            shape.extend_from_slice(s);
        }
        shape
    }

    /// Check a per-spike array of `n_rows` rows against the declaration
    pub fn check_rows(&self, actual: &[usize], n_rows: usize) -> Result<()> {
        match &self.shape {
            Some(_) => {
                let expected = self.rows_shape(n_rows);
                if actual != expected.as_slice() {
                    return Err(StoreError::InconsistentShape {
                        field: self.name.clone(),
                        expected,
                        actual: actual.to_vec(),
                    });
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Check a whole per-cluster value against the declaration
    pub fn check_value(&self, actual: &[usize]) -> Result<()> {
        if let Some(shape) = &self.shape {
            if actual != shape.as_slice() {
                return Err(StoreError::InconsistentShape {
                    field: self.name.clone(),
                    expected: shape.to_vec(),
                    actual: actual.to_vec(),
                });
            }
        }
        Ok(())
    }
}

/// Validate a field name
///
/// Disk field names become file stems, so only ASCII alphanumerics and `_`
/// are accepted.
pub fn validate_field_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidConfig("field name is empty".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoreError::InvalidConfig(format!(
            "field name '{}' must contain only ASCII alphanumerics and '_'",
            name
        )));
    }
    Ok(())
}

/// CRC32 digest of a spike-id list
///
/// Sealed disk regions record the digest of the spikes they were generated
/// from; a mismatch on a later `generate()` marks the region stale.
pub fn spikes_digest(spikes: &[SpikeId]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for &spike in spikes {
        hasher.update(&(spike as u64).to_le_bytes());
    }
    hasher.finalize()
}
