//! Core types for the cluster store
//!
//! This crate defines the pieces shared by every layer:
//! - Identifiers and field declarations ([`ClusterId`], [`SpikeId`], [`FieldSpec`])
//! - The error taxonomy ([`StoreError`])
//! - The cluster partition of the spike set ([`SpikeIndex`])
//! - Selection helpers (caller-ordered concatenation, cluster-relative index)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod selection;
pub mod spike_index;
pub mod types;

pub use error::{Result, StoreError};
pub use selection::{concat_in_order, relative_cluster_index, select, SelectionIndex};
pub use spike_index::{AssignmentDelta, SpikeIndex, SpikesPerCluster};
pub use types::{
    spikes_digest, validate_field_name, ClusterId, FieldSpec, FieldState, Shape, SpikeId, Tier,
};
