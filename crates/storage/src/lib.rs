//! Storage tiers for the cluster store
//!
//! This crate implements the two places a field value can live:
//! - MemoryStore: per-cluster values in a sharded concurrent map
//! - DiskStore: per-spike rows in append-only chunk files, one per field
//! - format: chunk record and manifest byte layouts
//!
//! Neither tier knows how values are computed; the engine crate drives both.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod disk;
pub mod format;
pub mod memory;

pub use disk::{
    ChunkControl, ChunkProgress, ChunkSource, CompactionReport, DiskGenerateReport, DiskStore,
    RecoveryReport, RecoverySource,
};
pub use memory::MemoryStore;
