//! Convenient imports for ClusterStore.
//!
//! ```ignore
//! use clusterstore::prelude::*;
//!
//! let mut store = create_store(recording, "./cache", StoreConfig::default())?;
//! store.generate()?;
//! ```

// Main entry point
pub use crate::builder::{create_store, StoreBuilder};
pub use clusterstore_engine::{ClusterStore, Query, StoreConfig};

// Error handling
pub use clusterstore_core::{Result, StoreError};

// Core types
pub use clusterstore_core::{ClusterId, FieldState, SpikeId};

// Recordings
pub use clusterstore_engine::{InMemoryRecording, MockRecording, Recording};

// Generation control
pub use clusterstore_storage::ChunkControl;

// Shared handles for recordings
pub use std::sync::Arc;
