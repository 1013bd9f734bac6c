//! Cluster store engine
//!
//! This crate ties the storage tiers to a recording:
//! - Recording: the raw per-spike data source ([`Recording`], [`InMemoryRecording`])
//! - Items: independently registered producers of fields ([`StoreItem`])
//! - ClusterStore: routing, chunked generation, lazy statistics, invalidation
//! - StoreConfig: persisted chunk sizes and waveform excerpt settings
//!
//! A [`MockRecording`] builds deterministic synthetic recordings for tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod excerpt;
pub mod guard;
pub mod items;
pub mod mock;
pub mod progress;
pub mod recording;
pub mod registry;
pub mod store;

pub use config::{StoreConfig, CONFIG_FILE};
pub use excerpt::ExcerptPolicy;
pub use items::{
    FeaturesMasksItem, GenerateContext, Statistic, StatisticsItem, StoreItem, WaveformsItem,
    FEATURES_MASKS, STATISTICS, UNMASKED_THRESHOLD, WAVEFORMS,
};
pub use mock::MockRecording;
pub use progress::{GenerateProgress, GenerateReport, ItemReport};
pub use recording::{extract_waveform, InMemoryRecording, Recording, WaveformSource};
pub use registry::ItemRegistry;
pub use store::{ClusterStore, Query, Selector};
