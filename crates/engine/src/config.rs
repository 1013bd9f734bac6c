//! Store configuration
//!
//! The configuration is persisted as `store.json` next to the chunk files so
//! that reopening a cache directory without explicit settings keeps the
//! excerpting and chunking it was built with. Changing the excerpt settings
//! later is safe: the materialized spike lists change, their digests no
//! longer match, and the waveform regions are regenerated.

use crate::excerpt::ExcerptPolicy;
use clusterstore_core::{Result, StoreError};
use clusterstore_storage::format::header_word;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name of the persisted configuration
pub const CONFIG_FILE: &str = "store.json";

/// Store tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Spikes per chunk when generating features and masks
    pub features_masks_chunk_size: usize,
    /// Spikes per chunk when generating waveforms
    pub waveforms_chunk_size: usize,
    /// Clusters larger than this only materialize an excerpt of waveforms
    pub waveforms_n_spikes_max: usize,
    /// Spikes per excerpt group
    pub waveforms_excerpt_size: usize,
    /// Dead share of a chunk file above which `generate()` compacts it
    pub compaction_dead_ratio: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            features_masks_chunk_size: 100_000,
            waveforms_chunk_size: 1_000,
            waveforms_n_spikes_max: 100,
            waveforms_excerpt_size: 20,
            compaction_dead_ratio: 0.5,
        }
    }
}

impl StoreConfig {
    /// Tiny chunks and excerpts, for tests on mock recordings
    pub fn small() -> Self {
        Self {
            features_masks_chunk_size: 15,
            waveforms_chunk_size: 10,
            waveforms_n_spikes_max: 5,
            waveforms_excerpt_size: 2,
            compaction_dead_ratio: 0.5,
        }
    }

    /// Check every setting
    ///
    /// # Errors
    ///
    /// `InvalidConfig` naming the first bad setting.
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("features_masks_chunk_size", self.features_masks_chunk_size),
            ("waveforms_chunk_size", self.waveforms_chunk_size),
        ] {
            if size == 0 {
                return Err(StoreError::InvalidConfig(format!("{} must be > 0", name)));
            }
            // Chunk row counts are stored as u32 record header words.
            header_word(name, size)?;
        }
        self.excerpt_policy()?;
        if !(self.compaction_dead_ratio > 0.0 && self.compaction_dead_ratio <= 1.0) {
            return Err(StoreError::InvalidConfig(format!(
                "compaction_dead_ratio {} must be in (0, 1]",
                self.compaction_dead_ratio
            )));
        }
        Ok(())
    }

    /// Waveform excerpt policy
    pub fn excerpt_policy(&self) -> Result<ExcerptPolicy> {
        ExcerptPolicy::new(self.waveforms_n_spikes_max, self.waveforms_excerpt_size)
    }

    /// Read `store.json` from a cache directory, if present
    pub fn load(dir: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| StoreError::io(format!("read {}", path.display()), e))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| StoreError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Write `store.json` into a cache directory
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(CONFIG_FILE);
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        std::fs::write(&path, text)
            .map_err(|e| StoreError::io(format!("write {}", path.display()), e))
    }
}
