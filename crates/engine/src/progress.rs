//! Generation progress and reports

use clusterstore_storage::{ChunkProgress, CompactionReport, DiskGenerateReport};
use std::fmt::Write;

/// Chunk notification tagged with the generating item
#[derive(Debug, Clone, Copy)]
pub struct GenerateProgress<'a> {
    /// Item being generated
    pub item: &'a str,
    /// Disk-level progress of that item
    pub chunk: ChunkProgress,
}

/// What one item did during `generate()`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemReport {
    /// Item name
    pub item: String,
    /// Clusters written
    pub clusters_generated: usize,
    /// Clusters already cached
    pub clusters_skipped: usize,
    /// Cached clusters regenerated because their spikes changed
    pub clusters_stale: usize,
    /// Chunks read from the recording
    pub chunks: usize,
    /// Spike rows written
    pub spikes_written: usize,
    /// The observer stopped this item
    pub cancelled: bool,
}

impl ItemReport {
    /// Report for an item that generates nothing up front
    pub fn lazy(item: &str) -> Self {
        Self {
            item: item.to_string(),
            ..Self::default()
        }
    }

    /// Report built from a disk generation run
    pub fn from_disk(item: &str, disk: DiskGenerateReport) -> Self {
        Self {
            item: item.to_string(),
            clusters_generated: disk.clusters_generated,
            clusters_skipped: disk.clusters_skipped,
            clusters_stale: disk.clusters_stale,
            chunks: disk.chunks,
            spikes_written: disk.spikes_written,
            cancelled: disk.cancelled,
        }
    }
}

/// Outcome of `ClusterStore::generate`
#[derive(Debug, Clone, Default)]
pub struct GenerateReport {
    /// One entry per item that ran, in generation order
    pub items: Vec<ItemReport>,
    /// Chunk files compacted after generation
    pub compactions: Vec<CompactionReport>,
    /// Generation stopped early
    pub cancelled: bool,
}

impl GenerateReport {
    /// Report of one item
    pub fn item(&self, name: &str) -> Option<&ItemReport> {
        self.items.iter().find(|r| r.item == name)
    }

    /// Clusters written across items
    pub fn clusters_generated(&self) -> usize {
        self.items.iter().map(|r| r.clusters_generated).sum()
    }

    /// Spike rows written across items
    pub fn spikes_written(&self) -> usize {
        self.items.iter().map(|r| r.spikes_written).sum()
    }

    /// One-line human-readable summary
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (i, r) in self.items.iter().enumerate() {
            if i > 0 {
                out.push_str("; ");
            }
            let _ = write!(
                out,
                "{}: {} generated, {} cached",
                r.item, r.clusters_generated, r.clusters_skipped
            );
            if r.clusters_stale > 0 {
                let _ = write!(out, ", {} stale", r.clusters_stale);
            }
        }
        if !self.compactions.is_empty() {
            let reclaimed: u64 = self.compactions.iter().map(|c| c.reclaimed()).sum();
            let _ = write!(
                out,
                "; compacted {} files ({} bytes)",
                self.compactions.len(),
                reclaimed
            );
        }
        if self.cancelled {
            out.push_str(" [cancelled]");
        }
        out
    }
}
