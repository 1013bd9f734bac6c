//! Shared helpers for the store integration tests

#![allow(dead_code)]

pub use clusterstore::prelude::*;
pub use clusterstore::{GenerateReport, SpikesPerCluster};
use ndarray::{Array2, Array3, Axis};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// A store over a mock recording in its own temp directory
pub struct TestStore {
    pub dir: TempDir,
    pub recording: Arc<InMemoryRecording>,
    pub config: StoreConfig,
    pub store: ClusterStore,
}

impl TestStore {
    /// Default mock (5 clusters, 100 spikes, 28 channels) with small chunks
    pub fn new() -> Self {
        Self::with(MockRecording::new(), StoreConfig::small())
    }

    pub fn with(mock: MockRecording, config: StoreConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let recording = Arc::new(mock.build().expect("mock recording"));
        let store =
            create_store(recording.clone(), dir.path(), config.clone()).expect("open store");
        Self {
            dir,
            recording,
            config,
            store,
        }
    }

    /// Store that has already run `generate()` once
    pub fn generated() -> Self {
        let mut ts = Self::new();
        ts.store.generate().expect("generate");
        ts
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn chunk_file(&self, field: &str) -> PathBuf {
        self.dir.path().join(format!("{}.chunks", field))
    }

    pub fn manifest_file(&self, field: &str) -> PathBuf {
        self.dir.path().join(format!("{}.manifest", field))
    }

    /// Drop the current store and open a fresh one over the same directory
    pub fn reopen(&mut self) {
        self.store.flush().expect("flush");
        self.store = create_store(self.recording.clone(), self.dir.path(), self.config.clone())
            .expect("reopen store");
    }

    /// Close the store without reopening, for tampering with its files
    pub fn close(self) -> (TempDir, Arc<InMemoryRecording>, StoreConfig) {
        self.store.flush().expect("flush");
        let Self {
            dir,
            recording,
            config,
            store,
        } = self;
        drop(store);
        (dir, recording, config)
    }

    pub fn spikes(&self, cluster: ClusterId) -> Vec<SpikeId> {
        self.store
            .spike_index()
            .spikes(cluster)
            .expect("known cluster")
            .to_vec()
    }

    /// Cluster with the most spikes
    pub fn largest_cluster(&self) -> ClusterId {
        self.store
            .clusters()
            .into_iter()
            .max_by_key(|&c| (self.spikes(c).len(), std::cmp::Reverse(c)))
            .expect("at least one cluster")
    }

    pub fn expected_features(&self, spikes: &[SpikeId]) -> Array3<f32> {
        self.recording.features().select(Axis(0), spikes)
    }

    pub fn expected_masks(&self, spikes: &[SpikeId]) -> Array2<f32> {
        self.recording.masks().select(Axis(0), spikes)
    }

    pub fn expected_waveforms(&self, spikes: &[SpikeId]) -> Array3<f32> {
        self.recording
            .read_waveforms(spikes)
            .expect("read waveforms")
    }

    /// Materialized waveform spikes per cluster
    pub fn waveform_spikes(&self) -> SpikesPerCluster {
        self.store
            .waveforms_item()
            .expect("waveforms item")
            .spikes_per_cluster()
            .clone()
    }
}

/// Observer that stops after `n` chunks
pub fn stop_after(n: usize) -> impl FnMut(&clusterstore::GenerateProgress<'_>) -> ChunkControl {
    let mut seen = 0;
    move |_| {
        seen += 1;
        if seen >= n {
            ChunkControl::Stop
        } else {
            ChunkControl::Continue
        }
    }
}

/// Sum of generated clusters over all items
pub fn generated(report: &GenerateReport) -> usize {
    report.clusters_generated()
}

/// Recording wrapper whose feature reads fail while `failing` is set
pub struct FlakyRecording {
    pub inner: Arc<InMemoryRecording>,
    pub failing: AtomicBool,
    pub fail_after: std::sync::atomic::AtomicUsize,
}

impl FlakyRecording {
    pub fn new(inner: Arc<InMemoryRecording>, fail_after: usize) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(true),
            fail_after: std::sync::atomic::AtomicUsize::new(fail_after),
        }
    }

    pub fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

impl Recording for FlakyRecording {
    fn spike_clusters(&self) -> Vec<i64> {
        self.inner.spike_clusters()
    }

    fn n_spikes(&self) -> usize {
        self.inner.n_spikes()
    }

    fn n_channels(&self) -> usize {
        self.inner.n_channels()
    }

    fn n_features_per_channel(&self) -> usize {
        self.inner.n_features_per_channel()
    }

    fn n_samples_waveforms(&self) -> usize {
        self.inner.n_samples_waveforms()
    }

    fn read_features(&self, spikes: &[SpikeId]) -> Result<Array3<f32>> {
        if self.failing.load(Ordering::SeqCst) {
            let left = self.fail_after.load(Ordering::SeqCst);
            if left == 0 {
                return Err(StoreError::io(
                    "read features",
                    std::io::Error::new(std::io::ErrorKind::Other, "device unplugged"),
                ));
            }
            self.fail_after.store(left - 1, Ordering::SeqCst);
        }
        self.inner.read_features(spikes)
    }

    fn read_masks(&self, spikes: &[SpikeId]) -> Result<Array2<f32>> {
        self.inner.read_masks(spikes)
    }

    fn read_waveforms(&self, spikes: &[SpikeId]) -> Result<Array3<f32>> {
        self.inner.read_waveforms(spikes)
    }

    fn channel_positions(&self) -> Array2<f32> {
        self.inner.channel_positions()
    }
}
