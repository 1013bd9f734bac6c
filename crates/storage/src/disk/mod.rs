//! Disk tier: append-only chunk files of per-spike rows
//!
//! ## Design
//!
//! Each disk field owns one chunk file (`<field>.chunks`) and one manifest
//! (`<field>.manifest`) under the store directory. Generation walks the
//! pending spikes in ascending spike-id order, reads them from a
//! [`ChunkSource`] a chunk at a time, and appends one `Data` extent per
//! (cluster, chunk) pair. When the last row of a cluster is written a `Seal`
//! record follows; only sealed regions are ever served.
//!
//! | Event | Effect on the log |
//! |-------|-------------------|
//! | Chunk read | one buffered append per field |
//! | Cluster complete | `Seal` with the spike-id digest |
//! | Cluster invalidated | `Tombstone` (O(1), no rewrite) |
//! | Cancel or failure | unsealed extents stay, tombstoned on next open |
//! | Partition changed | `Tombstone` for every region with a stale digest |
//! | Compaction | live regions rewritten contiguously |
//!
//! ## Thread Safety
//!
//! Loads take a read lock on the field map and then the field's own mutex,
//! so loads of different fields proceed in parallel.

mod field_file;
pub mod region;

pub use field_file::{CompactionReport, RecoveryReport, RecoverySource};

use crate::format::{encode_data, encode_seal, encode_tombstone, header_word, RECORD_HEADER_SIZE};
use clusterstore_core::{
    spikes_digest, validate_field_name, ClusterId, FieldSpec, Result, SpikeId, SpikesPerCluster,
    StoreError, Tier,
};
use field_file::FieldFile;
use ndarray::{ArrayD, IxDyn};
use parking_lot::{Mutex, RwLock};
use region::Extent;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// Chunked generation plumbing
// ============================================================================

/// Supplier of per-spike rows during generation
///
/// `read_chunk` receives ascending spike ids and returns one array per field,
/// in the order the fields were passed to [`DiskStore::generate`]. Each array
/// has the spikes along its first axis.
pub trait ChunkSource {
    /// Read the rows of `spikes` for every field being generated
    fn read_chunk(&mut self, spikes: &[SpikeId]) -> Result<Vec<ArrayD<f32>>>;
}

impl<F> ChunkSource for F
where
    F: FnMut(&[SpikeId]) -> Result<Vec<ArrayD<f32>>>,
{
    fn read_chunk(&mut self, spikes: &[SpikeId]) -> Result<Vec<ArrayD<f32>>> {
        self(spikes)
    }
}

/// Progress notification sent after each chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Chunks written so far (1-based)
    pub chunk: usize,
    /// Chunks this run will write
    pub n_chunks: usize,
    /// Spikes written so far
    pub spikes_done: usize,
    /// Spikes this run will write
    pub spikes_total: usize,
    /// Clusters sealed so far
    pub clusters_sealed: usize,
}

/// Observer verdict after a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkControl {
    /// Keep going
    Continue,
    /// Stop after the current chunk; sealed clusters stay cached
    Stop,
}

/// Outcome of one [`DiskStore::generate`] run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskGenerateReport {
    /// Clusters sealed by this run
    pub clusters_generated: usize,
    /// Clusters already cached with a matching digest
    pub clusters_skipped: usize,
    /// Previously sealed clusters whose spike list changed
    pub clusters_stale: usize,
    /// Chunks read
    pub chunks: usize,
    /// Spike rows written
    pub spikes_written: usize,
    /// The observer stopped the run early
    pub cancelled: bool,
}

struct PendingCluster {
    remaining: usize,
    total: u32,
    digest: u32,
}

// ============================================================================
// DiskStore
// ============================================================================

/// Chunk files of every disk field under one directory
pub struct DiskStore {
    root: PathBuf,
    fields: RwLock<FxHashMap<String, Mutex<FieldFile>>>,
}

impl DiskStore {
    /// Open a store directory, creating it if needed
    ///
    /// No field is opened until [`DiskStore::register_field`] is called.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .map_err(|e| StoreError::io(format!("create {}", root.display()), e))?;
        debug!("Opened disk store at {}", root.display());
        Ok(Self {
            root,
            fields: RwLock::new(FxHashMap::default()),
        })
    }

    /// Store directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open a field's chunk file and recover its index
    ///
    /// Registering the same spec twice is a no-op; registering a different
    /// spec under an existing name is an error.
    pub fn register_field(&self, spec: &FieldSpec) -> Result<RecoveryReport> {
        validate_field_name(&spec.name)?;
        if spec.tier != Tier::Disk {
            return Err(StoreError::InvalidConfig(format!(
                "field '{}' is not a disk field",
                spec.name
            )));
        }

        let mut fields = self.fields.write();
        if let Some(existing) = fields.get(&spec.name) {
            let existing = existing.lock();
            if existing.spec != *spec {
                return Err(StoreError::InvalidConfig(format!(
                    "field '{}' is already registered with shape {:?}",
                    spec.name, existing.spec.shape
                )));
            }
            return Ok(RecoveryReport {
                field: spec.name.clone(),
                source: RecoverySource::AlreadyOpen,
                regions: existing.index.sealed_clusters().len(),
                orphaned_dropped: 0,
                truncated_bytes: 0,
                mismatched_records: 0,
            });
        }

        let (file, report) = FieldFile::open(&self.root, spec.clone())?;
        if report.has_issues() {
            warn!(
                "Recovered field '{}' with issues: {} orphaned, {} bytes truncated, {} mismatched",
                spec.name,
                report.orphaned_dropped,
                report.truncated_bytes,
                report.mismatched_records
            );
        }
        fields.insert(spec.name.clone(), Mutex::new(file));
        Ok(report)
    }

    /// Check if a field is registered
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.read().contains_key(field)
    }

    /// Registered field names, sorted
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fields.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Declared spec of a registered field
    pub fn spec(&self, field: &str) -> Option<FieldSpec> {
        self.fields.read().get(field).map(|f| f.lock().spec.clone())
    }

    fn with_field<R>(&self, field: &str, f: impl FnOnce(&mut FieldFile) -> Result<R>) -> Result<R> {
        let fields = self.fields.read();
        let file = fields
            .get(field)
            .ok_or_else(|| StoreError::unregistered(field))?;
        let mut guard = file.lock();
        f(&mut guard)
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Generate every pending cluster of `fields` in chunks
    ///
    /// A cluster is pending in this run if any of the fields lacks a sealed
    /// region whose digest matches its current spike list. Pending clusters
    /// lose their old regions first. Spike lists must be strictly ascending.
    ///
    /// After every chunk `on_chunk` is called; returning
    /// [`ChunkControl::Stop`] ends the run with the sealed clusters kept.
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for unsorted or overlapping spike lists,
    /// `InconsistentShape` when the source returns arrays of the wrong shape,
    /// `StorageIo` on write failures. Clusters sealed before an error stay
    /// cached.
    pub fn generate(
        &self,
        source: &mut dyn ChunkSource,
        fields: &[FieldSpec],
        spikes_per_cluster: &SpikesPerCluster,
        chunk_size: usize,
        on_chunk: &mut dyn FnMut(&ChunkProgress) -> ChunkControl,
    ) -> Result<DiskGenerateReport> {
        if chunk_size == 0 {
            return Err(StoreError::InvalidConfig(
                "chunk size must be positive".to_string(),
            ));
        }
        header_word("chunk size", chunk_size)?;
        if fields.is_empty() {
            return Ok(DiskGenerateReport::default());
        }

        let map = self.fields.read();
        let mut files = Vec::with_capacity(fields.len());
        for spec in fields {
            let file = map
                .get(&spec.name)
                .ok_or_else(|| StoreError::unregistered(&spec.name))?
                .lock();
            if file.spec != *spec {
                return Err(StoreError::InvalidConfig(format!(
                    "field '{}' was registered with a different shape",
                    spec.name
                )));
            }
            files.push(file);
        }

        let mut report = DiskGenerateReport::default();
        let mut pending: Vec<(ClusterId, &[SpikeId])> = Vec::new();
        let mut state: FxHashMap<ClusterId, PendingCluster> = FxHashMap::default();

        for (&cluster, spikes) in spikes_per_cluster {
            if !spikes.windows(2).all(|w| w[0] < w[1]) {
                return Err(StoreError::InvalidQuery(format!(
                    "spikes of cluster {} are not strictly ascending",
                    cluster
                )));
            }
            let digest = spikes_digest(spikes);
            let cached = files.iter().all(|f| {
                f.index
                    .sealed(cluster)
                    .map_or(false, |r| r.digest == digest && r.n_rows == spikes.len() as u64)
            });
            if cached {
                report.clusters_skipped += 1;
                continue;
            }
            if files.iter().any(|f| f.index.sealed(cluster).is_some()) {
                report.clusters_stale += 1;
            }
            let total = header_word("cluster row count", spikes.len())?;
            pending.push((cluster, spikes.as_slice()));
            state.insert(
                cluster,
                PendingCluster {
                    remaining: spikes.len(),
                    total,
                    digest,
                },
            );
        }

        if pending.is_empty() {
            debug!("All {} clusters already cached", report.clusters_skipped);
            return Ok(report);
        }
        if report.clusters_stale > 0 {
            info!(
                "{} cached clusters changed their spikes and will be regenerated",
                report.clusters_stale
            );
        }

        // Old regions of pending clusters go first, then empty clusters seal
        // immediately.
        for file in files.iter_mut() {
            let row_len = file.row_len as u32;
            let mut buf = Vec::new();
            let mut stale = Vec::new();
            for &(cluster, spikes) in &pending {
                if file.index.region(cluster).is_some() {
                    encode_tombstone(&mut buf, cluster, row_len);
                    stale.push(cluster);
                }
                if spikes.is_empty() {
                    encode_seal(&mut buf, cluster, 0, row_len, state[&cluster].digest);
                }
            }
            if buf.is_empty() {
                continue;
            }
            file.append(&buf)?;
            for cluster in stale {
                file.index.remove(cluster);
            }
            for &(cluster, spikes) in &pending {
                if spikes.is_empty() {
                    file.index.seal(cluster, 0, state[&cluster].digest);
                }
            }
        }
        report.clusters_generated += pending.iter().filter(|(_, s)| s.is_empty()).count();

        let mut order: Vec<(SpikeId, ClusterId)> = pending
            .iter()
            .flat_map(|&(cluster, spikes)| spikes.iter().map(move |&s| (s, cluster)))
            .collect();
        order.sort_unstable_by_key(|&(spike, _)| spike);
        if let Some(w) = order.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(StoreError::InvalidQuery(format!(
                "spike {} belongs to clusters {} and {}",
                w[0].0, w[0].1, w[1].1
            )));
        }

        let spikes_total = order.len();
        let n_chunks = (spikes_total + chunk_size - 1) / chunk_size;
        info!(
            "Generating {} clusters ({} spikes, {} chunks) into {} fields",
            pending.len(),
            spikes_total,
            n_chunks,
            fields.len()
        );

        let mut spikes_done = 0usize;
        for (i, chunk) in order.chunks(chunk_size).enumerate() {
            let spikes: Vec<SpikeId> = chunk.iter().map(|&(s, _)| s).collect();
            let arrays = match source.read_chunk(&spikes) {
                Ok(arrays) => arrays,
                Err(e) => {
                    warn!("Chunk {}/{} failed to read: {}", i + 1, n_chunks, e);
                    return Err(e);
                }
            };
            if arrays.len() != files.len() {
                return Err(StoreError::InvalidQuery(format!(
                    "chunk source returned {} arrays for {} fields",
                    arrays.len(),
                    files.len()
                )));
            }
            for (spec, array) in fields.iter().zip(&arrays) {
                spec.check_rows(array.shape(), spikes.len())?;
            }

            // Rows of each cluster within the chunk, in first-seen order.
            let mut groups: Vec<(ClusterId, Vec<usize>)> = Vec::new();
            let mut slots: FxHashMap<ClusterId, usize> = FxHashMap::default();
            for (row, &(_, cluster)) in chunk.iter().enumerate() {
                let slot = *slots.entry(cluster).or_insert_with(|| {
                    groups.push((cluster, Vec::new()));
                    groups.len() - 1
                });
                groups[slot].1.push(row);
            }

            let mut completed = Vec::new();
            for (cluster, rows) in &groups {
                if let Some(p) = state.get_mut(cluster) {
                    p.remaining -= rows.len();
                    if p.remaining == 0 {
                        completed.push(*cluster);
                    }
                }
            }

            for (file, array) in files.iter_mut().zip(&arrays) {
                let row_len = file.row_len;
                let flat: Vec<f32> = array.iter().copied().collect();
                let mut buf = Vec::with_capacity(
                    (groups.len() + completed.len()) * RECORD_HEADER_SIZE + flat.len() * 4,
                );
                let mut extents = Vec::with_capacity(groups.len());
                let mut rows_buf = Vec::new();
                for (cluster, rows) in &groups {
                    rows_buf.clear();
                    for &r in rows {
                        rows_buf.extend_from_slice(&flat[r * row_len..(r + 1) * row_len]);
                    }
                    let at = encode_data(&mut buf, *cluster, row_len, &rows_buf)?;
                    extents.push((*cluster, at as u64, rows.len() as u32));
                }
                for cluster in &completed {
                    let p = &state[cluster];
                    encode_seal(&mut buf, *cluster, p.total, row_len as u32, p.digest);
                }

                let base = file.append(&buf)?;
                for (cluster, at, n_rows) in extents {
                    file.index.push_extent(
                        cluster,
                        Extent {
                            offset: base + at,
                            n_rows,
                        },
                    );
                }
                for cluster in &completed {
                    let p = &state[cluster];
                    file.index.seal(*cluster, u64::from(p.total), p.digest);
                }
            }

            spikes_done += spikes.len();
            report.chunks += 1;
            report.spikes_written += spikes.len();
            report.clusters_generated += completed.len();

            let progress = ChunkProgress {
                chunk: i + 1,
                n_chunks,
                spikes_done,
                spikes_total,
                clusters_sealed: report.clusters_generated,
            };
            debug!(
                "Chunk {}/{}: {} spikes, {} clusters sealed",
                progress.chunk, n_chunks, spikes.len(), completed.len()
            );
            if on_chunk(&progress) == ChunkControl::Stop {
                info!(
                    "Generation stopped after chunk {}/{} ({} clusters sealed)",
                    progress.chunk, n_chunks, report.clusters_generated
                );
                report.cancelled = true;
                break;
            }
        }

        for file in files.iter_mut() {
            file.write_manifest()?;
        }
        Ok(report)
    }

    // ========================================================================
    // Loads
    // ========================================================================

    /// Check if a cluster has a sealed region in `field`
    pub fn is_cached(&self, field: &str, cluster: ClusterId) -> bool {
        self.with_field(field, |f| Ok(f.index.sealed(cluster).is_some()))
            .unwrap_or(false)
    }

    /// Sealed clusters of a field, ascending
    pub fn cached_clusters(&self, field: &str) -> Result<Vec<ClusterId>> {
        self.with_field(field, |f| Ok(f.index.sealed_clusters()))
    }

    /// All rows of one cluster
    pub fn load(&self, field: &str, cluster: ClusterId) -> Result<ArrayD<f32>> {
        self.load_clusters(field, &[cluster])
    }

    /// Rows of several clusters, concatenated in the order given
    pub fn load_clusters(&self, field: &str, clusters: &[ClusterId]) -> Result<ArrayD<f32>> {
        self.with_field(field, |file| {
            let mut data = Vec::new();
            let mut n_rows = 0usize;
            for &cluster in clusters {
                let (n, rows) = file.read_region(cluster)?;
                n_rows += n;
                data.extend_from_slice(&rows);
            }
            rows_array(&file.spec, n_rows, data)
        })
    }

    /// Rows of individual spikes, in the order given
    ///
    /// Each spike is located within its cluster's sorted spike list, so the
    /// lists must be the ones the cluster was generated from.
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for unknown spikes or spikes the field did not
    /// materialize; `MissingField` if a cluster is not generated.
    pub fn load_spikes(
        &self,
        field: &str,
        spikes: &[SpikeId],
        spike_clusters: &[ClusterId],
        spikes_per_cluster: &SpikesPerCluster,
    ) -> Result<ArrayD<f32>> {
        let mut positions = Vec::with_capacity(spikes.len());
        for &spike in spikes {
            let cluster = *spike_clusters.get(spike).ok_or_else(|| {
                StoreError::InvalidQuery(format!(
                    "spike {} is out of range ({} spikes)",
                    spike,
                    spike_clusters.len()
                ))
            })?;
            let list = spikes_per_cluster.get(&cluster).ok_or_else(|| {
                StoreError::InvalidQuery(format!("spike {} has no cluster entry", spike))
            })?;
            let pos = list.binary_search(&spike).map_err(|_| {
                StoreError::InvalidQuery(format!(
                    "spike {} of cluster {} is not materialized in '{}'",
                    spike, cluster, field
                ))
            })?;
            positions.push((cluster, pos, list.as_slice()));
        }

        self.with_field(field, |file| {
            let row_len = file.row_len;
            let mut loaded: FxHashMap<ClusterId, Vec<f32>> = FxHashMap::default();
            for &(cluster, _, list) in &positions {
                if loaded.contains_key(&cluster) {
                    continue;
                }
                if !file.matches(cluster, list) {
                    return Err(StoreError::missing(field, cluster));
                }
                let (_, rows) = file.read_region(cluster)?;
                loaded.insert(cluster, rows);
            }

            let mut data = Vec::with_capacity(positions.len() * row_len);
            for &(cluster, pos, _) in &positions {
                let rows = &loaded[&cluster];
                data.extend_from_slice(&rows[pos * row_len..(pos + 1) * row_len]);
            }
            rows_array(&file.spec, positions.len(), data)
        })
    }

    // ========================================================================
    // Invalidation and maintenance
    // ========================================================================

    /// Tombstone a cluster in every field; returns the fields touched
    pub fn invalidate(&self, cluster: ClusterId) -> Result<usize> {
        let fields = self.fields.read();
        let mut touched = 0;
        for file in fields.values() {
            if file.lock().invalidate(cluster)? {
                touched += 1;
            }
        }
        if touched > 0 {
            debug!("Invalidated cluster {} in {} disk fields", cluster, touched);
        }
        Ok(touched)
    }

    /// Tombstone a cluster in one field
    pub fn invalidate_field(&self, field: &str, cluster: ClusterId) -> Result<bool> {
        self.with_field(field, |f| f.invalidate(cluster))
    }

    /// Tombstone every sealed region of `field` that no longer matches
    /// `spikes_per_cluster`
    ///
    /// A region is stale when its cluster is gone or when its row count or
    /// spike-id digest differs from the cluster's current list. Returns the
    /// clusters dropped, ascending.
    pub fn drop_stale(
        &self,
        field: &str,
        spikes_per_cluster: &SpikesPerCluster,
    ) -> Result<Vec<ClusterId>> {
        self.with_field(field, |file| {
            let stale: Vec<ClusterId> = file
                .index
                .sealed_clusters()
                .into_iter()
                .filter(|c| {
                    spikes_per_cluster
                        .get(c)
                        .map_or(true, |spikes| !file.matches(*c, spikes))
                })
                .collect();
            if !stale.is_empty() {
                file.tombstone(&stale)?;
                info!(
                    "Field '{}': dropped {} regions that no longer match their clusters",
                    field,
                    stale.len()
                );
            }
            Ok(stale)
        })
    }

    /// Drop every region of a field
    pub fn clear_field(&self, field: &str) -> Result<()> {
        self.with_field(field, |f| f.clear())
    }

    /// Chunk file length of a field
    pub fn file_len(&self, field: &str) -> Result<u64> {
        self.with_field(field, |f| Ok(f.len()))
    }

    /// Bytes of a field's chunk file not held by sealed regions
    pub fn dead_bytes(&self, field: &str) -> Result<u64> {
        self.with_field(field, |f| Ok(f.dead_bytes()))
    }

    /// Rewrite a field's chunk file without dead records
    pub fn compact(&self, field: &str) -> Result<CompactionReport> {
        self.with_field(field, |f| f.compact())
    }

    /// Compact every field whose dead share exceeds `threshold`
    ///
    /// `threshold` is a fraction of the chunk file length in `[0, 1]`.
    pub fn maybe_compact(&self, threshold: f64) -> Result<Vec<CompactionReport>> {
        let fields = self.fields.read();
        let mut reports = Vec::new();
        let mut names: Vec<&String> = fields.keys().collect();
        names.sort();
        for name in names {
            let mut file = fields[name].lock();
            let len = file.len();
            if len == 0 {
                continue;
            }
            let ratio = file.dead_bytes() as f64 / len as f64;
            if ratio > threshold {
                debug!("Field '{}' is {:.0}% dead, compacting", name, ratio * 100.0);
                reports.push(file.compact()?);
            }
        }
        Ok(reports)
    }

    /// Write every dirty manifest
    pub fn flush(&self) -> Result<()> {
        let fields = self.fields.read();
        for file in fields.values() {
            file.lock().write_manifest()?;
        }
        Ok(())
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to write manifests on close: {}", e);
        }
    }
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("root", &self.root)
            .field("fields", &self.field_names())
            .finish()
    }
}

fn rows_array(spec: &FieldSpec, n_rows: usize, data: Vec<f32>) -> Result<ArrayD<f32>> {
    let shape = spec.rows_shape(n_rows);
    let len = data.len();
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|_| StoreError::InconsistentShape {
        field: spec.name.clone(),
        expected: shape,
        actual: vec![len],
    })
}
