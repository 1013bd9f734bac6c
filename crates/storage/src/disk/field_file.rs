//! One field's chunk file, its region index and manifest
//!
//! ## Recovery Sequence
//!
//! 1. Load the manifest if it is valid and describes the current file length
//! 2. Otherwise replay the chunk file record by record
//! 3. Truncate a torn or unreadable tail
//! 4. Drop unsealed ("orphaned") regions left by a cancelled or failed
//!    generation and tombstone them, so their extents never merge with a
//!    later region of the same cluster on a future rescan
//!
//! After recovery the index only holds sealed regions, each of which is a
//! complete copy of one cluster's rows.

use crate::disk::region::{Extent, RegionIndex};
use crate::format::{
    decode_data, encode_data, encode_seal, encode_tombstone, header_word, verify_marker, Manifest,
    RecordHeader, RecordKind, RECORD_HEADER_SIZE,
};
use clusterstore_core::{spikes_digest, ClusterId, FieldSpec, Result, SpikeId, StoreError};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where a field's index came from when it was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    /// No chunk file existed yet
    Fresh,
    /// Loaded from a valid manifest
    Manifest,
    /// Rebuilt by replaying the chunk file
    Rescan,
    /// The field was already open in this store
    AlreadyOpen,
}

/// Result of opening a field
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    /// Field name
    pub field: String,
    /// Index source
    pub source: RecoverySource,
    /// Sealed regions available after recovery
    pub regions: usize,
    /// Unsealed regions discarded
    pub orphaned_dropped: usize,
    /// Bytes cut from a torn tail
    pub truncated_bytes: u64,
    /// Data records skipped because their row length disagrees with the field
    pub mismatched_records: usize,
}

impl RecoveryReport {
    fn new(field: &str, source: RecoverySource) -> Self {
        Self {
            field: field.to_string(),
            source,
            regions: 0,
            orphaned_dropped: 0,
            truncated_bytes: 0,
            mismatched_records: 0,
        }
    }

    /// Check if recovery had to discard anything
    pub fn has_issues(&self) -> bool {
        self.orphaned_dropped > 0 || self.truncated_bytes > 0 || self.mismatched_records > 0
    }
}

/// Result of compacting a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Field name
    pub field: String,
    /// Chunk file length before
    pub bytes_before: u64,
    /// Chunk file length after
    pub bytes_after: u64,
    /// Regions rewritten
    pub regions: usize,
}

impl CompactionReport {
    /// Bytes reclaimed
    pub fn reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

pub(crate) struct FieldFile {
    pub(crate) spec: FieldSpec,
    pub(crate) row_len: usize,
    chunk_path: PathBuf,
    manifest_path: PathBuf,
    file: File,
    len: u64,
    pub(crate) index: RegionIndex,
    dirty: bool,
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| StoreError::io(format!("open {}", path.display()), e))
}

impl FieldFile {
    /// Open (or create) the chunk file of a field and recover its index
    pub(crate) fn open(root: &Path, spec: FieldSpec) -> Result<(Self, RecoveryReport)> {
        let row_len = spec.row_len().ok_or_else(|| {
            StoreError::InvalidConfig(format!("disk field '{}' needs a declared shape", spec.name))
        })?;
        let chunk_path = root.join(format!("{}.chunks", spec.name));
        let manifest_path = root.join(format!("{}.manifest", spec.name));
        let file = open_append(&chunk_path)?;
        let len = file
            .metadata()
            .map_err(|e| StoreError::io("stat chunk file", e))?
            .len();

        let mut field = Self {
            spec,
            row_len,
            chunk_path,
            manifest_path,
            file,
            len,
            index: RegionIndex::default(),
            dirty: false,
        };
        let report = field.recover()?;
        Ok((field, report))
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Check that a cluster's sealed region was generated from `spikes`
    pub(crate) fn matches(&self, cluster: ClusterId, spikes: &[SpikeId]) -> bool {
        self.index.sealed(cluster).map_or(false, |r| {
            r.n_rows == spikes.len() as u64 && r.digest == spikes_digest(spikes)
        })
    }

    pub(crate) fn dead_bytes(&self) -> u64 {
        self.len.saturating_sub(self.index.live_bytes(self.row_len))
    }

    fn recover(&mut self) -> Result<RecoveryReport> {
        let name = self.spec.name.clone();
        if self.len == 0 {
            self.dirty = self.manifest_path.exists();
            debug!("Field '{}' starts with an empty chunk file", name);
            return Ok(RecoveryReport::new(&name, RecoverySource::Fresh));
        }

        match self.read_manifest() {
            Ok(Some(manifest))
                if manifest.chunk_len == self.len
                    && manifest.row_len as usize == self.row_len
                    && manifest.field == name =>
            {
                self.index = manifest.index;
                let orphaned = self.index.drop_unsealed();
                self.tombstone(&orphaned)?;
                let mut report = RecoveryReport::new(&name, RecoverySource::Manifest);
                report.orphaned_dropped = orphaned.len();
                report.regions = self.index.sealed_clusters().len();
                debug!(
                    "Field '{}': loaded manifest with {} regions",
                    name, report.regions
                );
                return Ok(report);
            }
            Ok(Some(_)) => {
                warn!("Field '{}': manifest is stale, rescanning chunk file", name);
            }
            Ok(None) => {
                debug!("Field '{}': no manifest, rescanning chunk file", name);
            }
            Err(e) => {
                warn!("Field '{}': manifest unreadable ({}), rescanning", name, e);
            }
        }

        self.rescan()
    }

    fn read_manifest(&self) -> Result<Option<Manifest>> {
        if !self.manifest_path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.manifest_path)
            .map_err(|e| StoreError::io("read manifest", e))?;
        Manifest::decode(&bytes).map(Some)
    }

    fn rescan(&mut self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::new(&self.spec.name, RecoverySource::Rescan);
        let reader_file =
            File::open(&self.chunk_path).map_err(|e| StoreError::io("open chunk file", e))?;
        let mut reader = BufReader::new(reader_file);
        let mut index = RegionIndex::default();
        let mut offset = 0u64;

        while offset < self.len {
            if self.len - offset < RECORD_HEADER_SIZE as u64 {
                warn!(
                    "Field '{}': torn record header at offset {}",
                    self.spec.name, offset
                );
                break;
            }
            let mut bytes = [0u8; RECORD_HEADER_SIZE];
            reader
                .read_exact(&mut bytes)
                .map_err(|e| StoreError::io("read record header", e))?;
            let header = match RecordHeader::decode(&bytes) {
                Ok(h) => h,
                Err(e) => {
                    warn!(
                        "Field '{}': unreadable record at offset {}: {}",
                        self.spec.name, offset, e
                    );
                    break;
                }
            };
            let record_len = header.record_len();
            if offset + record_len > self.len {
                warn!(
                    "Field '{}': torn record payload at offset {}",
                    self.spec.name, offset
                );
                break;
            }
            if header.kind != RecordKind::Data && !verify_marker(&bytes, &header) {
                warn!(
                    "Field '{}': marker CRC mismatch at offset {}",
                    self.spec.name, offset
                );
                break;
            }
            reader
                .seek_relative(header.payload_len() as i64)
                .map_err(|e| StoreError::io("skip record payload", e))?;

            match header.kind {
                RecordKind::Data if header.row_len as usize != self.row_len => {
                    report.mismatched_records += 1;
                }
                RecordKind::Data => {
                    index.push_extent(
                        header.cluster,
                        Extent {
                            offset,
                            n_rows: header.n_rows,
                        },
                    );
                }
                RecordKind::Seal => {
                    if !index.seal(header.cluster, header.n_rows as u64, header.aux) {
                        debug!(
                            "Field '{}': seal for cluster {} does not match its extents",
                            self.spec.name, header.cluster
                        );
                    }
                }
                RecordKind::Tombstone => {
                    index.remove(header.cluster);
                }
            }
            offset += record_len;
        }

        if offset < self.len {
            self.file
                .set_len(offset)
                .map_err(|e| StoreError::io("truncate torn tail", e))?;
            report.truncated_bytes = self.len - offset;
            self.len = offset;
        }

        let orphaned = index.drop_unsealed();
        if !orphaned.is_empty() {
            warn!(
                "Field '{}': discarded {} unsealed regions",
                self.spec.name,
                orphaned.len()
            );
        }
        report.orphaned_dropped = orphaned.len();
        report.regions = index.sealed_clusters().len();
        self.index = index;
        self.dirty = true;
        self.tombstone(&orphaned)?;

        info!(
            "Field '{}': rescanned {} bytes, {} regions",
            self.spec.name, self.len, report.regions
        );
        Ok(report)
    }

    /// Append encoded records; returns the file offset of the first byte
    ///
    /// A failed write truncates the file back so that the log never holds a
    /// torn record in the middle.
    pub(crate) fn append(&mut self, buf: &[u8]) -> Result<u64> {
        let start = self.len;
        if let Err(e) = self.file.write_all(buf) {
            if let Err(trunc) = self.file.set_len(start) {
                warn!(
                    "Field '{}': could not truncate after failed write: {}",
                    self.spec.name, trunc
                );
            }
            return Err(StoreError::io(
                format!("append to {}", self.chunk_path.display()),
                e,
            ));
        }
        self.len += buf.len() as u64;
        self.dirty = true;
        Ok(start)
    }

    /// Read every row of a sealed region
    ///
    /// Returns `(n_rows, values)`.
    pub(crate) fn read_region(&mut self, cluster: ClusterId) -> Result<(usize, Vec<f32>)> {
        let region = self
            .index
            .sealed(cluster)
            .ok_or_else(|| StoreError::missing(self.spec.name.clone(), cluster))?;
        let n_rows = region.n_rows as usize;
        let extents = region.extents.clone();

        let mut out = vec![0f32; n_rows * self.row_len];
        let mut filled = 0usize;
        let mut record = Vec::new();
        for extent in extents {
            let n = extent.n_rows as usize * self.row_len;
            record.resize(RECORD_HEADER_SIZE + n * 4, 0);
            self.file
                .seek(SeekFrom::Start(extent.offset))
                .map_err(|e| StoreError::io("seek extent", e))?;
            self.file
                .read_exact(&mut record)
                .map_err(|e| StoreError::io("read extent", e))?;

            let mut bytes = [0u8; RECORD_HEADER_SIZE];
            bytes.copy_from_slice(&record[..RECORD_HEADER_SIZE]);
            let header = RecordHeader::decode(&bytes)?;
            if header.kind != RecordKind::Data || header.cluster != cluster {
                return Err(StoreError::Corruption(format!(
                    "extent at offset {} of '{}' does not belong to cluster {}",
                    extent.offset, self.spec.name, cluster
                )));
            }
            let end = filled + n;
            if end > out.len() {
                return Err(StoreError::Corruption(format!(
                    "region of cluster {} in '{}' overflows its row count",
                    cluster, self.spec.name
                )));
            }
            decode_data(&record, &header, &mut out[filled..end])?;
            filled = end;
        }
        Ok((n_rows, out))
    }

    /// Tombstone a cluster's region; returns false if it had none
    pub(crate) fn invalidate(&mut self, cluster: ClusterId) -> Result<bool> {
        if self.index.region(cluster).is_none() {
            return Ok(false);
        }
        self.tombstone(&[cluster])?;
        Ok(true)
    }

    /// Append one tombstone per cluster in a single write and forget their
    /// regions
    pub(crate) fn tombstone(&mut self, clusters: &[ClusterId]) -> Result<()> {
        if clusters.is_empty() {
            return Ok(());
        }
        let row_len = header_word("row length", self.row_len)?;
        let mut buf = Vec::with_capacity(clusters.len() * RECORD_HEADER_SIZE);
        for &cluster in clusters {
            encode_tombstone(&mut buf, cluster, row_len);
        }
        self.append(&buf)?;
        for cluster in clusters {
            self.index.remove(*cluster);
        }
        Ok(())
    }

    /// Write the manifest if the index changed since the last write
    pub(crate) fn write_manifest(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let manifest = Manifest {
            field: self.spec.name.clone(),
            row_len: self.row_len as u32,
            chunk_len: self.len,
            index: self.index.clone(),
        };
        let bytes = manifest.encode()?;
        let tmp = self.manifest_path.with_extension("manifest.tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| StoreError::io("write manifest", e))?;
        std::fs::rename(&tmp, &self.manifest_path)
            .map_err(|e| StoreError::io("install manifest", e))?;
        self.dirty = false;
        Ok(())
    }

    /// Rewrite sealed regions contiguously into a fresh chunk file
    pub(crate) fn compact(&mut self) -> Result<CompactionReport> {
        let bytes_before = self.len;
        let sealed: Vec<(ClusterId, u32)> = self
            .index
            .iter_sealed()
            .map(|(c, r)| (c, r.digest))
            .collect();

        let tmp_path = self.chunk_path.with_extension("chunks.compact");
        let tmp = File::create(&tmp_path).map_err(|e| StoreError::io("create compaction file", e))?;
        let mut writer = BufWriter::new(tmp);
        let mut index = RegionIndex::default();
        let mut written = 0u64;
        let mut buf = Vec::new();

        let row_len = header_word("row length", self.row_len)?;
        for (cluster, digest) in &sealed {
            let (n_rows, rows) = self.read_region(*cluster)?;
            let n_rows_word = header_word("row count", n_rows)?;
            buf.clear();
            if n_rows > 0 {
                encode_data(&mut buf, *cluster, self.row_len, &rows)?;
                index.push_extent(
                    *cluster,
                    Extent {
                        offset: written,
                        n_rows: n_rows_word,
                    },
                );
            }
            encode_seal(&mut buf, *cluster, n_rows_word, row_len, *digest);
            index.seal(*cluster, n_rows as u64, *digest);
            writer
                .write_all(&buf)
                .map_err(|e| StoreError::io("write compaction file", e))?;
            written += buf.len() as u64;
        }

        let tmp = writer
            .into_inner()
            .map_err(|e| StoreError::io("flush compaction file", e.into_error()))?;
        tmp.sync_all()
            .map_err(|e| StoreError::io("sync compaction file", e))?;
        drop(tmp);
        std::fs::rename(&tmp_path, &self.chunk_path)
            .map_err(|e| StoreError::io("install compacted chunk file", e))?;

        self.file = open_append(&self.chunk_path)?;
        self.len = written;
        self.index = index;
        self.dirty = true;
        self.write_manifest()?;

        let report = CompactionReport {
            field: self.spec.name.clone(),
            bytes_before,
            bytes_after: written,
            regions: sealed.len(),
        };
        info!(
            "Compacted '{}': {} -> {} bytes ({} regions)",
            report.field, report.bytes_before, report.bytes_after, report.regions
        );
        Ok(report)
    }

    /// Drop every region and empty the chunk file
    pub(crate) fn clear(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .map_err(|e| StoreError::io("truncate chunk file", e))?;
        self.len = 0;
        self.index = RegionIndex::default();
        self.dirty = true;
        self.write_manifest()
    }
}
