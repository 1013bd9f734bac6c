//! Manifest file format
//!
//! A manifest is a snapshot of one field's region index written next to its
//! chunk file, so that reopening a store does not rescan the log.
//!
//! ```text
//! +-------+---------+-------+-------------+------------------+
//! | magic | version | crc32 | body_len u64 | bincode body ... |
//! +-------+---------+-------+-------------+------------------+
//! ```
//!
//! The body records the chunk file length it describes. A manifest whose CRC
//! fails or whose length disagrees with the chunk file is ignored and the log
//! is rescanned instead.

use crate::disk::region::RegionIndex;
use byteorder::{ByteOrder, LittleEndian};
use clusterstore_core::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// Magic bytes at the start of a manifest ("CLSM")
pub const MANIFEST_MAGIC: u32 = 0x434C_534D;

/// Current manifest format version
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const MANIFEST_HEADER_SIZE: usize = 20;

/// Manifest body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Field the manifest belongs to
    pub field: String,
    /// Scalars per row of the field
    pub row_len: u32,
    /// Chunk file length the index describes
    pub chunk_len: u64,
    /// Region index snapshot
    pub index: RegionIndex,
}

impl Manifest {
    /// Encode to bytes
    ///
    /// # Errors
    ///
    /// `Serialization` if the body cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body =
            bincode::serialize(self).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut out = vec![0u8; MANIFEST_HEADER_SIZE];
        LittleEndian::write_u32(&mut out[0..4], MANIFEST_MAGIC);
        LittleEndian::write_u32(&mut out[4..8], MANIFEST_FORMAT_VERSION);
        LittleEndian::write_u32(&mut out[8..12], crc32fast::hash(&body));
        LittleEndian::write_u64(&mut out[12..20], body.len() as u64);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode from bytes
    ///
    /// # Errors
    ///
    /// `Corruption` on a bad magic, version, length or CRC;
    /// `Serialization` if the body does not decode.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MANIFEST_HEADER_SIZE {
            return Err(StoreError::Corruption("manifest too short".to_string()));
        }
        if LittleEndian::read_u32(&bytes[0..4]) != MANIFEST_MAGIC {
            return Err(StoreError::Corruption("bad manifest magic".to_string()));
        }
        let version = LittleEndian::read_u32(&bytes[4..8]);
        if version != MANIFEST_FORMAT_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported manifest version {}",
                version
            )));
        }
        let crc = LittleEndian::read_u32(&bytes[8..12]);
        let len = LittleEndian::read_u64(&bytes[12..20]) as usize;
        let body = &bytes[MANIFEST_HEADER_SIZE..];
        if body.len() != len {
            return Err(StoreError::Corruption(format!(
                "manifest body has {} bytes, header says {}",
                body.len(),
                len
            )));
        }
        if crc32fast::hash(body) != crc {
            return Err(StoreError::Corruption("manifest CRC mismatch".to_string()));
        }
        bincode::deserialize(body).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}
