//! Chunk file record format
//!
//! A chunk file is an append-only log of records. Every record starts with a
//! fixed 32-byte little-endian header:
//!
//! ```text
//! +-------+------+----------+---------+--------+---------+-----+-------+
//! | magic | kind | reserved | cluster | n_rows | row_len | aux | crc32 |
//! |  u32  |  u8  |  [u8;3]  |   u64   |  u32   |   u32   | u32 |  u32  |
//! +-------+------+----------+---------+--------+---------+-----+-------+
//! ```
//!
//! followed, for `Data` records only, by `n_rows * row_len` `f32` values.
//! The CRC covers the first 28 header bytes and the payload.
//!
//! | Kind | n_rows | aux |
//! |------|--------|-----|
//! | Data | rows in this extent | 0 |
//! | Seal | total rows of the region | spike-id digest |
//! | Tombstone | 0 | 0 |

use byteorder::{ByteOrder, LittleEndian};
use clusterstore_core::{ClusterId, Result, StoreError};

/// Magic bytes at the start of every record ("CLSR")
pub const RECORD_MAGIC: u32 = 0x434C_5352;

/// Size of a record header in bytes
pub const RECORD_HEADER_SIZE: usize = 32;

const CRC_OFFSET: usize = 28;

/// Record kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// One extent of rows for one cluster
    Data = 1,
    /// The cluster's region is complete
    Seal = 2,
    /// The cluster's region is invalid from here on
    Tombstone = 3,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordKind::Data),
            2 => Some(RecordKind::Seal),
            3 => Some(RecordKind::Tombstone),
            _ => None,
        }
    }
}

/// Decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Record kind
    pub kind: RecordKind,
    /// Cluster the record belongs to
    pub cluster: ClusterId,
    /// Row count (see module docs)
    pub n_rows: u32,
    /// Scalars per row
    pub row_len: u32,
    /// Kind-specific word (see module docs)
    pub aux: u32,
    /// CRC32 of header and payload
    pub crc: u32,
}

impl RecordHeader {
    /// Payload size in bytes
    pub fn payload_len(&self) -> u64 {
        match self.kind {
            RecordKind::Data => self.n_rows as u64 * self.row_len as u64 * 4,
            RecordKind::Seal | RecordKind::Tombstone => 0,
        }
    }

    /// Total record size in bytes
    pub fn record_len(&self) -> u64 {
        RECORD_HEADER_SIZE as u64 + self.payload_len()
    }

    /// Decode a header
    ///
    /// # Errors
    ///
    /// `Corruption` on a bad magic or unknown kind.
    pub fn decode(bytes: &[u8; RECORD_HEADER_SIZE]) -> Result<Self> {
        let magic = LittleEndian::read_u32(&bytes[0..4]);
        if magic != RECORD_MAGIC {
            return Err(StoreError::Corruption(format!(
                "bad record magic {:#010x}",
                magic
            )));
        }
        let kind = RecordKind::from_u8(bytes[4])
            .ok_or_else(|| StoreError::Corruption(format!("unknown record kind {}", bytes[4])))?;
        Ok(Self {
            kind,
            cluster: LittleEndian::read_u64(&bytes[8..16]),
            n_rows: LittleEndian::read_u32(&bytes[16..20]),
            row_len: LittleEndian::read_u32(&bytes[20..24]),
            aux: LittleEndian::read_u32(&bytes[24..28]),
            crc: LittleEndian::read_u32(&bytes[28..32]),
        })
    }
}

fn put_header(
    buf: &mut Vec<u8>,
    kind: RecordKind,
    cluster: ClusterId,
    n_rows: u32,
    row_len: u32,
    aux: u32,
) -> usize {
    let start = buf.len();
    let mut header = [0u8; RECORD_HEADER_SIZE];
    LittleEndian::write_u32(&mut header[0..4], RECORD_MAGIC);
    header[4] = kind as u8;
    LittleEndian::write_u64(&mut header[8..16], cluster);
    LittleEndian::write_u32(&mut header[16..20], n_rows);
    LittleEndian::write_u32(&mut header[20..24], row_len);
    LittleEndian::write_u32(&mut header[24..28], aux);
    buf.extend_from_slice(&header);
    start
}

fn seal_crc(buf: &mut [u8], start: usize) {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[start..start + CRC_OFFSET]);
    hasher.update(&buf[start + RECORD_HEADER_SIZE..]);
    let crc = hasher.finalize();
    LittleEndian::write_u32(&mut buf[start + CRC_OFFSET..start + RECORD_HEADER_SIZE], crc);
}

/// Convert a row count or row length to its header word
///
/// # Errors
///
/// `InvalidConfig` if the value does not fit in a `u32`.
pub fn header_word(what: &str, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        StoreError::InvalidConfig(format!(
            "{} of {} does not fit in a record header",
            what, value
        ))
    })
}

/// Append a `Data` record to `buf`
///
/// `rows` holds `rows.len() / row_len` rows back to back. Returns the offset
/// of the record within `buf`.
///
/// # Errors
///
/// `InvalidConfig` if the row count or row length overflows its header word;
/// `buf` is left untouched in that case.
pub fn encode_data(
    buf: &mut Vec<u8>,
    cluster: ClusterId,
    row_len: usize,
    rows: &[f32],
) -> Result<usize> {
    let n_rows = if row_len == 0 { 0 } else { rows.len() / row_len };
    let n_rows = header_word("row count", n_rows)?;
    let row_len = header_word("row length", row_len)?;
    let start = put_header(buf, RecordKind::Data, cluster, n_rows, row_len, 0);
    let payload = buf.len();
    buf.resize(payload + rows.len() * 4, 0);
    LittleEndian::write_f32_into(rows, &mut buf[payload..]);
    let end = buf.len();
    seal_crc(&mut buf[..end], start);
    Ok(start)
}

/// Append a `Seal` record to `buf`
pub fn encode_seal(buf: &mut Vec<u8>, cluster: ClusterId, n_rows: u32, row_len: u32, digest: u32) {
    let start = put_header(buf, RecordKind::Seal, cluster, n_rows, row_len, digest);
    let end = buf.len();
    seal_crc(&mut buf[start..end], 0);
}

/// Append a `Tombstone` record to `buf`
pub fn encode_tombstone(buf: &mut Vec<u8>, cluster: ClusterId, row_len: u32) {
    let start = put_header(buf, RecordKind::Tombstone, cluster, 0, row_len, 0);
    let end = buf.len();
    seal_crc(&mut buf[start..end], 0);
}

/// Verify the CRC of a payload-free record (`Seal` or `Tombstone`)
pub fn verify_marker(bytes: &[u8; RECORD_HEADER_SIZE], header: &RecordHeader) -> bool {
    header.payload_len() == 0 && crc32fast::hash(&bytes[..CRC_OFFSET]) == header.crc
}

/// Verify a `Data` record and decode its payload into `out`
///
/// `record` is the full record (header and payload).
///
/// # Errors
///
/// `Corruption` on a CRC mismatch or a size mismatch with `out`.
pub fn decode_data(record: &[u8], header: &RecordHeader, out: &mut [f32]) -> Result<()> {
    if record.len() as u64 != header.record_len() {
        return Err(StoreError::Corruption(format!(
            "record for cluster {} has {} bytes, expected {}",
            header.cluster,
            record.len(),
            header.record_len()
        )));
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&record[..CRC_OFFSET]);
    hasher.update(&record[RECORD_HEADER_SIZE..]);
    if hasher.finalize() != header.crc {
        return Err(StoreError::Corruption(format!(
            "CRC mismatch in data record for cluster {}",
            header.cluster
        )));
    }
    let payload = &record[RECORD_HEADER_SIZE..];
    if payload.len() != out.len() * 4 {
        return Err(StoreError::Corruption(format!(
            "payload of {} bytes does not fill {} values",
            payload.len(),
            out.len()
        )));
    }
    LittleEndian::read_f32_into(payload, out);
    Ok(())
}
