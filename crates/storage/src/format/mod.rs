//! On-disk byte formats for chunk files and manifests.
//!
//! This module centralizes all serialization logic for the disk tier.
//! Keeping serialization separate from operational logic (how regions are
//! appended, recovered and compacted) makes format evolution easier to manage.
//!
//! # Module Structure
//!
//! - `record`: chunk file record header and payload format
//! - `manifest`: per-field region index snapshot

pub mod manifest;
pub mod record;

pub use manifest::{Manifest, MANIFEST_FORMAT_VERSION, MANIFEST_MAGIC};
pub use record::{
    decode_data, encode_data, encode_seal, encode_tombstone, header_word, verify_marker,
    RecordHeader, RecordKind, RECORD_HEADER_SIZE, RECORD_MAGIC,
};
