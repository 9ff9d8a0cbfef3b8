//! Snapshot file codec.
//!
//! A snapshot is a full serialization of the authoritative maps at a
//! specific WAL sequence, written atomically via [`AtomicFileWriter`].
//!
//! ## Layout (little-endian)
//!
//! ```text
//! header:
//!   u32 magic   = 0x56444244 ("VDBD")
//!   u32 version = 1
//!   u64 sequence       WAL sequence at snapshot time
//!   u64 timestamp_us
//! body:
//!   u64 count
//!   per entry (unordered):
//!     u32 key_len  · key bytes
//!     u32 dims     · dims × f32
//!     u32 meta_len · meta bytes
//! footer:
//!   u32 magic = 0x454E444D ("ENDM")
//!   u32 checksum = XOR fold of (key_len, dims, meta_len) across entries
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::info;

use crate::error::{Result, StorageError};
use crate::storage::wal::now_us;
use crate::storage::writer::AtomicFileWriter;
use crate::types::Vector;

/// Header magic, "VDBD".
pub const SNAPSHOT_MAGIC: u32 = 0x5644_4244;
/// Footer magic, "ENDM".
pub const SNAPSHOT_FOOTER_MAGIC: u32 = 0x454E_444D;
/// The only accepted format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Writes a snapshot of the maps to `path` atomically.
///
/// The temporary lives next to the final path and is renamed over it on
/// commit; a crash mid-write leaves the previous snapshot untouched.
pub fn write_snapshot(
    path: &Path,
    vectors: &HashMap<String, Vector>,
    metadata: &HashMap<String, String>,
    sequence: u64,
) -> Result<()> {
    let mut writer = AtomicFileWriter::new(path)?;

    writer.write_u32::<LittleEndian>(SNAPSHOT_MAGIC)?;
    writer.write_u32::<LittleEndian>(SNAPSHOT_VERSION)?;
    writer.write_u64::<LittleEndian>(sequence)?;
    writer.write_u64::<LittleEndian>(now_us())?;

    writer.write_u64::<LittleEndian>(vectors.len() as u64)?;

    let mut footer_crc = 0u32;
    for (key, vector) in vectors {
        let key_len = key.len() as u32;
        writer.write_u32::<LittleEndian>(key_len)?;
        writer.write_all(key.as_bytes())?;
        footer_crc ^= key_len;

        let dims = vector.len() as u32;
        writer.write_u32::<LittleEndian>(dims)?;
        for x in vector.as_slice() {
            writer.write_f32::<LittleEndian>(*x)?;
        }
        footer_crc ^= dims;

        let meta = metadata.get(key).map(String::as_str).unwrap_or("");
        let meta_len = meta.len() as u32;
        writer.write_u32::<LittleEndian>(meta_len)?;
        writer.write_all(meta.as_bytes())?;
        footer_crc ^= meta_len;
    }

    writer.write_u32::<LittleEndian>(SNAPSHOT_FOOTER_MAGIC)?;
    writer.write_u32::<LittleEndian>(footer_crc)?;

    writer.commit()?;
    info!(
        path = %path.display(),
        entries = vectors.len(),
        sequence,
        "snapshot written"
    );
    Ok(())
}

/// Reads a snapshot into fresh maps, returning them with the sequence it
/// was taken at.
///
/// Magic, version, footer magic, and the footer checksum are all
/// validated; any failure is a [`StorageError`] and nothing is returned.
pub fn read_snapshot(
    path: &Path,
) -> Result<(HashMap<String, Vector>, HashMap<String, String>, u64)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != SNAPSHOT_MAGIC {
        return Err(StorageError::corrupted(format!(
            "bad snapshot magic {magic:#010x} in {}",
            path.display()
        ))
        .into());
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != SNAPSHOT_VERSION {
        return Err(StorageError::UnsupportedVersion {
            expected: SNAPSHOT_VERSION,
            found: version,
        }
        .into());
    }

    let sequence = reader.read_u64::<LittleEndian>()?;
    let _timestamp_us = reader.read_u64::<LittleEndian>()?;
    let count = reader.read_u64::<LittleEndian>()?;

    let mut vectors = HashMap::with_capacity(count as usize);
    let mut metadata = HashMap::new();
    let mut footer_crc = 0u32;

    for _ in 0..count {
        let key_len = reader.read_u32::<LittleEndian>()?;
        let mut key_bytes = vec![0u8; key_len as usize];
        reader.read_exact(&mut key_bytes)?;
        let key = String::from_utf8_lossy(&key_bytes).into_owned();
        footer_crc ^= key_len;

        let dims = reader.read_u32::<LittleEndian>()?;
        let mut components = Vec::with_capacity(dims as usize);
        for _ in 0..dims {
            components.push(reader.read_f32::<LittleEndian>()?);
        }
        footer_crc ^= dims;

        let meta_len = reader.read_u32::<LittleEndian>()?;
        let mut meta_bytes = vec![0u8; meta_len as usize];
        reader.read_exact(&mut meta_bytes)?;
        footer_crc ^= meta_len;

        if meta_len > 0 {
            metadata.insert(key.clone(), String::from_utf8_lossy(&meta_bytes).into_owned());
        }
        vectors.insert(key, Vector::from(components));
    }

    let footer_magic = reader.read_u32::<LittleEndian>()?;
    if footer_magic != SNAPSHOT_FOOTER_MAGIC {
        return Err(StorageError::corrupted(format!(
            "bad snapshot footer magic {footer_magic:#010x} in {}",
            path.display()
        ))
        .into());
    }
    let stored_crc = reader.read_u32::<LittleEndian>()?;
    if stored_crc != footer_crc {
        return Err(StorageError::ChecksumMismatch {
            expected: stored_crc,
            actual: footer_crc,
        }
        .into());
    }

    Ok((vectors, metadata, sequence))
}

/// Cheap header probe: does the file start with the snapshot magic?
///
/// Used by recovery analysis to distinguish a valid-looking snapshot
/// from a corrupted one without loading the body.
pub fn validate_header(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut reader = BufReader::new(file);
    matches!(
        reader.read_u32::<LittleEndian>(),
        Ok(magic) if magic == SNAPSHOT_MAGIC
    )
}

/// Reads the WAL sequence from a snapshot header, 0 on any failure.
pub fn read_sequence(path: &Path) -> u64 {
    let Ok(file) = File::open(path) else {
        return 0;
    };
    let mut reader = BufReader::new(file);
    let Ok(magic) = reader.read_u32::<LittleEndian>() else {
        return 0;
    };
    if magic != SNAPSHOT_MAGIC {
        return 0;
    }
    if reader.read_u32::<LittleEndian>().is_err() {
        return 0;
    }
    reader.read_u64::<LittleEndian>().unwrap_or(0)
}
