//! Index File Module
//!
//! Binary entry table persisted next to the data file. Little-endian:
//!
//! ```text
//! i32 version | i64 disk_bytes | i32 entry_count
//! entry_count x { u32 key | u32 size | i64 position | i64 last_access | i64 expiration }
//! ```

use crate::cache_types::Timestamp;
use crate::{CacheError, Result};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use tracing::debug;

/// Bumped whenever the layout changes; older files are discarded
pub const INDEX_VERSION: i32 = 3;

pub const HEADER_SIZE: usize = 16;
pub const RECORD_SIZE: usize = 32;

/// One persisted entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub key: u32,
    pub size: u32,
    pub position: i64,
    pub last_access: Timestamp,
    pub expiration: Timestamp,
}

impl IndexRecord {
    fn encode(&self, buf: &mut [u8; RECORD_SIZE]) {
        buf[0..4].copy_from_slice(&self.key.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.position.to_le_bytes());
        buf[16..24].copy_from_slice(&self.last_access.ticks().to_le_bytes());
        buf[24..32].copy_from_slice(&self.expiration.ticks().to_le_bytes());
    }

    fn decode(buf: &[u8; RECORD_SIZE]) -> Self {
        Self {
            key: u32::from_le_bytes(le_array(&buf[0..4])),
            size: u32::from_le_bytes(le_array(&buf[4..8])),
            position: i64::from_le_bytes(le_array(&buf[8..16])),
            last_access: Timestamp::from_ticks(i64::from_le_bytes(le_array(&buf[16..24]))),
            expiration: Timestamp::from_ticks(i64::from_le_bytes(le_array(&buf[24..32]))),
        }
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Contents of a successfully parsed index file
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub disk_bytes: u64,
    pub records: Vec<IndexRecord>,
}

/// Write the index atomically: to `<path>.tmp`, then rename over `path`
pub fn write_index(path: &Path, disk_bytes: u64, records: &[IndexRecord]) -> Result<()> {
    let count = i32::try_from(records.len()).map_err(|_| {
        CacheError::InternalError(format!("Too many index entries: {}", records.len()))
    })?;
    let disk_bytes = i64::try_from(disk_bytes)
        .map_err(|_| CacheError::InternalError(format!("Disk size out of range: {}", disk_bytes)))?;

    let temp_path = path.with_extension("index.tmp");
    {
        let file = File::create(&temp_path).map_err(|e| {
            CacheError::IoError(format!("Failed to create index file {:?}: {}", temp_path, e))
        })?;
        let mut writer = BufWriter::new(file);

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&INDEX_VERSION.to_le_bytes());
        header[4..12].copy_from_slice(&disk_bytes.to_le_bytes());
        header[12..16].copy_from_slice(&count.to_le_bytes());
        writer.write_all(&header)?;

        let mut buf = [0u8; RECORD_SIZE];
        for record in records {
            record.encode(&mut buf);
            writer.write_all(&buf)?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| CacheError::IoError(format!("Failed to flush index file: {}", e)))?;
        file.sync_data()?;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        CacheError::IoError(format!("Failed to rename index file into place: {}", e))
    })?;

    debug!(
        "Wrote index {:?}: {} entries, {} disk bytes",
        path,
        records.len(),
        disk_bytes
    );
    Ok(())
}

/// Read the index file.
///
/// `Ok(None)` when the file does not exist. Structural problems (short file,
/// version mismatch, truncated or out-of-range records) yield
/// [`CacheError::CorruptIndex`] so the caller can start cold.
pub fn read_index(path: &Path) -> Result<Option<IndexSnapshot>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CacheError::IoError(format!(
                "Failed to open index file {:?}: {}",
                path, e
            )))
        }
    };

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    if bytes.len() < HEADER_SIZE {
        return Err(CacheError::CorruptIndex(format!(
            "Index is {} bytes, shorter than its header",
            bytes.len()
        )));
    }

    let version = i32::from_le_bytes(le_array(&bytes[0..4]));
    if version != INDEX_VERSION {
        return Err(CacheError::CorruptIndex(format!(
            "Index version {} does not match expected {}",
            version, INDEX_VERSION
        )));
    }

    let disk_bytes = i64::from_le_bytes(le_array(&bytes[4..12]));
    let count = i32::from_le_bytes(le_array(&bytes[12..16]));
    if disk_bytes < 0 || count < 0 {
        return Err(CacheError::CorruptIndex(format!(
            "Negative header field (disk_bytes {}, count {})",
            disk_bytes, count
        )));
    }

    let count = count as usize;
    let body = &bytes[HEADER_SIZE..];
    if body.len() < count * RECORD_SIZE {
        return Err(CacheError::CorruptIndex(format!(
            "Index declares {} entries but holds only {} bytes of records",
            count,
            body.len()
        )));
    }

    let disk_bytes = disk_bytes as u64;
    let mut records = Vec::with_capacity(count);
    for chunk in body.chunks_exact(RECORD_SIZE).take(count) {
        let record = IndexRecord::decode(&le_array(chunk));
        let end = record.position.checked_add(i64::from(record.size));
        match end {
            Some(end) if record.position >= 0 && end as u64 <= disk_bytes => {}
            _ => {
                return Err(CacheError::CorruptIndex(format!(
                    "Entry {:08x} at {} (+{}) lies outside {} disk bytes",
                    record.key, record.position, record.size, disk_bytes
                )))
            }
        }
        records.push(record);
    }

    Ok(Some(IndexSnapshot {
        disk_bytes,
        records,
    }))
}
