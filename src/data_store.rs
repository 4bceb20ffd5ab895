//! Data Store Module
//!
//! Payload bytes live back to back in a single data file. Every write-back
//! that changes an entry's footprint, and every removal, shifts the tail of
//! the file left so the file never contains holes. Entry positions after the
//! moved range are adjusted in the same critical section.

use crate::cache_types::{CacheEntry, EntryRef, EntryState, PersistenceState, NOT_ON_DISK};
use crate::{CacheError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

const MOVE_BUFFER_SIZE: usize = 8192;

/// Hook used before appending, so the owner can enforce its disk budget.
///
/// Implementations may call [`StoreFile::remove`] on other entries; they must
/// never block on an entry lock.
pub trait DiskBudget {
    fn make_room(
        &self,
        store: &mut StoreFile,
        entries: &[EntryRef],
        protect: &EntryRef,
        len: u64,
    ) -> Result<()>;
}

/// Budget that never evicts
#[derive(Debug, Default, Clone, Copy)]
pub struct Unbounded;

impl DiskBudget for Unbounded {
    fn make_room(&self, _: &mut StoreFile, _: &[EntryRef], _: &EntryRef, _: u64) -> Result<()> {
        Ok(())
    }
}

/// Open data file plus the byte count it logically holds
#[derive(Debug)]
pub struct StoreFile {
    file: File,
    disk_bytes: u64,
}

/// The data file, serialized behind one lock
#[derive(Debug)]
pub struct DataStore {
    inner: Mutex<StoreFile>,
}

impl DataStore {
    /// Open (or create) the data file and take an exclusive advisory lock on it
    pub fn open(path: &Path, disk_bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CacheError::IoError(format!("Failed to open data file {:?}: {}", path, e)))?;

        file.try_lock_exclusive().map_err(|e| {
            CacheError::LockContention(format!("Data file {:?} is locked by another owner: {}", path, e))
        })?;

        Ok(Self {
            inner: Mutex::new(StoreFile { file, disk_bytes }),
        })
    }

    /// Acquire the store lock
    pub fn lock(&self) -> MutexGuard<'_, StoreFile> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn disk_bytes(&self) -> u64 {
        self.lock().disk_bytes
    }
}

impl StoreFile {
    pub fn disk_bytes(&self) -> u64 {
        self.disk_bytes
    }

    /// Physical length of the file, which may exceed `disk_bytes` until the
    /// next truncation
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Read an entry's payload from its current position
    pub fn read(&mut self, entry: &CacheEntry, size: u32) -> Result<Vec<u8>> {
        let position = entry.position();
        if position == NOT_ON_DISK {
            return Err(CacheError::InternalError(format!(
                "Entry {:08x} has no disk position",
                entry.key()
            )));
        }

        let mut buf = vec![0u8; size as usize];
        self.file.seek(SeekFrom::Start(position as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Persist a dirty entry's payload.
    ///
    /// Unwritten entries are appended. Entries whose size is unchanged are
    /// overwritten in place. Otherwise the old range is removed (compacting
    /// the file) and the new payload is appended at the tail.
    pub fn write_back(
        &mut self,
        entries: &[EntryRef],
        entry: &EntryRef,
        state: &mut EntryState,
        budget: &dyn DiskBudget,
    ) -> Result<()> {
        let Some(data) = state.data.as_deref() else {
            warn!(
                "Entry {:08x} marked dirty without a resident payload, skipping write-back",
                entry.key()
            );
            state.persistence.is_dirty = false;
            return Ok(());
        };

        let position = entry.position();
        let len = data.len() as u64;

        if position != NOT_ON_DISK && u64::from(state.disk_len()) == len {
            self.write_at(position as u64, data)?;
            debug!("Overwrote entry {:08x} in place at {}", entry.key(), position);
        } else {
            if position != NOT_ON_DISK {
                self.remove_range(entries, position as u64, u64::from(state.disk_len()))?;
                entry.set_position(NOT_ON_DISK);
            }

            budget.make_room(self, entries, entry, len)?;

            let position = self.disk_bytes;
            self.disk_bytes += len;
            entry.set_position(position as i64);
            self.write_at(position, data)?;
            debug!("Appended entry {:08x} at {} ({} bytes)", entry.key(), position, len);
        }

        state.persistence = PersistenceState::default();
        Ok(())
    }

    /// Remove an entry's bytes from the file, compacting what follows.
    ///
    /// Returns the number of disk bytes released.
    pub fn remove(
        &mut self,
        entries: &[EntryRef],
        entry: &CacheEntry,
        state: &mut EntryState,
    ) -> Result<u64> {
        let position = entry.position();
        if position == NOT_ON_DISK {
            return Ok(0);
        }

        let len = u64::from(state.disk_len());
        self.remove_range(entries, position as u64, len)?;
        entry.set_position(NOT_ON_DISK);
        state.persistence = PersistenceState::default();
        debug!("Removed entry {:08x} ({} bytes) from disk", entry.key(), len);
        Ok(len)
    }

    /// Truncate the file to `disk_bytes` and push it to stable storage
    pub fn truncate_to_len(&mut self) -> Result<()> {
        self.file.set_len(self.disk_bytes)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Drop every payload
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.disk_bytes = 0;
        Ok(())
    }

    fn remove_range(&mut self, entries: &[EntryRef], start: u64, len: u64) -> Result<()> {
        let end = start + len;
        let tail = self.disk_bytes.saturating_sub(end);
        self.move_block(end, start, tail)?;

        let start = start as i64;
        let shift = len as i64;
        for other in entries {
            let position = other.position();
            if position > start {
                other.set_position(position - shift);
            }
        }

        self.disk_bytes -= len.min(self.disk_bytes);
        Ok(())
    }

    /// Copy `len` bytes from `from` down to `to` (`to <= from`)
    fn move_block(&mut self, from: u64, to: u64, len: u64) -> Result<()> {
        if len == 0 || from == to {
            return Ok(());
        }

        let mut buf = [0u8; MOVE_BUFFER_SIZE];
        let mut moved = 0u64;
        while moved < len {
            let chunk = (len - moved).min(MOVE_BUFFER_SIZE as u64) as usize;
            self.file.seek(SeekFrom::Start(from + moved))?;
            self.file.read_exact(&mut buf[..chunk])?;
            self.file.seek(SeekFrom::Start(to + moved))?;
            self.file.write_all(&buf[..chunk])?;
            moved += chunk as u64;
        }
        Ok(())
    }

    fn write_at(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(data)?;
        Ok(())
    }
}
