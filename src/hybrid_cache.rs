//! Hybrid Cache Module
//!
//! Two-tier blob cache: payloads live in memory until the memory budget
//! forces them out, at which point they are written back to a single
//! compacted data file. The disk tier has its own budget; entries evicted
//! from it become ghosts whose slots are recycled by the next `set` or
//! dropped by the next sweep.
//!
//! Lock order is table gate, entry lock, memory budget lock, store lock.
//! Any entry lock taken while holding a later lock is only ever `try_lock`ed,
//! so an entry held by another thread is treated as pinned rather than waited
//! on.

use crate::access_gate::{AccessGate, WriteSection};
use crate::cache_policy::{CachePolicy, EntryView, EvictionAlgorithm, EvictionTier};
use crate::cache_types::{key_hash, CacheEntry, EntryRef, EntryState, Timestamp, NOT_ON_DISK};
use crate::config::CacheConfig;
use crate::data_store::{DataStore, DiskBudget, StoreFile};
use crate::index_file::{self, IndexRecord, IndexSnapshot};
use crate::{CacheError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default file names used by [`HybridCache::open_in`]
pub const DEFAULT_DATA_FILE: &str = "cache.bin";
pub const DEFAULT_INDEX_FILE: &str = "cache.index";

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub entries_count: u64,
    pub ghost_count: u64,
    pub resident_count: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub max_memory_size: u64,
    pub max_disk_size: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f32,
    pub memory_eviction_count: u64,
    pub disk_eviction_count: u64,
    pub expired_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    memory_evictions: AtomicU64,
    disk_evictions: AtomicU64,
    expired: AtomicU64,
}

/// Persistent memory + disk cache shared across threads
#[derive(Debug)]
pub struct HybridCache {
    data_path: PathBuf,
    index_path: PathBuf,
    table: AccessGate<Vec<EntryRef>>,
    store: DataStore,
    policy: RwLock<Arc<dyn CachePolicy>>,
    memory_lock: Mutex<()>,
    cleanup_lock: Mutex<()>,
    index_lock: Mutex<()>,
    memory_bytes: AtomicU64,
    max_memory_size: AtomicU64,
    max_disk_size: AtomicU64,
    next_expiration: AtomicI64,
    clock: AtomicI64,
    write_gate_timeout: Option<Duration>,
    counters: Counters,
    closed: AtomicBool,
}

/// Disk budget enforcement used by every write-back
struct DiskPressure<'a> {
    cache: &'a HybridCache,
}

impl DiskBudget for DiskPressure<'_> {
    fn make_room(
        &self,
        store: &mut StoreFile,
        entries: &[EntryRef],
        protect: &EntryRef,
        len: u64,
    ) -> Result<()> {
        let cache = self.cache;
        let max = cache.max_disk_size();
        if store.disk_bytes() + len <= max {
            return Ok(());
        }

        let mut skipped = vec![false; entries.len()];
        while store.disk_bytes() + len > max {
            let Some((slot, mut state)) =
                cache.pick_victim(entries, protect, EvictionTier::Disk, &mut skipped)
            else {
                warn!(
                    "Disk budget exceeded with no evictable entry: {} + {} > {} bytes",
                    store.disk_bytes(),
                    len,
                    max
                );
                break;
            };
            skipped[slot] = true;

            let victim = &entries[slot];
            let released = store.remove(entries, victim, &mut state)?;
            if let Some(freed) = state.free() {
                cache.release_memory(u64::from(freed));
            }
            state.persistence.is_ghost = true;
            cache.counters.disk_evictions.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Evicted entry {:08x} from disk ({} bytes), now a ghost",
                victim.key(),
                released
            );
            // Ghost slots are dropped by the next sweep
            cache
                .next_expiration
                .fetch_min(Timestamp::now().ticks(), Ordering::AcqRel);
        }
        Ok(())
    }
}

impl HybridCache {
    /// Open a cache over the given data and index files with default budgets
    pub fn open(data_path: impl AsRef<Path>, index_path: impl AsRef<Path>) -> Result<Self> {
        Self::build(
            data_path.as_ref(),
            index_path.as_ref(),
            &CacheConfig::default(),
        )
    }

    /// Open a cache stored as `cache.bin` / `cache.index` inside `folder`
    pub fn open_in(folder: impl AsRef<Path>) -> Result<Self> {
        let folder = folder.as_ref();
        Self::open(
            folder.join(DEFAULT_DATA_FILE),
            folder.join(DEFAULT_INDEX_FILE),
        )
    }

    /// Open a cache as described by `config`
    pub fn with_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        Self::build(&config.data_path(), &config.index_path(), config)
    }

    fn build(data_path: &Path, index_path: &Path, config: &CacheConfig) -> Result<Self> {
        for path in [data_path, index_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| {
                    CacheError::IoError(format!(
                        "Failed to create cache directory {:?}: {}",
                        parent, e
                    ))
                })?;
            }
        }

        let snapshot = match index_file::read_index(index_path) {
            Ok(snapshot) => snapshot,
            Err(CacheError::CorruptIndex(reason)) => {
                warn!("Discarding index {:?}: {}", index_path, reason);
                None
            }
            Err(e) => return Err(e),
        };

        let file_len = match fs::metadata(data_path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let snapshot = snapshot.and_then(|snapshot| match verify_snapshot(&snapshot, file_len) {
            Ok(()) => Some(snapshot),
            Err(reason) => {
                warn!("Discarding index {:?}: {}", index_path, reason);
                None
            }
        });

        let cold = snapshot.is_none();
        let snapshot = snapshot.unwrap_or_default();
        let store = DataStore::open(data_path, snapshot.disk_bytes)?;
        if cold {
            store.lock().clear()?;
        }

        let mut next_expiration = i64::MAX;
        let mut clock = i64::MIN;
        let entries: Vec<EntryRef> = snapshot
            .records
            .iter()
            .map(|record| {
                next_expiration = next_expiration.min(record.expiration.ticks());
                clock = clock.max(record.last_access.ticks());
                Arc::new(CacheEntry::from_disk(
                    record.key,
                    record.size,
                    record.position,
                    record.last_access,
                    record.expiration,
                ))
            })
            .collect();

        if cold {
            info!("Starting cold cache at {:?}", data_path);
        } else {
            info!(
                "Opened cache at {:?}: {} entries, {} disk bytes",
                data_path,
                entries.len(),
                snapshot.disk_bytes
            );
        }

        let cache = Self {
            data_path: data_path.to_path_buf(),
            index_path: index_path.to_path_buf(),
            table: AccessGate::with_max_readers(entries, config.max_concurrent_readers),
            store,
            policy: RwLock::new(config.eviction_algorithm.build()),
            memory_lock: Mutex::new(()),
            cleanup_lock: Mutex::new(()),
            index_lock: Mutex::new(()),
            memory_bytes: AtomicU64::new(0),
            max_memory_size: AtomicU64::new(config.max_memory_size),
            max_disk_size: AtomicU64::new(config.max_disk_size),
            next_expiration: AtomicI64::new(next_expiration),
            clock: AtomicI64::new(clock),
            write_gate_timeout: config.write_gate_timeout,
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        };

        cache.check_for_expired()?;
        Ok(cache)
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Whether a live entry exists for `key`
    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.contains_hash(key_hash(key))
    }

    /// Whether a live entry exists for an already hashed key
    pub fn contains_hash(&self, hash: u32) -> Result<bool> {
        self.check_for_expired()?;

        let entries = self.table.read();
        let Some(entry) = find_entry(&entries, hash) else {
            return Ok(false);
        };
        let state = entry.lock();
        Ok(!state.persistence.is_ghost && !state.is_expired_at(Timestamp::now()))
    }

    /// Store `data` under `key` without expiration
    pub fn set(&self, key: &str, data: &[u8]) -> Result<()> {
        self.set_with_expiration(key, data, Timestamp::MAX)
    }

    /// Store `data` under `key`, expiring at `expiration`
    pub fn set_with_expiration(&self, key: &str, data: &[u8], expiration: Timestamp) -> Result<()> {
        let size = u32::try_from(data.len()).map_err(|_| {
            CacheError::InternalError(format!(
                "Payload of {} bytes exceeds the per-entry limit",
                data.len()
            ))
        })?;

        self.check_for_expired()?;

        let hash = key_hash(key);
        let mut entries = self.enter_write()?;
        let now = self.tick();

        if let Some(entry) = find_entry(&entries, hash).cloned() {
            let mut state = entry.lock();
            if !state.persistence.is_dirty {
                state.persistence.old_size = state.size;
                state.persistence.is_dirty = true;
            }
            state.persistence.is_ghost = false;
            if let Some(freed) = state.free() {
                self.release_memory(u64::from(freed));
            }

            self.allocate_memory(&entries, &entry, u64::from(size))?;
            state.data = Some(data.to_vec());
            state.size = size;
            state.last_access = now;
            state.expiration = expiration;
            state.access_count += 1;
            debug!("Updated entry {:08x} ({} bytes)", hash, size);
        } else {
            let entry = Arc::new(CacheEntry::new_resident(hash, data.to_vec(), now, expiration));
            self.allocate_memory(&entries, &entry, u64::from(size))?;
            entries.push(entry);
            debug!("Inserted entry {:08x} ({} bytes)", hash, size);
        }

        self.next_expiration
            .fetch_min(expiration.ticks(), Ordering::AcqRel);
        Ok(())
    }

    /// Copy of the payload stored under `key`; `NotFound` when absent
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.try_get(key)?
            .ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    /// Copy of the payload stored under `key`, or `None` when absent
    pub fn try_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_for_expired()?;

        let hash = key_hash(key);
        let entries = self.table.read();
        let Some(entry) = find_entry(&entries, hash) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let mut state = entry.lock();
        if state.persistence.is_ghost || state.is_expired_at(Timestamp::now()) {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        if !state.is_resident() {
            if !entry.is_on_disk() {
                warn!("Entry {:08x} is neither resident nor on disk", hash);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }

            let size = state.size;
            self.allocate_memory(&entries, entry, u64::from(size))?;
            let loaded = self.store.lock().read(entry, size);
            match loaded {
                Ok(data) => state.data = Some(data),
                Err(e) => {
                    self.release_memory(u64::from(size));
                    return Err(e);
                }
            }
            debug!("Loaded entry {:08x} from disk ({} bytes)", hash, size);
        }

        state.last_access = self.tick();
        state.access_count += 1;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(state.data.clone())
    }

    /// Write every dirty entry to disk, release all payloads and persist the index
    pub fn flush(&self) -> Result<()> {
        self.check_for_expired()?;
        self.write_back_all(true)?;
        info!("Flushed cache, {} disk bytes", self.disk_bytes());
        Ok(())
    }

    /// Write every dirty entry to disk and persist the index, keeping payloads resident
    pub fn save(&self) -> Result<()> {
        self.check_for_expired()?;
        self.write_back_all(false)?;
        debug!("Saved cache, {} disk bytes", self.disk_bytes());
        Ok(())
    }

    /// [`HybridCache::save`] on the blocking thread pool
    pub async fn save_async(self: &Arc<Self>) -> Result<()> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.save())
            .await
            .map_err(|e| CacheError::InternalError(format!("Save task failed: {}", e)))?
    }

    /// Drop every entry and truncate both files
    pub fn clear(&self) -> Result<()> {
        let mut entries = self.enter_write()?;

        for entry in entries.iter() {
            entry.lock().free();
        }
        let count = entries.len();
        entries.clear();

        {
            let mut store = self.store.lock();
            store.clear()?;
            store.truncate_to_len()?;
        }
        self.memory_bytes.store(0, Ordering::Release);
        self.next_expiration.store(i64::MAX, Ordering::Release);

        let _index = lock(&self.index_lock);
        index_file::write_index(&self.index_path, 0, &[])?;

        info!("Cleared cache ({} entries)", count);
        Ok(())
    }

    /// Remove expired entries when the earliest known expiration has passed.
    ///
    /// Returns immediately when another thread is already sweeping.
    pub fn check_for_expired(&self) -> Result<()> {
        let now = Timestamp::now();
        if now.ticks() < self.next_expiration.load(Ordering::Acquire) {
            return Ok(());
        }

        let _cleanup = match self.cleanup_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(()),
        };

        let mut entries = match self.enter_write() {
            Ok(entries) => entries,
            Err(CacheError::LockContention(reason)) => {
                debug!("Skipping expiration sweep: {}", reason);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.sweep(&mut entries, now)
    }

    pub fn max_memory_size(&self) -> u64 {
        self.max_memory_size.load(Ordering::Acquire)
    }

    /// New memory budget; enforced on the next allocation
    pub fn set_max_memory_size(&self, max: u64) {
        self.max_memory_size.store(max, Ordering::Release);
    }

    pub fn max_disk_size(&self) -> u64 {
        self.max_disk_size.load(Ordering::Acquire)
    }

    /// New disk budget; enforced on the next write-back that appends
    pub fn set_max_disk_size(&self, max: u64) {
        self.max_disk_size.store(max, Ordering::Release);
    }

    /// Replace the eviction policy
    pub fn set_policy(&self, policy: Arc<dyn CachePolicy>) {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    pub fn set_eviction_algorithm(&self, algorithm: EvictionAlgorithm) {
        info!("Switching eviction algorithm to {:?}", algorithm);
        self.set_policy(algorithm.build());
    }

    /// Bytes of payload currently held in memory
    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Acquire)
    }

    /// Bytes of payload currently held in the data file
    pub fn disk_bytes(&self) -> u64 {
        self.store.disk_bytes()
    }

    /// Number of live (non-ghost) entries
    pub fn len(&self) -> usize {
        let entries = self.table.read();
        entries
            .iter()
            .filter(|entry| !entry.lock().persistence.is_ghost)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let (entries_count, ghost_count, resident_count) = {
            let entries = self.table.read();
            let mut live = 0u64;
            let mut ghosts = 0u64;
            let mut resident = 0u64;
            for entry in entries.iter() {
                let state = entry.lock();
                if state.persistence.is_ghost {
                    ghosts += 1;
                } else {
                    live += 1;
                }
                if state.is_resident() {
                    resident += 1;
                }
            }
            (live, ghosts, resident)
        };

        let hit_count = self.counters.hits.load(Ordering::Relaxed);
        let miss_count = self.counters.misses.load(Ordering::Relaxed);
        let total_requests = hit_count + miss_count;
        let hit_rate = if total_requests > 0 {
            hit_count as f32 / total_requests as f32
        } else {
            0.0
        };

        CacheStats {
            entries_count,
            ghost_count,
            resident_count,
            memory_bytes: self.memory_bytes(),
            disk_bytes: self.disk_bytes(),
            max_memory_size: self.max_memory_size(),
            max_disk_size: self.max_disk_size(),
            hit_count,
            miss_count,
            hit_rate,
            memory_eviction_count: self.counters.memory_evictions.load(Ordering::Relaxed),
            disk_eviction_count: self.counters.disk_evictions.load(Ordering::Relaxed),
            expired_count: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    /// Recompute the byte counters and the data file layout from the entries
    /// and compare them with the tracked values. Only meaningful while no
    /// other thread is using the cache.
    pub fn validate_consistency(&self) -> Result<()> {
        let entries = self.table.write();

        let mut resident_bytes = 0u64;
        let mut ranges = Vec::new();
        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            let state = entry.lock();
            keys.push(entry.key());

            if let Some(data) = &state.data {
                if data.len() != state.size as usize {
                    return Err(CacheError::InternalError(format!(
                        "Entry {:08x} holds {} bytes but records size {}",
                        entry.key(),
                        data.len(),
                        state.size
                    )));
                }
                resident_bytes += u64::from(state.size);
            }

            if state.persistence.is_ghost {
                if state.is_resident() || entry.is_on_disk() {
                    return Err(CacheError::InternalError(format!(
                        "Ghost entry {:08x} still holds a payload or disk range",
                        entry.key()
                    )));
                }
                continue;
            }

            if entry.is_on_disk() {
                ranges.push((entry.position() as u64, u64::from(state.disk_len()), entry.key()));
            } else if !state.persistence.is_dirty {
                return Err(CacheError::InternalError(format!(
                    "Entry {:08x} has never been written but is not dirty",
                    entry.key()
                )));
            }
        }

        keys.sort_unstable();
        if let Some(pair) = keys.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(CacheError::InternalError(format!(
                "Duplicate entries for key {:08x}",
                pair[0]
            )));
        }

        let tracked_memory = self.memory_bytes();
        if resident_bytes != tracked_memory {
            return Err(CacheError::InternalError(format!(
                "Memory size mismatch: calculated {} vs tracked {}",
                resident_bytes, tracked_memory
            )));
        }

        let store = self.store.lock();
        ranges.sort_unstable();
        let mut cursor = 0u64;
        for (position, len, key) in ranges {
            if position != cursor {
                return Err(CacheError::InternalError(format!(
                    "Entry {:08x} starts at {} but the previous range ends at {}",
                    key, position, cursor
                )));
            }
            cursor += len;
        }
        if cursor != store.disk_bytes() {
            return Err(CacheError::InternalError(format!(
                "Disk size mismatch: calculated {} vs tracked {}",
                cursor,
                store.disk_bytes()
            )));
        }
        let file_len = store.file_len()?;
        if file_len < cursor {
            return Err(CacheError::InternalError(format!(
                "Data file holds {} bytes, fewer than the {} tracked",
                file_len, cursor
            )));
        }
        Ok(())
    }

    /// Flush and persist the index, then release the data file
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flush()?;
        info!("Closed cache at {:?}", self.data_path);
        Ok(())
    }

    fn enter_write(&self) -> Result<WriteSection<'_, Vec<EntryRef>>> {
        match self.write_gate_timeout {
            Some(timeout) => self.table.try_write_for(timeout).ok_or_else(|| {
                CacheError::LockContention(format!(
                    "Timed out after {:?} waiting for exclusive access",
                    timeout
                ))
            }),
            None => Ok(self.table.write()),
        }
    }

    /// Strictly increasing access clock so recency order is total
    fn tick(&self) -> Timestamp {
        let now = Timestamp::now().ticks();
        let previous = self
            .clock
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        Timestamp::from_ticks(now.max(previous.saturating_add(1)))
    }

    fn policy(&self) -> Arc<dyn CachePolicy> {
        Arc::clone(&self.policy.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn release_memory(&self, bytes: u64) {
        let _ = self
            .memory_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Account `len` new resident bytes, evicting other payloads when the
    /// memory budget is exceeded. The caller holds `protect`'s lock.
    fn allocate_memory(&self, entries: &[EntryRef], protect: &EntryRef, len: u64) -> Result<()> {
        let total = self.memory_bytes.fetch_add(len, Ordering::AcqRel) + len;
        let max = self.max_memory_size();
        if total <= max {
            return Ok(());
        }

        let _budget = lock(&self.memory_lock);
        if self.memory_bytes() <= max {
            return Ok(());
        }

        let disk_budget = DiskPressure { cache: self };
        let mut skipped = vec![false; entries.len()];
        while self.memory_bytes() > max {
            let Some((slot, mut state)) =
                self.pick_victim(entries, protect, EvictionTier::Memory, &mut skipped)
            else {
                debug!(
                    "Memory budget exceeded with no evictable entry: {} > {} bytes",
                    self.memory_bytes(),
                    max
                );
                break;
            };
            skipped[slot] = true;

            let victim = &entries[slot];
            if state.persistence.is_dirty {
                self.store
                    .lock()
                    .write_back(entries, victim, &mut state, &disk_budget)?;
            }
            if let Some(freed) = state.free() {
                self.release_memory(u64::from(freed));
                self.counters.memory_evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted entry {:08x} from memory ({} bytes)", victim.key(), freed);
            }
        }
        Ok(())
    }

    /// Choose and lock a victim for `tier`. Entries locked elsewhere are
    /// skipped; a candidate that cannot be re-locked after selection is
    /// marked in `skipped` and selection runs again.
    fn pick_victim<'e>(
        &self,
        entries: &'e [EntryRef],
        protect: &EntryRef,
        tier: EvictionTier,
        skipped: &mut [bool],
    ) -> Option<(usize, MutexGuard<'e, EntryState>)> {
        let policy = self.policy();
        loop {
            let candidates: Vec<EntryView> = entries
                .iter()
                .enumerate()
                .filter(|(slot, entry)| !skipped[*slot] && !Arc::ptr_eq(entry, protect))
                .filter_map(|(slot, entry)| {
                    let state = entry.try_lock()?;
                    Some(entry_view(slot, entry, &state))
                })
                .collect();

            let choice = policy.select_victim(tier, &candidates)?;
            let slot = candidates.get(choice)?.slot;
            let entry = &entries[slot];

            match entry.try_lock() {
                Some(state) if entry_view(slot, entry, &state).is_eligible(tier) => {
                    return Some((slot, state));
                }
                _ => skipped[slot] = true,
            }
        }
    }

    fn write_back_all(&self, release: bool) -> Result<()> {
        let entries = self.table.read();
        let disk_budget = DiskPressure { cache: self };

        for entry in entries.iter() {
            let mut state = entry.lock();
            if state.persistence.is_ghost {
                continue;
            }
            if state.persistence.is_dirty {
                self.store
                    .lock()
                    .write_back(&entries, entry, &mut state, &disk_budget)?;
            }
            if release {
                if let Some(freed) = state.free() {
                    self.release_memory(u64::from(freed));
                }
            }
        }

        self.persist_index(&entries)
    }

    fn persist_index(&self, entries: &[EntryRef]) -> Result<()> {
        let _index = lock(&self.index_lock);

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let state = entry.lock();
            if state.persistence.is_ghost || !entry.is_on_disk() {
                continue;
            }
            records.push(IndexRecord {
                key: entry.key(),
                size: state.disk_len(),
                position: entry.position(),
                last_access: state.last_access,
                expiration: state.expiration,
            });
        }

        let mut store = self.store.lock();
        index_file::write_index(&self.index_path, store.disk_bytes(), &records)?;
        store.truncate_to_len()
    }

    fn sweep(&self, entries: &mut Vec<EntryRef>, now: Timestamp) -> Result<()> {
        let mut next_expiration = i64::MAX;
        let mut expired = 0u64;
        let mut ghosts = 0u64;

        let mut slot = 0;
        while slot < entries.len() {
            let entry = Arc::clone(&entries[slot]);
            let mut state = entry.lock();

            let is_expired = state.is_expired_at(now);
            if !is_expired && !state.persistence.is_ghost {
                next_expiration = next_expiration.min(state.expiration.ticks());
                slot += 1;
                continue;
            }

            if is_expired {
                self.store.lock().remove(entries, &entry, &mut state)?;
                expired += 1;
            } else {
                ghosts += 1;
            }
            if let Some(freed) = state.free() {
                self.release_memory(u64::from(freed));
            }
            drop(state);
            entries.remove(slot);
        }

        self.next_expiration.store(next_expiration, Ordering::Release);
        self.counters.expired.fetch_add(expired, Ordering::Relaxed);
        if expired > 0 || ghosts > 0 {
            debug!(
                "Expiration sweep removed {} expired entries and {} ghosts",
                expired, ghosts
            );
        }
        Ok(())
    }
}

impl Drop for HybridCache {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Failed to persist cache at {:?} on drop: {}", self.data_path, e);
        }
    }
}

fn find_entry(entries: &[EntryRef], hash: u32) -> Option<&EntryRef> {
    entries.iter().find(|entry| entry.key() == hash)
}

fn entry_view(slot: usize, entry: &CacheEntry, state: &EntryState) -> EntryView {
    EntryView {
        slot,
        key: entry.key(),
        size: state.size,
        last_access: state.last_access,
        access_count: state.access_count,
        resident: state.is_resident(),
        on_disk: entry.position() != NOT_ON_DISK,
        is_ghost: state.persistence.is_ghost,
    }
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Check that a parsed index describes the data file we actually have
fn verify_snapshot(snapshot: &IndexSnapshot, file_len: u64) -> std::result::Result<(), String> {
    if file_len < snapshot.disk_bytes {
        return Err(format!(
            "index covers {} bytes but the data file holds {}",
            snapshot.disk_bytes, file_len
        ));
    }

    let mut ranges: Vec<(i64, u32, u32)> = snapshot
        .records
        .iter()
        .map(|record| (record.position, record.size, record.key))
        .collect();
    ranges.sort_unstable();

    let mut cursor = 0u64;
    for (position, size, key) in ranges {
        if position as u64 != cursor {
            return Err(format!(
                "entry {:08x} at {} leaves a gap or overlap at {}",
                key, position, cursor
            ));
        }
        cursor += u64::from(size);
    }
    if cursor != snapshot.disk_bytes {
        return Err(format!(
            "entries cover {} bytes but the header declares {}",
            cursor, snapshot.disk_bytes
        ));
    }

    let mut keys: Vec<u32> = snapshot.records.iter().map(|record| record.key).collect();
    keys.sort_unstable();
    if keys.windows(2).any(|pair| pair[0] == pair[1]) {
        return Err("duplicate keys".to_string());
    }
    Ok(())
}
