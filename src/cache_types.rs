//! Cache Types Module
//!
//! Provides the entry record shared by the memory and disk tiers, the
//! timestamp representation persisted in the index, and key hashing.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, SystemTime};

const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: i64 = 100;

/// Position value of an entry that has never been written to the data file
pub const NOT_ON_DISK: i64 = -1;

/// Point in time stored as 100 ns ticks since the Unix epoch (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Sentinel for entries that never expire
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    pub const fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    pub const fn ticks(self) -> i64 {
        self.0
    }

    /// True for [`Timestamp::MAX`]
    pub fn is_never(self) -> bool {
        self == Self::MAX
    }

    /// Add a duration, clamping at [`Timestamp::MAX`]
    pub fn saturating_add(self, duration: Duration) -> Self {
        if self.is_never() {
            return self;
        }
        Self(self.0.saturating_add(duration_ticks(duration)))
    }

    /// Subtract a duration, clamping at `i64::MIN` ticks
    pub fn saturating_sub(self, duration: Duration) -> Self {
        if self.is_never() {
            return self;
        }
        Self(self.0.saturating_sub(duration_ticks(duration)))
    }

    /// Convert back to a calendar time. `None` when out of chrono's range.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = self.0.div_euclid(TICKS_PER_SECOND);
        let nanos = (self.0.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK) as u32;
        DateTime::from_timestamp(secs, nanos)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(time: DateTime<Utc>) -> Self {
        let ticks = time
            .timestamp()
            .saturating_mul(TICKS_PER_SECOND)
            .saturating_add(i64::from(time.timestamp_subsec_nanos()) / NANOS_PER_TICK);
        Self(ticks)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        Self::from(DateTime::<Utc>::from(time))
    }
}

fn duration_ticks(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos() / NANOS_PER_TICK as u128).unwrap_or(i64::MAX)
}

/// Hash a caller-supplied key into the 32-bit entry key.
///
/// Only the CRC-32 is stored, so two distinct strings with the same checksum
/// address the same entry.
pub fn key_hash(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Write-back bookkeeping for one entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceState {
    /// In-memory payload differs from the bytes on disk
    pub is_dirty: bool,
    /// Evicted from the disk tier; slot kept for reuse, invisible to lookups
    pub is_ghost: bool,
    /// Size still occupied on disk while a newer size is pending
    pub old_size: u32,
}

/// Mutable part of an entry, guarded by the entry lock
#[derive(Debug)]
pub struct EntryState {
    pub size: u32,
    pub data: Option<Vec<u8>>,
    pub last_access: Timestamp,
    pub expiration: Timestamp,
    pub access_count: u64,
    pub persistence: PersistenceState,
}

impl EntryState {
    pub fn is_resident(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expiration
    }

    /// Bytes this entry occupies in the data file. Only meaningful when the
    /// entry has a disk position.
    pub fn disk_len(&self) -> u32 {
        if self.persistence.is_dirty {
            self.persistence.old_size
        } else {
            self.size
        }
    }

    /// Drop the resident payload, returning how many bytes were released
    pub fn free(&mut self) -> Option<u32> {
        self.data.take().map(|_| self.size)
    }
}

/// One cached blob: key, disk position and the locked state
#[derive(Debug)]
pub struct CacheEntry {
    key: u32,
    // Only mutated while holding the data store lock.
    position: AtomicI64,
    state: Mutex<EntryState>,
}

/// Stable handle to an entry in the table
pub type EntryRef = Arc<CacheEntry>;

impl CacheEntry {
    /// Entry created by `set`: resident, dirty, never written
    pub fn new_resident(key: u32, data: Vec<u8>, now: Timestamp, expiration: Timestamp) -> Self {
        Self {
            key,
            position: AtomicI64::new(NOT_ON_DISK),
            state: Mutex::new(EntryState {
                size: data.len() as u32,
                data: Some(data),
                last_access: now,
                expiration,
                access_count: 1,
                persistence: PersistenceState {
                    is_dirty: true,
                    is_ghost: false,
                    old_size: 0,
                },
            }),
        }
    }

    /// Entry restored from the index: on disk, not resident, clean
    pub fn from_disk(
        key: u32,
        size: u32,
        position: i64,
        last_access: Timestamp,
        expiration: Timestamp,
    ) -> Self {
        Self {
            key,
            position: AtomicI64::new(position),
            state: Mutex::new(EntryState {
                size,
                data: None,
                last_access,
                expiration,
                access_count: 0,
                persistence: PersistenceState::default(),
            }),
        }
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn position(&self) -> i64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn is_on_disk(&self) -> bool {
        self.position() != NOT_ON_DISK
    }

    pub(crate) fn set_position(&self, position: i64) {
        self.position.store(position, Ordering::Release);
    }

    /// Acquire the entry lock, blocking
    pub fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the entry lock only if nobody else holds it
    pub fn try_lock(&self) -> Option<MutexGuard<'_, EntryState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trips_through_datetime() {
        let now = Utc::now();
        let ts = Timestamp::from(now);
        let back = ts.to_datetime().unwrap();
        // Sub-tick precision is dropped
        assert!((now - back).num_nanoseconds().unwrap().abs() < 100);
    }

    #[test]
    fn test_timestamp_max_is_sticky() {
        assert_eq!(
            Timestamp::MAX.saturating_add(Duration::from_secs(10)),
            Timestamp::MAX
        );
        assert_eq!(
            Timestamp::MAX.saturating_sub(Duration::from_secs(10)),
            Timestamp::MAX
        );
        assert!(Timestamp::MAX.is_never());
    }

    #[test]
    fn test_timestamp_arithmetic_in_ticks() {
        let ts = Timestamp::from_ticks(0);
        assert_eq!(ts.saturating_add(Duration::from_secs(1)).ticks(), TICKS_PER_SECOND);
        assert_eq!(ts.saturating_sub(Duration::from_millis(1)).ticks(), -10_000);
        assert!(Timestamp::now() > Timestamp::now().saturating_sub(Duration::from_secs(1)));
    }

    #[test]
    fn test_key_hash_is_crc32() {
        assert_eq!(key_hash(""), 0);
        assert_eq!(key_hash("123456789"), 0xCBF4_3926);
        assert_ne!(key_hash("a"), key_hash("b"));
    }

    #[test]
    fn test_disk_len_tracks_old_size_while_dirty() {
        let entry = CacheEntry::from_disk(1, 10, 0, Timestamp::now(), Timestamp::MAX);
        let mut state = entry.lock();
        assert_eq!(state.disk_len(), 10);

        state.persistence.old_size = state.size;
        state.persistence.is_dirty = true;
        state.size = 25;
        assert_eq!(state.disk_len(), 10);
    }

    #[test]
    fn test_try_lock_reports_held_entry() {
        let entry = CacheEntry::new_resident(7, vec![1, 2, 3], Timestamp::now(), Timestamp::MAX);
        let guard = entry.lock();
        assert!(entry.try_lock().is_none());
        drop(guard);

        let mut state = entry.try_lock().unwrap();
        assert_eq!(state.free(), Some(3));
        assert_eq!(state.free(), None);
        assert!(!entry.is_on_disk());
    }
}
