//! Cache Policy Module
//!
//! Pluggable victim selection for the memory and disk tiers. The engine
//! snapshots every lockable entry into an [`EntryView`] and asks the active
//! policy which one to give up.

use crate::cache_types::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

/// Which budget an eviction is trying to satisfy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionTier {
    Memory,
    Disk,
}

/// Snapshot of an eviction candidate
#[derive(Debug, Clone, PartialEq)]
pub struct EntryView {
    /// Slot of the entry in the engine's table
    pub slot: usize,
    pub key: u32,
    pub size: u32,
    pub last_access: Timestamp,
    pub access_count: u64,
    /// Payload is held in memory
    pub resident: bool,
    /// Entry has a position in the data file
    pub on_disk: bool,
    pub is_ghost: bool,
}

impl EntryView {
    /// Whether evicting this entry from `tier` frees anything
    pub fn is_eligible(&self, tier: EvictionTier) -> bool {
        match tier {
            EvictionTier::Memory => self.resident,
            EvictionTier::Disk => !self.is_ghost && self.on_disk,
        }
    }
}

/// Eviction strategy.
///
/// Candidates never include the entry being allocated for, nor entries
/// currently locked by another thread.
pub trait CachePolicy: Send + Sync + Debug {
    /// Pick the index (into `candidates`) of the entry to evict from `tier`
    fn select_victim(&self, tier: EvictionTier, candidates: &[EntryView]) -> Option<usize>;
}

/// Least recently used
#[derive(Debug, Default, Clone, Copy)]
pub struct LruCachePolicy;

impl CachePolicy for LruCachePolicy {
    fn select_victim(&self, tier: EvictionTier, candidates: &[EntryView]) -> Option<usize> {
        let mut victim: Option<(usize, Timestamp)> = None;
        for (i, view) in candidates.iter().enumerate() {
            if !view.is_eligible(tier) {
                continue;
            }
            match victim {
                Some((_, oldest)) if view.last_access >= oldest => {}
                _ => victim = Some((i, view.last_access)),
            }
        }
        victim.map(|(i, _)| i)
    }
}

/// Least frequently used, falling back to recency on equal counts
#[derive(Debug, Default, Clone, Copy)]
pub struct LfuCachePolicy;

impl CachePolicy for LfuCachePolicy {
    fn select_victim(&self, tier: EvictionTier, candidates: &[EntryView]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, view)| view.is_eligible(tier))
            .min_by_key(|(i, view)| (view.access_count, view.last_access, *i))
            .map(|(i, _)| i)
    }
}

/// Cache eviction algorithms selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EvictionAlgorithm {
    #[default]
    #[serde(rename = "lru")]
    Lru,
    #[serde(rename = "lfu")]
    Lfu,
}

impl EvictionAlgorithm {
    pub fn build(self) -> Arc<dyn CachePolicy> {
        match self {
            EvictionAlgorithm::Lru => Arc::new(LruCachePolicy),
            EvictionAlgorithm::Lfu => Arc::new(LfuCachePolicy),
        }
    }

    /// Parse the lowercase configuration name
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "lru" => Some(EvictionAlgorithm::Lru),
            "lfu" => Some(EvictionAlgorithm::Lfu),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(slot: usize, last_access: i64, resident: bool, on_disk: bool) -> EntryView {
        EntryView {
            slot,
            key: slot as u32,
            size: 10,
            last_access: Timestamp::from_ticks(last_access),
            access_count: 1,
            resident,
            on_disk,
            is_ghost: false,
        }
    }

    #[test]
    fn test_lru_picks_oldest_resident_for_memory() {
        let candidates = vec![
            view(0, 30, true, false),
            view(1, 10, false, true), // oldest but not resident
            view(2, 20, true, true),
        ];
        assert_eq!(
            LruCachePolicy.select_victim(EvictionTier::Memory, &candidates),
            Some(2)
        );
    }

    #[test]
    fn test_lru_disk_skips_unwritten_and_ghosts() {
        let mut ghost = view(0, 1, false, true);
        ghost.is_ghost = true;
        let candidates = vec![
            ghost,
            view(1, 2, true, false), // never flushed
            view(2, 50, false, true),
            view(3, 40, true, true),
        ];
        assert_eq!(
            LruCachePolicy.select_victim(EvictionTier::Disk, &candidates),
            Some(3)
        );
    }

    #[test]
    fn test_lru_first_wins_ties() {
        let candidates = vec![view(0, 5, true, false), view(1, 5, true, false)];
        assert_eq!(
            LruCachePolicy.select_victim(EvictionTier::Memory, &candidates),
            Some(0)
        );
    }

    #[test]
    fn test_no_eligible_candidate() {
        let candidates = vec![view(0, 5, false, false)];
        assert_eq!(
            LruCachePolicy.select_victim(EvictionTier::Memory, &candidates),
            None
        );
        assert_eq!(
            LfuCachePolicy.select_victim(EvictionTier::Disk, &candidates),
            None
        );
        assert_eq!(LruCachePolicy.select_victim(EvictionTier::Memory, &[]), None);
    }

    #[test]
    fn test_lfu_prefers_rarely_used_then_oldest() {
        let mut hot = view(0, 1, true, true);
        hot.access_count = 9;
        let mut cold_new = view(1, 50, true, true);
        cold_new.access_count = 2;
        let mut cold_old = view(2, 40, true, true);
        cold_old.access_count = 2;

        let candidates = vec![hot, cold_new, cold_old];
        assert_eq!(
            LfuCachePolicy.select_victim(EvictionTier::Memory, &candidates),
            Some(2)
        );
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(EvictionAlgorithm::parse("LRU"), Some(EvictionAlgorithm::Lru));
        assert_eq!(EvictionAlgorithm::parse(" lfu "), Some(EvictionAlgorithm::Lfu));
        assert_eq!(EvictionAlgorithm::parse("tinylfu"), None);
        assert_eq!(EvictionAlgorithm::default(), EvictionAlgorithm::Lru);
    }
}
