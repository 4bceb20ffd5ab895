//! Concurrency tests
//!
//! Writers on disjoint keys race readers of a shared key under a memory
//! budget small enough to force constant eviction and write-back.

use hybrid_cache::{CacheConfig, HybridCache};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

const WRITERS: usize = 8;
const READERS: usize = 8;
const ROUNDS: usize = 60;

fn shared_value(version: u8) -> Vec<u8> {
    vec![version; 100 + version as usize * 7]
}

fn writer_value(thread: usize, round: usize) -> Vec<u8> {
    let len = 16 + (thread * 13 + round * 5) % 96;
    (0..len).map(|i| (thread * 31 + round + i) as u8).collect()
}

#[test]
fn test_concurrent_writers_and_readers_never_tear() {
    let temp_dir = TempDir::new().unwrap();
    let config = CacheConfig {
        cache_dir: temp_dir.path().to_path_buf(),
        max_memory_size: 2048,
        max_disk_size: 16 * 1024 * 1024,
        max_concurrent_readers: 4,
        ..CacheConfig::default()
    };
    let cache = Arc::new(HybridCache::with_config(&config).unwrap());
    cache.set("shared", &shared_value(0)).unwrap();

    let barrier = Arc::new(Barrier::new(WRITERS + READERS));
    let writers_done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..WRITERS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for round in 0..ROUNDS {
                    cache
                        .set(&format!("w{}-{}", t, round % 10), &writer_value(t, round))
                        .unwrap();
                    if round % 10 == t {
                        cache
                            .set("shared", &shared_value((round % 4) as u8))
                            .unwrap();
                    }
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let writers_done = Arc::clone(&writers_done);
            thread::spawn(move || {
                barrier.wait();
                let mut reads = 0usize;
                while !writers_done.load(Ordering::Acquire) || reads < ROUNDS {
                    let value = cache.get("shared").unwrap();
                    let known = (0..4u8).any(|v| value == shared_value(v));
                    assert!(known, "torn read of {} bytes", value.len());
                    reads += 1;
                }
            })
        })
        .collect();

    for handle in writers {
        handle.join().unwrap();
    }
    writers_done.store(true, Ordering::Release);
    for handle in readers {
        handle.join().unwrap();
    }

    // Last value written by each thread to each of its keys
    for t in 0..WRITERS {
        for slot in 0..10 {
            let last_round = (0..ROUNDS).filter(|r| r % 10 == slot).max().unwrap();
            assert_eq!(
                cache.get(&format!("w{}-{}", t, slot)).unwrap(),
                writer_value(t, last_round)
            );
        }
    }
    assert_eq!(cache.len(), WRITERS * 10 + 1);
    cache.validate_consistency().unwrap();
}

#[test]
fn test_concurrent_flush_and_get() {
    let temp_dir = TempDir::new().unwrap();
    let config = CacheConfig {
        cache_dir: temp_dir.path().to_path_buf(),
        max_memory_size: 512,
        ..CacheConfig::default()
    };
    let cache = Arc::new(HybridCache::with_config(&config).unwrap());
    for i in 0..32u8 {
        cache.set(&format!("k{}", i), &[i; 64]).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for round in 0..50u8 {
                    if t == 0 && round % 10 == 0 {
                        cache.flush().unwrap();
                    } else {
                        let i = (round + t as u8 * 7) % 32;
                        assert_eq!(cache.get(&format!("k{}", i)).unwrap(), vec![i; 64]);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    cache.validate_consistency().unwrap();
}
