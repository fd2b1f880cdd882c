//! Shared state under concurrent access.

use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strata_core::ParsedModule;
use strata_engine::cache::ContentHashCache;
use strata_engine::memory::MemoryBudget;
use strata_engine::progress::{ProgressEvent, ProgressTracker};
use tempfile::TempDir;

#[test]
fn test_progress_updates_from_five_workers() {
    let tracker = ProgressTracker::new(100);

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for _ in 0..20 {
                    tracker.update(1, 0, None);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.completed, 100);
    assert_eq!(snapshot.percentage, 100.0);
}

#[test]
fn test_listener_sees_final_snapshot() -> Result<()> {
    let tracker = ProgressTracker::new(40);
    let last = Arc::new(parking_lot::Mutex::new(None));

    let seen = Arc::clone(&last);
    let listener = tracker.spawn_listener(
        Arc::new(move |event: &ProgressEvent| {
            if let ProgressEvent::Progress(snapshot) = event {
                *seen.lock() = Some(snapshot.completed);
            }
        }),
        1024,
    )?;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for _ in 0..10 {
                    tracker.update(1, 0, None);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    listener.finish();

    assert_eq!(*last.lock(), Some(40));
    assert_eq!(tracker.subscriber_count(), 0);
    Ok(())
}

#[test]
fn test_concurrent_store_result() -> Result<()> {
    let temp = TempDir::new()?;
    let cache = Arc::new(ContentHashCache::open(&temp.path().join("cache"), "d", 64)?);

    let paths: Vec<PathBuf> = (0..32)
        .map(|i| {
            let path = temp.path().join(format!("file_{}.py", i));
            fs::write(&path, format!("value_{} = {}\n", i, i))?;
            Ok(path)
        })
        .collect::<Result<_>>()?;

    let handles: Vec<_> = paths
        .chunks(8)
        .map(|batch| {
            let cache = Arc::clone(&cache);
            let batch = batch.to_vec();
            thread::spawn(move || {
                for path in batch {
                    let module = ParsedModule::new(&path);
                    cache
                        .store_result(&path, &module, &[], Duration::from_micros(10))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    cache.flush()?;
    assert_eq!(cache.len(), paths.len());

    let reopened = ContentHashCache::open(&temp.path().join("cache"), "d", 64)?;
    let (changed, cached) = reopened.get_changed_files(&paths);
    assert!(changed.is_empty());
    assert_eq!(cached.len(), paths.len());
    Ok(())
}

#[test]
fn test_budget_reservations_across_threads() {
    let budget = MemoryBudget::new(64.0);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let budget = Arc::clone(&budget);
            thread::spawn(move || {
                for _ in 0..200 {
                    if let Some(reservation) = budget.try_reserve(16.0) {
                        assert!(budget.allocated_mb() <= 64.0);
                        drop(reservation);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(budget.allocated_mb(), 0.0);
    assert!(budget.peak_mb() <= 64.0);
}
