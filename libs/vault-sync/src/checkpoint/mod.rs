//! Processing checkpoint: the highest block height whose events have been
//! fully applied.

mod store;

pub use store::{CheckpointError, CheckpointStore, ProcessingCheckpoint, DEFAULT_CHECKPOINT_PATH};

use parking_lot::Mutex;

/// Cold-start floor: `max(deployment_block, head - lookback)`.
///
/// Bounds the first catch-up so a fresh process never scans full history.
pub fn cold_start_floor(deployment_block: u64, head: u64, lookback: u64) -> u64 {
    deployment_block.max(head.saturating_sub(lookback))
}

/// Monotonic checkpoint, optionally persisted on every advance.
#[derive(Debug)]
pub struct CheckpointTracker {
    last_processed_block: Mutex<u64>,
    store: Option<CheckpointStore>,
}

impl CheckpointTracker {
    /// In-memory tracker starting at `initial`.
    pub fn new(initial: u64) -> Self {
        Self {
            last_processed_block: Mutex::new(initial),
            store: None,
        }
    }

    /// Tracker backed by a checkpoint file. A missing or unreadable file
    /// starts the tracker at 0.
    pub fn with_store(store: CheckpointStore) -> Self {
        let initial = match store.load() {
            Ok(Some(checkpoint)) => {
                tracing::info!(
                    block = checkpoint.last_processed_block,
                    path = %store.path().display(),
                    "Loaded processing checkpoint"
                );
                checkpoint.last_processed_block
            }
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load checkpoint, starting from scratch");
                0
            }
        };

        Self {
            last_processed_block: Mutex::new(initial),
            store: Some(store),
        }
    }

    pub fn current(&self) -> u64 {
        *self.last_processed_block.lock()
    }

    /// Move the checkpoint forward to `block`. Returns `false` (and changes
    /// nothing) when `block` is behind the current value.
    ///
    /// The file is written while the lock is held, so the persisted value
    /// never goes backwards under concurrent advances.
    pub fn advance_to(&self, block: u64) -> bool {
        let mut current = self.last_processed_block.lock();
        if block < *current {
            tracing::debug!(current = *current, requested = block, "Ignoring checkpoint rollback");
            return false;
        }
        if block != *current {
            *current = block;
            self.persist(block);
        }
        true
    }

    /// Apply the cold-start floor. Only takes effect while nothing has been
    /// processed yet. The stored value is one below the floor so the floor
    /// block itself is replayed.
    pub fn seed_floor(&self, floor: u64) -> bool {
        let mut current = self.last_processed_block.lock();
        if *current != 0 {
            return false;
        }
        *current = floor.saturating_sub(1);

        tracing::info!(floor, checkpoint = *current, "Seeded cold-start checkpoint");
        if *current != 0 {
            self.persist(*current);
        }
        true
    }

    fn persist(&self, block: u64) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&ProcessingCheckpoint::new(block)) {
                tracing::warn!(block, error = %e, "Failed to persist checkpoint");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let tracker = CheckpointTracker::new(100);

        assert!(tracker.advance_to(150));
        assert!(!tracker.advance_to(120));
        assert_eq!(tracker.current(), 150);
        assert!(tracker.advance_to(150));
        assert_eq!(tracker.current(), 150);
    }

    #[test]
    fn test_monotonic_under_any_order() {
        let tracker = CheckpointTracker::new(0);
        let mut high = 0;
        for block in [5u64, 3, 9, 9, 1, 20, 19, 0, 21] {
            tracker.advance_to(block);
            high = high.max(block);
            assert_eq!(tracker.current(), high);
        }
    }

    #[test]
    fn test_concurrent_advances_keep_maximum() {
        let tracker = std::sync::Arc::new(CheckpointTracker::new(0));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        tracker.advance_to((i * 8 + t) % 500);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.current(), 499);
    }

    #[test]
    fn test_concurrent_advances_persist_maximum() {
        let path = std::env::temp_dir().join(format!(
            "vault_tracker_concurrent_{}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let tracker = std::sync::Arc::new(CheckpointTracker::with_store(CheckpointStore::new(&path)));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        tracker.advance_to(i * 4 + t + 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.current(), 200);
        let reloaded = CheckpointTracker::with_store(CheckpointStore::new(&path));
        assert_eq!(reloaded.current(), 200);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_seed_floor_only_when_empty() {
        let tracker = CheckpointTracker::new(0);
        assert!(tracker.seed_floor(1_000));
        assert_eq!(tracker.current(), 999);

        assert!(!tracker.seed_floor(5_000));
        assert_eq!(tracker.current(), 999);
    }

    #[test]
    fn test_cold_start_floor() {
        assert_eq!(cold_start_floor(100, 50_000, 10_000), 40_000);
        assert_eq!(cold_start_floor(45_000, 50_000, 10_000), 45_000);
        assert_eq!(cold_start_floor(0, 500, 10_000), 0);
    }

    #[test]
    fn test_tracker_persists_and_reloads() {
        let path = std::env::temp_dir().join(format!(
            "vault_tracker_test_{}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let tracker = CheckpointTracker::with_store(CheckpointStore::new(&path));
        assert_eq!(tracker.current(), 0);
        tracker.advance_to(777);

        let reloaded = CheckpointTracker::with_store(CheckpointStore::new(&path));
        assert_eq!(reloaded.current(), 777);
        assert!(!reloaded.seed_floor(10));

        let _ = std::fs::remove_file(&path);
    }
}
