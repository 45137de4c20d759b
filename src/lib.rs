//! A distributed mutual-exclusion service: mutually exclusive,
//! time-bounded leases on named resources, coordinated through an
//! external object-storage backend rather than a dedicated lock server.
//!
//! The storage backend is a contract, not a dependency: plug in any
//! implementation of [`journal::JournalStore`] and
//! [`blob_gate::BlobLeaseBackend`] that honours the semantics in each
//! trait's documentation. [`memory`] ships an in-memory reference
//! implementation used by this crate's own tests.

pub mod acquire;
pub mod blob_gate;
pub mod bulkhead;
mod config;
mod core;
pub mod identity;
pub mod journal;
mod lease;
pub mod memory;
pub mod waiter;

mod error;

pub use config::Config;
pub use core::GlobalLock;
pub use error::{Error, Result, StorageError};
pub use lease::Lease;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBlobStore, MemoryJournal};
    use futures::stream::{FuturesUnordered, StreamExt};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, Once};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    static LOG_INIT: Once = Once::new();

    fn new_lock(tick_seconds: u64) -> Arc<GlobalLock> {
        LOG_INIT.call_once(env_logger::init);
        let config = Config {
            storage_connection_string: "memory".into(),
            lease_acquirement_interval_seconds: tick_seconds,
            ..Config::default()
        };
        GlobalLock::new(
            config,
            Arc::new(MemoryJournal::new()),
            Arc::new(MemoryBlobStore::new()),
        )
        .unwrap()
    }

    /// §8 S1 — solo acquirer.
    #[tokio::test]
    async fn solo_acquirer() {
        let lock = new_lock(5);
        let lease = lock
            .try_acquire("tenant-1", Some("E2E"), None, CancellationToken::new())
            .await
            .unwrap();
        assert!(lease.is_acquired());
    }

    /// §8 property 1 — mutual exclusion within a single process, and S2's
    /// contention shape scaled down for test speed.
    #[tokio::test]
    async fn mutual_exclusion_under_contention() {
        let lock = new_lock(1);
        let inside = Arc::new(AtomicI32::new(0));
        let max_inside = Arc::new(AtomicI32::new(0));
        let completions = Arc::new(AtomicUsize::new(0));

        let mut tasks = FuturesUnordered::new();
        for worker in 0..8 {
            let lock = lock.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            let completions = completions.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..3 {
                    let lease = lock
                        .try_acquire("contended", None, Some(Duration::from_secs(30)), CancellationToken::new())
                        .await
                        .unwrap();
                    let lease = if lease.is_acquired() {
                        lease
                    } else {
                        lease.wait(CancellationToken::new()).await.unwrap();
                        lease
                    };
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    lease.release(CancellationToken::new()).await.unwrap();
                    completions.fetch_add(1, Ordering::SeqCst);
                }
                let _ = worker;
            }));
        }
        while tasks.next().await.is_some() {}

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(completions.load(Ordering::SeqCst), 24);
    }

    /// §8 S3 — extend conserves the prior `expiresAt` plus the delta.
    #[tokio::test]
    async fn extend_advances_expiry_by_exactly_the_period() {
        let lock = new_lock(5);
        let lease = lock
            .try_acquire("extend-me", None, Some(Duration::from_secs(60)), CancellationToken::new())
            .await
            .unwrap();
        let lease_id = lease.lease_id().unwrap();

        let extended = lock
            .try_extend(&lease_id, Some(Duration::from_secs(60)), CancellationToken::new())
            .await
            .unwrap();
        assert!(extended);
    }

    /// §8 S4 — extending a released lease fails.
    #[tokio::test]
    async fn extend_after_release_fails() {
        let lock = new_lock(5);
        let lease = lock
            .try_acquire("release-then-extend", None, None, CancellationToken::new())
            .await
            .unwrap();
        let lease_id = lease.lease_id().unwrap();
        lease.release(CancellationToken::new()).await.unwrap();

        let extended = lock
            .try_extend(&lease_id, None, CancellationToken::new())
            .await
            .unwrap();
        assert!(!extended);
    }

    /// §8 property 3 — releasing an already-released lease is a no-op.
    #[tokio::test]
    async fn release_is_idempotent() {
        let lock = new_lock(5);
        let lease = lock
            .try_acquire("idempotent-release", None, None, CancellationToken::new())
            .await
            .unwrap();
        lease.release(CancellationToken::new()).await.unwrap();
        lease.release(CancellationToken::new()).await.unwrap();
    }

    /// §8 property 6 — an already-cancelled token fails before any
    /// backend call.
    #[tokio::test]
    async fn cancelled_preflight_makes_no_backend_calls() {
        let lock = new_lock(5);
        let ct = CancellationToken::new();
        ct.cancel();
        let result = lock.try_acquire("whatever", None, None, ct).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn empty_resource_is_invalid_argument() {
        let lock = new_lock(5);
        let result = lock
            .try_acquire("   ", None, None, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn zero_ttl_is_out_of_range() {
        let lock = new_lock(5);
        let result = lock
            .try_acquire("r", None, Some(Duration::ZERO), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::OutOfRange(_))));
    }

    /// §8 S6 — a contender queues then is promoted once the holder
    /// releases, without waiting for the next scheduled tick.
    #[tokio::test]
    async fn release_wakes_a_waiter_immediately() {
        let lock = new_lock(3600); // long interval: only the release-triggered poke should wake it
        let a = lock
            .try_acquire("wakeup", None, None, CancellationToken::new())
            .await
            .unwrap();
        let b = lock
            .try_acquire("wakeup", None, None, CancellationToken::new())
            .await
            .unwrap();
        assert!(!b.is_acquired());

        a.release(CancellationToken::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), b.wait(CancellationToken::new()))
            .await
            .expect("release should poke the ticker immediately")
            .unwrap();
        assert!(b.is_acquired());
    }

    /// §8 S5 — the blob lease expiring locally mid-insert cancels the
    /// acquisition and leaves no active record.
    #[tokio::test]
    async fn blob_lease_lost_mid_insert_cancels_acquisition() {
        let journal = Arc::new(SlowInsertJournal::new());
        let blob = Arc::new(MemoryBlobStore::new());
        let storage = Arc::new(acquire::Storage {
            journal: journal.clone(),
            blob,
        });
        let ct = CancellationToken::new();
        let shutdown = CancellationToken::new();

        let result = acquire::acquire_with_local_expiry(
            &storage,
            "slow",
            "default",
            Duration::from_secs(60),
            &ct,
            &shutdown,
            Duration::from_millis(20),
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(journal.row_count(), 0);
    }

    /// A journal whose insert takes longer than the gate's local expiry
    /// margin, to exercise S5 without waiting out the real 29s window.
    struct SlowInsertJournal {
        inner: MemoryJournal,
    }

    impl SlowInsertJournal {
        fn new() -> Self {
            SlowInsertJournal {
                inner: MemoryJournal::new(),
            }
        }

        fn row_count(&self) -> usize {
            self.inner.row_count()
        }
    }

    #[async_trait::async_trait]
    impl journal::JournalStore for SlowInsertJournal {
        async fn query_active(
            &self,
            resource: &str,
            partition_key: &str,
            now: chrono::DateTime<chrono::Utc>,
            limit: usize,
        ) -> Result<Vec<journal::JournalRecord>> {
            self.inner.query_active(resource, partition_key, now, limit).await
        }

        async fn insert(&self, record: journal::JournalRecord) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.inner.insert(record).await
        }

        async fn get(&self, record_id: &identity::RecordId) -> Result<Option<journal::JournalRecord>> {
            self.inner.get(record_id).await
        }

        async fn merge(
            &self,
            record_id: &identity::RecordId,
            expected: &journal::ETag,
            updated: journal::JournalRecord,
        ) -> Result<journal::MergeOutcome> {
            self.inner.merge(record_id, expected, updated).await
        }
    }

    /// §8 property 7 — a single ETag conflict is retried exactly once
    /// and then succeeds.
    #[tokio::test]
    async fn prolong_retries_once_after_a_single_etag_conflict() {
        let store = ConflictOnceJournal::new();
        let record = journal::insert_record(&store, "r", "s", Duration::from_secs(60))
            .await
            .unwrap();

        let extended = journal::prolong(
            &store,
            &record.record_id(),
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(extended);
        assert_eq!(store.conflicts_seen(), 1);
    }

    #[tokio::test]
    async fn end_retries_once_after_a_single_etag_conflict() {
        let store = ConflictOnceJournal::new();
        let record = journal::insert_record(&store, "r", "s", Duration::from_secs(60))
            .await
            .unwrap();

        journal::end(&store, &record.record_id(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.conflicts_seen(), 1);
        assert!(journal::is_resource_available(&store, "r", "s").await.unwrap());
    }

    /// A journal whose `merge` reports exactly one stale-ETag conflict
    /// per record before delegating normally, to exercise the
    /// bounded-retry path (§8 property 7) without relying on a real race.
    #[derive(Default)]
    struct ConflictOnceJournal {
        inner: MemoryJournal,
        conflicted_once: Mutex<HashSet<String>>,
    }

    impl ConflictOnceJournal {
        fn new() -> Self {
            ConflictOnceJournal::default()
        }

        fn conflicts_seen(&self) -> usize {
            self.conflicted_once.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl journal::JournalStore for ConflictOnceJournal {
        async fn query_active(
            &self,
            resource: &str,
            partition_key: &str,
            now: chrono::DateTime<chrono::Utc>,
            limit: usize,
        ) -> Result<Vec<journal::JournalRecord>> {
            self.inner.query_active(resource, partition_key, now, limit).await
        }

        async fn insert(&self, record: journal::JournalRecord) -> Result<()> {
            self.inner.insert(record).await
        }

        async fn get(&self, record_id: &identity::RecordId) -> Result<Option<journal::JournalRecord>> {
            self.inner.get(record_id).await
        }

        async fn merge(
            &self,
            record_id: &identity::RecordId,
            expected: &journal::ETag,
            updated: journal::JournalRecord,
        ) -> Result<journal::MergeOutcome> {
            if self.conflicted_once.lock().unwrap().insert(record_id.row_key.clone()) {
                return Ok(journal::MergeOutcome::Conflict);
            }
            self.inner.merge(record_id, expected, updated).await
        }
    }
}
