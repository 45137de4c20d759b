//! In-memory reference implementation of the storage collaborator
//! contract (§2 of SPEC_FULL.md). Used by this crate's own tests; a real
//! deployment supplies its own [`JournalStore`] + [`BlobLeaseBackend`]
//! backed by an actual table/blob service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::blob_gate::BlobLeaseBackend;
use crate::error::Result;
use crate::identity::RecordId;
use crate::journal::{ETag, JournalRecord, JournalStore, MergeOutcome};

type RowKey = (String, String);

#[derive(Default)]
pub struct MemoryJournal {
    rows: Mutex<HashMap<RowKey, JournalRecord>>,
    etag_seq: AtomicU64,
}

impl MemoryJournal {
    pub fn new() -> Self {
        MemoryJournal::default()
    }

    fn fresh_etag(&self) -> ETag {
        ETag(self.etag_seq.fetch_add(1, Ordering::SeqCst).to_string())
    }

    #[cfg(test)]
    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    #[cfg(test)]
    pub fn completed_count(&self) -> usize {
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.completed_at != crate::journal::sentinel_epoch())
            .count()
    }
}

#[async_trait]
impl JournalStore for MemoryJournal {
    async fn query_active(
        &self,
        resource: &str,
        partition_key: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JournalRecord>> {
        let rows = self.rows.lock().expect("memory journal poisoned");
        Ok(rows
            .values()
            .filter(|r| r.resource == resource && r.partition_key == partition_key && r.is_active(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert(&self, mut record: JournalRecord) -> Result<()> {
        record.etag = self.fresh_etag();
        let mut rows = self.rows.lock().expect("memory journal poisoned");
        rows.insert((record.partition_key.clone(), record.row_key.clone()), record);
        Ok(())
    }

    async fn get(&self, record_id: &RecordId) -> Result<Option<JournalRecord>> {
        let rows = self.rows.lock().expect("memory journal poisoned");
        Ok(rows
            .get(&(record_id.partition_key.clone(), record_id.row_key.clone()))
            .cloned())
    }

    async fn merge(
        &self,
        record_id: &RecordId,
        expected: &ETag,
        mut updated: JournalRecord,
    ) -> Result<MergeOutcome> {
        let mut rows = self.rows.lock().expect("memory journal poisoned");
        let key = (record_id.partition_key.clone(), record_id.row_key.clone());
        match rows.get(&key) {
            Some(current) if &current.etag == expected => {
                let etag = ETag(self.etag_seq.fetch_add(1, Ordering::SeqCst).to_string());
                updated.etag = etag.clone();
                rows.insert(key, updated);
                Ok(MergeOutcome::Applied(etag))
            }
            _ => Ok(MergeOutcome::Conflict),
        }
    }
}

/// In-memory blob-lease store: a blob name can carry at most one
/// outstanding native lease id at a time.
#[derive(Default)]
pub struct MemoryBlobStore {
    leases: Mutex<HashMap<String, String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        MemoryBlobStore::default()
    }
}

#[async_trait]
impl BlobLeaseBackend for MemoryBlobStore {
    async fn ensure_container(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_blob(&self, _blob_name: &str) -> Result<()> {
        Ok(())
    }

    async fn acquire_lease(&self, blob_name: &str, _seconds: u64) -> Result<Option<String>> {
        let mut leases = self.leases.lock().expect("memory blob store poisoned");
        if leases.contains_key(blob_name) {
            return Ok(None);
        }
        let native_id = uuid::Uuid::new_v4().to_string();
        leases.insert(blob_name.to_string(), native_id.clone());
        Ok(Some(native_id))
    }

    async fn release_lease(&self, blob_name: &str, native_lease_id: &str) -> Result<bool> {
        let mut leases = self.leases.lock().expect("memory blob store poisoned");
        if leases.get(blob_name).map(String::as_str) == Some(native_lease_id) {
            leases.remove(blob_name);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
