//! Component C: the journal repository. Reads and writes the
//! operation-log table: existence checks, inserts, and ETag-conditional
//! merges, with bounded retry on version-tag conflict.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_retry::strategy::FixedInterval;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::{self, RecordId};

/// `completedAt` while a record is still active (§3).
pub fn sentinel_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0).unwrap()
}

/// An opaque, backend-supplied optimistic-concurrency token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ETag(pub String);

/// One row of the journal table (§3).
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub partition_key: String,
    pub row_key: String,
    pub resource: String,
    pub scope: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub etag: ETag,
}

impl JournalRecord {
    pub fn record_id(&self) -> RecordId {
        RecordId::new(self.row_key.clone(), self.partition_key.clone())
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.completed_at == sentinel_epoch() && self.expires_at > now
    }
}

/// Result of a conditional merge attempt.
pub enum MergeOutcome {
    Applied(ETag),
    /// HTTP 412-equivalent: the observed ETag was stale.
    Conflict,
}

/// The storage collaborator's table-side contract (§6). Implementations
/// back this with whatever table/document service exposes conditional
/// insert and ETag-conditional merge; see [`crate::memory`] for the
/// in-memory reference implementation used by this crate's own tests.
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Rows matching `resource` and `partition_key` that are still
    /// active as of `now`, capped at `limit` (the caller uses `limit=2`
    /// to detect the "two active rows" anomaly without scanning the
    /// whole partition).
    async fn query_active(
        &self,
        resource: &str,
        partition_key: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JournalRecord>>;

    /// Conditional insert: fails only on a fatal backend error. The
    /// caller is responsible for re-checking availability first; this
    /// method does not itself enforce single-active-record.
    async fn insert(&self, record: JournalRecord) -> Result<()>;

    async fn get(&self, record_id: &RecordId) -> Result<Option<JournalRecord>>;

    /// Replace the row at `record_id` with `updated`, conditioned on the
    /// row's current ETag equalling `expected`.
    async fn merge(
        &self,
        record_id: &RecordId,
        expected: &ETag,
        updated: JournalRecord,
    ) -> Result<MergeOutcome>;
}

const MAX_MERGE_RETRIES: usize = 8;

/// `IsResourceAvailable` (§4.C). A page of up to two active rows is
/// fetched; zero rows means available. Two rows is treated as a data
/// anomaly and conservatively reported as *unavailable*, matching the
/// reference's `Take(2)` + `SingleOrDefault` behaviour (§9).
pub async fn is_resource_available(
    store: &dyn JournalStore,
    resource: &str,
    scope: &str,
) -> Result<bool> {
    let partition_key = identity::partition_key(scope);
    let rows = store
        .query_active(resource, &partition_key, Utc::now(), 2)
        .await?;
    match rows.len() {
        0 => Ok(true),
        1 => Ok(false),
        _ => {
            log::warn!(
                "is_resource_available({}, {}): {} active rows found, treating as unavailable",
                resource,
                scope,
                rows.len()
            );
            Ok(false)
        }
    }
}

/// Inserts a fresh active record for (resource, scope) with the given
/// TTL. Callers run this from within §4.E's blob-lease-guarded section.
pub async fn insert_record(
    store: &dyn JournalStore,
    resource: &str,
    scope: &str,
    ttl: std::time::Duration,
) -> Result<JournalRecord> {
    let now = Utc::now();
    let record = JournalRecord {
        partition_key: identity::partition_key(scope),
        row_key: Uuid::new_v4().simple().to_string(),
        resource: resource.to_string(),
        scope: scope.to_string(),
        created_at: now,
        expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        completed_at: sentinel_epoch(),
        etag: ETag(String::new()),
    };
    store.insert(record.clone()).await?;
    Ok(record)
}

/// `Prolong` (§4.C). Looks up the active record; advances `expires_at`
/// by `period` and retries the merge from a fresh read on ETag conflict.
/// Returns `false` if the record no longer exists. `ct` is observed
/// between retries and around each suspension point (§4.C, §5).
pub async fn prolong(
    store: &dyn JournalStore,
    record_id: &RecordId,
    period: std::time::Duration,
    ct: &CancellationToken,
) -> Result<bool> {
    let period = chrono::Duration::from_std(period).unwrap_or(chrono::Duration::zero());
    let attempt = move || async move {
        let Some(record) = store.get(record_id).await? else {
            return Ok(RetryOutcome::Done(false));
        };
        if !record.is_active(Utc::now()) {
            return Ok(RetryOutcome::Done(false));
        }
        let mut updated = record.clone();
        updated.expires_at = record.expires_at + period;
        match store.merge(record_id, &record.etag, updated).await? {
            MergeOutcome::Applied(_) => {
                log::debug!("prolong: extended {} by {:?}", record_id.row_key, period);
                Ok(RetryOutcome::Done(true))
            }
            MergeOutcome::Conflict => Ok(RetryOutcome::Retry),
        }
    };
    run_with_conflict_retry(ct, attempt).await
}

/// `End` (§4.C). Idempotent: a missing record is a silent no-op. `ct` is
/// observed between retries and around each suspension point (§4.C, §5).
pub async fn end(store: &dyn JournalStore, record_id: &RecordId, ct: &CancellationToken) -> Result<()> {
    let attempt = move || async move {
        let Some(record) = store.get(record_id).await? else {
            return Ok(RetryOutcome::Done(()));
        };
        if record.completed_at != sentinel_epoch() {
            return Ok(RetryOutcome::Done(()));
        }
        let mut updated = record.clone();
        updated.completed_at = Utc::now();
        match store.merge(record_id, &record.etag, updated).await? {
            MergeOutcome::Applied(_) => {
                log::debug!("end: completed {}", record_id.row_key);
                Ok(RetryOutcome::Done(()))
            }
            MergeOutcome::Conflict => Ok(RetryOutcome::Retry),
        }
    };
    run_with_conflict_retry(ct, attempt).await
}

enum RetryOutcome<T> {
    Done(T),
    Retry,
}

/// Retries `attempt` up to [`MAX_MERGE_RETRIES`] times on ETag conflict,
/// re-reading state fresh on every attempt (§9: bounded retry count with
/// a tiny fixed backoff, tightening the reference's unbounded retry).
/// Termination does not actually depend on the bound: every retry reads
/// fresh state and settles once the row is gone or the merge succeeds.
/// `ct` is raced against both the attempt itself and the backoff sleep,
/// so cancellation is observed at every suspension point (§4.C, §5).
async fn run_with_conflict_retry<F, Fut, T>(ct: &CancellationToken, attempt: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<RetryOutcome<T>>>,
    T: Default,
{
    if ct.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let mut delays = FixedInterval::from_millis(5).take(MAX_MERGE_RETRIES);
    let mut attempts = 0u32;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = ct.cancelled() => return Err(Error::Cancelled),
            result = attempt() => result?,
        };
        match outcome {
            RetryOutcome::Done(value) => return Ok(value),
            RetryOutcome::Retry => {
                attempts += 1;
                log::warn!("etag conflict, retry {attempts}/{MAX_MERGE_RETRIES}");
                match delays.next() {
                    Some(delay) => {
                        tokio::select! {
                            biased;
                            _ = ct.cancelled() => return Err(Error::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        log::error!("etag conflict retry budget exhausted");
                        return Ok(T::default());
                    }
                }
            }
        }
    }
}
