//! The coordinator: wires components A–F together and exposes the
//! public operations from §6. This is `GlobalLock`, the crate's main
//! entry point.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::acquire::{self, Storage};
use crate::blob_gate::BlobLeaseBackend;
use crate::bulkhead::Bulkhead;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::{self, RecordId};
use crate::journal::{self, JournalRecord, JournalStore};
use crate::lease::Lease;
use crate::waiter::{Ticker, Waiters};

/// Shared handle type threaded through [`Lease`] so it can call back into
/// the coordinator for `Wait`/`Release` without owning it.
pub type GlobalLockHandle = Arc<GlobalLock>;

fn require_non_empty(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_argument(format!("{field} must be non-empty")));
    }
    Ok(trimmed.to_string())
}

fn require_positive(duration: Duration, field: &str) -> Result<Duration> {
    if duration.is_zero() {
        return Err(Error::out_of_range(format!("{field} must be positive")));
    }
    Ok(duration)
}

/// The distributed mutual-exclusion service (§2). Owns the shared
/// storage collaborators, the per-key bulkhead, the waiter queues, and
/// the background ticker.
pub struct GlobalLock {
    storage: Arc<Storage>,
    bulkhead: Arc<Bulkhead>,
    waiters: Arc<Waiters>,
    ticker: Arc<Ticker>,
    ticker_task: tokio::task::JoinHandle<()>,
    shutdown: CancellationToken,
    config: Config,
}

impl GlobalLock {
    /// Builds a coordinator over the given storage collaborators (§6's
    /// storage contract) and spawns its ticker.
    pub fn new(
        config: Config,
        journal: Arc<dyn JournalStore>,
        blob: Arc<dyn BlobLeaseBackend>,
    ) -> Result<GlobalLockHandle> {
        config.validate()?;
        let storage = Arc::new(Storage { journal, blob });
        let bulkhead = Arc::new(Bulkhead::new());
        let waiters = Arc::new(Waiters::new());
        let shutdown = CancellationToken::new();
        let ticker = Ticker::new(
            waiters.clone(),
            bulkhead.clone(),
            storage.clone(),
            shutdown.clone(),
            config.tick_interval(),
        );
        let ticker_task = ticker.spawn();
        Ok(Arc::new(GlobalLock {
            storage,
            bulkhead,
            waiters,
            ticker,
            ticker_task,
            shutdown,
            config,
        }))
    }

    /// `TryAcquire(resource, scope, ttl, ct)` (§6/§4.G).
    pub async fn try_acquire(
        self: &Arc<Self>,
        resource: &str,
        scope: Option<&str>,
        ttl: Option<Duration>,
        ct: CancellationToken,
    ) -> Result<Lease> {
        let resource = require_non_empty(resource, "resource")?;
        let scope = match scope {
            Some(scope) => require_non_empty(scope, "scope")?,
            None => "default".to_string(),
        };
        let ttl = require_positive(ttl.unwrap_or_else(|| self.config.default_ttl()), "ttl")?;

        let resource_uid = identity::resource_uid(&resource, &scope);
        let storage = self.storage.clone();
        let shutdown = self.shutdown.clone();
        log::debug!("try_acquire: {resource}/{scope}");
        let record = self
            .bulkhead
            .run(&resource_uid, &ct, || {
                acquire::acquire(&storage, &resource, &scope, ttl, &ct, &shutdown)
            })
            .await?;

        match &record {
            Some(record) => log::debug!("try_acquire: {resource}/{scope} acquired {}", record.row_key),
            None => log::debug!("try_acquire: {resource}/{scope} busy, not acquired"),
        }
        Ok(Lease::new(self.clone(), resource, scope, ttl, record))
    }

    /// `TryExtend(leaseId, period, ct)` (§6/§4.G). `ct` is checked
    /// up front for the cancelled-pre-flight case and again between
    /// each ETag-conflict retry inside `journal::prolong`.
    pub async fn try_extend(&self, lease_id: &str, period: Option<Duration>, ct: CancellationToken) -> Result<bool> {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let lease_id = require_non_empty(lease_id, "leaseId")?;
        let record_id =
            RecordId::decode(&lease_id).ok_or_else(|| Error::invalid_argument("malformed lease id"))?;
        let period = require_positive(period.unwrap_or_else(|| self.config.default_ttl()), "period")?;
        log::debug!("try_extend: {lease_id} by {period:?}");
        let extended = journal::prolong(self.storage.journal.as_ref(), &record_id, period, &ct).await?;
        if !extended {
            log::debug!("try_extend: {lease_id} is no longer active, nothing to extend");
        }
        Ok(extended)
    }

    /// `Release(leaseId, ct)` (§6/§4.G). Idempotent; also schedules an
    /// immediate tick so the next waiter need not wait for the periodic
    /// interval.
    pub async fn release(&self, lease_id: &str, ct: CancellationToken) -> Result<()> {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let lease_id = require_non_empty(lease_id, "leaseId")?;
        let record_id =
            RecordId::decode(&lease_id).ok_or_else(|| Error::invalid_argument("malformed lease id"))?;
        log::debug!("release: {lease_id}");
        journal::end(self.storage.journal.as_ref(), &record_id, &ct).await?;
        self.ticker.poke_now();
        Ok(())
    }

    pub(crate) async fn wait_for(
        &self,
        resource_uid: String,
        resource: String,
        scope: String,
        ttl: Duration,
        ct: CancellationToken,
    ) -> Result<JournalRecord> {
        let rx = self
            .waiters
            .enqueue(resource_uid, resource, scope, ttl, ct.clone());
        tokio::select! {
            biased;
            _ = ct.cancelled() => Err(Error::Cancelled),
            result = rx => result.map_err(|_| Error::Cancelled)?,
        }
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.ticker_task.abort();
    }
}
