//! Component E: the acquisition protocol — the core of this crate.
//! Composes the bulkhead (B), the journal repository (C), and the
//! blob-lease gate (D) into a two-phase check-then-insert that is safe
//! across processes despite neither primitive alone providing mutual
//! exclusion (§4.E).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::blob_gate::{self, AcquireAttempt, BlobLeaseBackend};
use crate::error::{Error, Result};
use crate::identity;
use crate::journal::{self, JournalRecord, JournalStore};

/// The two storage collaborators bundled together, shared across every
/// acquisition attempt a [`crate::GlobalLock`] makes.
pub struct Storage {
    pub journal: Arc<dyn JournalStore>,
    pub blob: Arc<dyn BlobLeaseBackend>,
}

/// Runs the acquisition protocol once. Returns `Ok(Some(record))` on a
/// successful acquisition, `Ok(None)` on any of the "did not acquire"
/// outcomes (resource busy, lease already held elsewhere, lost the race
/// on the re-check) — acquisition failure is never an error (§7). Only
/// cancellation and fatal backend errors are returned as `Err`.
pub async fn acquire(
    storage: &Storage,
    resource: &str,
    scope: &str,
    ttl: Duration,
    ct: &CancellationToken,
    shutdown: &CancellationToken,
) -> Result<Option<JournalRecord>> {
    acquire_with_local_expiry(
        storage,
        resource,
        scope,
        ttl,
        ct,
        shutdown,
        blob_gate::LOCAL_EXPIRY,
    )
    .await
}

/// Same protocol as [`acquire`], but with the gate's local-expiry margin
/// overridable. The margin is not part of the external contract (§5);
/// this entry point exists so tests can exercise the "blob lease lost
/// mid-insert" failure mode (§8 scenario S5) without waiting out the
/// real 29-second window.
pub async fn acquire_with_local_expiry(
    storage: &Storage,
    resource: &str,
    scope: &str,
    ttl: Duration,
    ct: &CancellationToken,
    shutdown: &CancellationToken,
    local_expiry: Duration,
) -> Result<Option<JournalRecord>> {
    // Cancelled pre-flight: no backend call is made at all (§8 property 6).
    if ct.is_cancelled() || shutdown.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // Step 1: pre-check, raced against cancellation/shutdown so a slow
    // backend call cannot hide a pending cancellation (§4.C, §5).
    if !race_cancellation(
        ct,
        shutdown,
        journal::is_resource_available(storage.journal.as_ref(), resource, scope),
    )
    .await?
    {
        log::debug!("acquire: {resource}/{scope} busy on pre-check");
        return Ok(None);
    }

    // Step 2: acquire the blob-lease gate.
    let resource_uid = identity::resource_uid(resource, scope);
    let mut gate = match blob_gate::try_acquire_with_local_expiry(
        storage.blob.as_ref(),
        &resource_uid,
        local_expiry,
    )
    .await?
    {
        AcquireAttempt::AlreadyLeased => {
            log::debug!("acquire: {resource}/{scope} blob lease already held elsewhere");
            return Ok(None);
        }
        AcquireAttempt::Acquired(gate) => {
            log::debug!("acquire: {resource}/{scope} blob lease gate acquired");
            gate
        }
    };

    // Steps 3-4, raced against cancellation from the caller, process
    // shutdown, or the gate's local expiry signal — whichever fires
    // first aborts the in-flight insert.
    let expired = gate.expired();
    let outcome = tokio::select! {
        biased;
        _ = ct.cancelled() => Err(Error::Cancelled),
        _ = shutdown.cancelled() => Err(Error::Cancelled),
        _ = expired.cancelled() => {
            log::warn!("acquire: {resource}/{scope} blob lease expired locally before insert completed");
            Err(Error::Cancelled)
        }
        result = guarded_insert(storage, resource, scope, ttl, &gate, ct, shutdown) => result,
    };

    // Step 5: release the gate on every exit path, using the caller's
    // own token rather than the (possibly just-fired) linked one, so a
    // cancelled insert still releases cleanly. A release failure is
    // fatal (§7) and must reach the caller; the protocol's own outcome
    // takes priority when both failed, since it is the more specific
    // diagnosis.
    let outcome = match (outcome, gate.release(storage.blob.as_ref()).await) {
        (Err(err), _) => Err(err),
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => {
            log::error!("acquire: {resource}/{scope} failed to release blob lease gate: {release_err}");
            Err(release_err)
        }
    };

    match &outcome {
        Ok(Some(record)) => log::debug!("acquire: {resource}/{scope} inserted {}", record.row_key),
        Ok(None) => log::debug!("acquire: {resource}/{scope} lost the race, not acquired"),
        Err(err) => log::debug!("acquire: {resource}/{scope} aborted: {err}"),
    }

    outcome
}

async fn guarded_insert(
    storage: &Storage,
    resource: &str,
    scope: &str,
    ttl: Duration,
    gate: &blob_gate::Gate,
    ct: &CancellationToken,
    shutdown: &CancellationToken,
) -> Result<Option<JournalRecord>> {
    // Step 3: re-check inside the gate, raced the same way as step 1.
    if !race_cancellation(
        ct,
        shutdown,
        journal::is_resource_available(storage.journal.as_ref(), resource, scope),
    )
    .await?
    {
        return Ok(None);
    }
    if !gate.is_acquired() {
        return Ok(None);
    }
    // Step 4: insert.
    let record = journal::insert_record(storage.journal.as_ref(), resource, scope, ttl).await?;
    Ok(Some(record))
}

/// Races `fut` against `ct`/`shutdown`, so a slow backend call cannot
/// delay observing a cancellation that arrived while it was in flight.
async fn race_cancellation<T>(
    ct: &CancellationToken,
    shutdown: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = ct.cancelled() => Err(Error::Cancelled),
        _ = shutdown.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}
