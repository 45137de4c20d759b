//! Component D: the blob-lease gate. A short server-side blob lease used
//! strictly as a mutual-exclusion barrier around the journal's
//! check-then-insert (§4.D).

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Server-side TTL of the blob lease.
pub const BLOB_LEASE_SECONDS: u64 = 30;

/// Local safety margin before the server-side TTL: the gate fires its
/// `Expired` signal one second early so an in-flight journal write can
/// be cancelled before the backend would have reclaimed the lease.
pub const LOCAL_EXPIRY: Duration = Duration::from_secs(BLOB_LEASE_SECONDS - 1);

/// Outcome of attempting to acquire a blob lease.
pub enum AcquireAttempt {
    Acquired(Gate),
    /// "Lease already present" — a normal unacquired outcome, not an
    /// error (§7).
    AlreadyLeased,
}

/// The storage collaborator's blob-side contract (§6): container/blob
/// create-if-absent, lease acquire/release with integer-second TTL.
#[async_trait]
pub trait BlobLeaseBackend: Send + Sync {
    async fn ensure_container(&self) -> Result<()>;
    async fn ensure_blob(&self, blob_name: &str) -> Result<()>;
    /// `None` signals "lease already present"; `Some(native_id)` carries
    /// the backend's own lease identifier, used for the matching release.
    async fn acquire_lease(&self, blob_name: &str, seconds: u64) -> Result<Option<String>>;
    /// Releases the lease. Returns `Ok(false)` (not an error) if the
    /// lease was already gone — expired, or released concurrently by
    /// another holder; any other failure is a fatal `Err`.
    async fn release_lease(&self, blob_name: &str, native_lease_id: &str) -> Result<bool>;
}

/// A held (or not-held) blob lease plus its local expiry countdown.
pub struct Gate {
    blob_name: String,
    native_lease_id: Option<String>,
    expiry: CancellationToken,
    _timer: Option<tokio::task::JoinHandle<()>>,
}

impl Gate {
    fn acquired(blob_name: String, native_lease_id: String, local_expiry: Duration) -> Self {
        let expiry = CancellationToken::new();
        let timer_expiry = expiry.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(local_expiry).await;
            timer_expiry.cancel();
        });
        Gate {
            blob_name,
            native_lease_id: Some(native_lease_id),
            expiry,
            _timer: Some(timer),
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.native_lease_id.is_some()
    }

    /// Edge-triggered: fires once the local countdown elapses without a
    /// prior release. Safe to await repeatedly or not at all.
    pub fn expired(&self) -> CancellationToken {
        self.expiry.clone()
    }

    /// Idempotent. Swallows "not held any more"; propagates any other
    /// backend failure (§4.D, §7).
    pub async fn release(&mut self, backend: &dyn BlobLeaseBackend) -> Result<()> {
        if let Some(native_id) = self.native_lease_id.take() {
            if let Some(timer) = self._timer.take() {
                timer.abort();
            }
            let held = backend.release_lease(&self.blob_name, &native_id).await?;
            if held {
                log::debug!("gate release: {} released", self.blob_name);
            } else {
                log::debug!("gate release: {} was already gone", self.blob_name);
            }
        }
        Ok(())
    }
}

/// `TryAcquireBlobLease` (§4.D): ensure container/blob exist, then
/// attempt the lease. The local expiry duration is not part of the
/// external contract (§5); production callers go through [`try_acquire`],
/// which fixes it at [`LOCAL_EXPIRY`]. Tests use
/// [`try_acquire_with_local_expiry`] directly to exercise the expiry path
/// without waiting out the real 29-second margin.
pub async fn try_acquire(
    backend: &dyn BlobLeaseBackend,
    resource_uid: &str,
) -> Result<AcquireAttempt> {
    try_acquire_with_local_expiry(backend, resource_uid, LOCAL_EXPIRY).await
}

pub(crate) async fn try_acquire_with_local_expiry(
    backend: &dyn BlobLeaseBackend,
    resource_uid: &str,
    local_expiry: Duration,
) -> Result<AcquireAttempt> {
    backend.ensure_container().await?;
    backend.ensure_blob(resource_uid).await?;
    match backend
        .acquire_lease(resource_uid, BLOB_LEASE_SECONDS)
        .await?
    {
        Some(native_id) => Ok(AcquireAttempt::Acquired(Gate::acquired(
            resource_uid.to_string(),
            native_id,
            local_expiry,
        ))),
        None => Ok(AcquireAttempt::AlreadyLeased),
    }
}
