//! Component G: the user-visible lease handle.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::core::GlobalLockHandle;
use crate::error::Result;
use crate::identity::{self, RecordId};

enum State {
    /// `New` — not yet acquired, not queued.
    Unacquired,
    Acquired {
        record_id: RecordId,
        expires_at: DateTime<Utc>,
    },
    Released,
}

/// A grant on (resource, scope), possibly still pending.
///
/// State machine: `New -> Acquired -> Released`, with `New -> Cancelled`
/// (via [`Lease::wait`] failing) and `New -> Acquired -> Expired`
/// (observable as [`Lease::is_acquired`] flipping to `false` once
/// `expiresAt` has passed, with no explicit transition required).
pub struct Lease {
    lock: GlobalLockHandle,
    resource: String,
    scope: String,
    ttl: std::time::Duration,
    state: Mutex<State>,
}

impl Lease {
    pub(crate) fn new(
        lock: GlobalLockHandle,
        resource: String,
        scope: String,
        ttl: std::time::Duration,
        record: Option<crate::journal::JournalRecord>,
    ) -> Self {
        let state = match record {
            Some(record) => State::Acquired {
                record_id: record.record_id(),
                expires_at: record.expires_at,
            },
            None => State::Unacquired,
        };
        Lease {
            lock,
            resource,
            scope,
            ttl,
            state: Mutex::new(state),
        }
    }

    /// The opaque lease id, once acquired.
    pub fn lease_id(&self) -> Option<String> {
        match &*self.state.lock().expect("lease state poisoned") {
            State::Acquired { record_id, .. } => Some(record_id.encode()),
            State::Unacquired | State::Released => None,
        }
    }

    /// `recordId != null AND expiresAt > now` (§3).
    pub fn is_acquired(&self) -> bool {
        match &*self.state.lock().expect("lease state poisoned") {
            State::Acquired { expires_at, .. } => *expires_at > Utc::now(),
            State::Unacquired | State::Released => false,
        }
    }

    /// Completes immediately if already acquired; otherwise enqueues via
    /// the waiter queue and resolves once promoted or on cancellation.
    /// Repeated calls are allowed.
    pub async fn wait(&self, ct: CancellationToken) -> Result<()> {
        if self.is_acquired() {
            return Ok(());
        }
        log::debug!("lease wait: {}/{} enqueuing", self.resource, self.scope);
        let resource_uid = identity::resource_uid(&self.resource, &self.scope);
        let record = self
            .lock
            .wait_for(resource_uid, self.resource.clone(), self.scope.clone(), self.ttl, ct)
            .await?;
        log::debug!("lease wait: {}/{} promoted {}", self.resource, self.scope, record.row_key);
        *self.state.lock().expect("lease state poisoned") = State::Acquired {
            record_id: record.record_id(),
            expires_at: record.expires_at,
        };
        Ok(())
    }

    /// No-op if not currently acquired.
    pub async fn release(&self, ct: CancellationToken) -> Result<()> {
        let lease_id = {
            let mut state = self.state.lock().expect("lease state poisoned");
            match &*state {
                State::Acquired { record_id, .. } => {
                    let id = record_id.encode();
                    *state = State::Released;
                    Some(id)
                }
                State::Unacquired | State::Released => None,
            }
        };
        if let Some(lease_id) = lease_id {
            log::debug!("lease release: {}/{}", self.resource, self.scope);
            self.lock.release(&lease_id, ct).await?;
        }
        Ok(())
    }
}

impl Drop for Lease {
    /// Scoped release: best effort, no cancellation token to wait on.
    fn drop(&mut self) {
        let lease_id = match &*self.state.lock().expect("lease state poisoned") {
            State::Acquired { record_id, expires_at } if *expires_at > Utc::now() => {
                Some(record_id.encode())
            }
            _ => None,
        };
        let Some(lease_id) = lease_id else { return };
        log::debug!("lease scoped release: {}/{}", self.resource, self.scope);
        let lock = self.lock.clone();
        tokio::spawn(async move {
            if let Err(err) = lock.release(&lease_id, CancellationToken::new()).await {
                log::warn!("lease scoped release failed: {err}");
            }
        });
    }
}
