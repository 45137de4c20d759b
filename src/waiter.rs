//! Component F: the waiter queue and ticker. Per-resourceUID queues of
//! local contenders, promoted in FIFO order by a cooperative ticker that
//! re-drives the acquisition protocol (§4.F).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::acquire::{self, Storage};
use crate::bulkhead::Bulkhead;
use crate::error::Result;
use crate::journal::JournalRecord;

struct PendingRequest {
    resource: String,
    scope: String,
    ttl: Duration,
    ct: CancellationToken,
    completion: oneshot::Sender<Result<JournalRecord>>,
}

/// `requests : map<resourceUID, queue<LeaseRequest>>` (§3).
#[derive(Default)]
pub struct Waiters {
    queues: Mutex<HashMap<String, VecDeque<PendingRequest>>>,
}

impl Waiters {
    pub fn new() -> Self {
        Waiters::default()
    }

    /// `Enqueue`: appends to the queue for `resource_uid`, returning a
    /// receiver that resolves once the request has been promoted or
    /// fails on cancellation. Atomic with respect to a concurrent tick
    /// dequeuing from the same queue, since both go through the same
    /// std mutex.
    pub fn enqueue(
        &self,
        resource_uid: String,
        resource: String,
        scope: String,
        ttl: Duration,
        ct: CancellationToken,
    ) -> oneshot::Receiver<Result<JournalRecord>> {
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            resource,
            scope,
            ttl,
            ct,
            completion: tx,
        };
        self.queues
            .lock()
            .expect("waiter map poisoned")
            .entry(resource_uid)
            .or_default()
            .push_back(request);
        rx
    }

    fn keys_snapshot(&self) -> Vec<String> {
        self.queues
            .lock()
            .expect("waiter map poisoned")
            .keys()
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn queue_len(&self, resource_uid: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(resource_uid)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

/// The periodic promoter: on each tick (or immediate poke), attempts to
/// promote the head of every non-empty waiter queue.
pub struct Ticker {
    waiters: Arc<Waiters>,
    bulkhead: Arc<Bulkhead>,
    storage: Arc<Storage>,
    shutdown: CancellationToken,
    interval: Duration,
    poke: tokio::sync::Notify,
}

impl Ticker {
    pub fn new(
        waiters: Arc<Waiters>,
        bulkhead: Arc<Bulkhead>,
        storage: Arc<Storage>,
        shutdown: CancellationToken,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Ticker {
            waiters,
            bulkhead,
            storage,
            shutdown,
            interval,
            poke: tokio::sync::Notify::new(),
        })
    }

    /// Starts the background tick loop. The returned handle is owned by
    /// the caller ([`crate::GlobalLock`]); dropping the lock and
    /// cancelling `shutdown` lets it exit.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = this.poke.notified() => {}
                    _ = this.shutdown.cancelled() => return,
                }
                this.tick_once().await;
            }
        })
    }

    /// `Release` additionally triggers an immediate tick, out-of-band
    /// from the periodic schedule, so the next waiter need not wait out
    /// a full interval (§4.F, resolving the first Open Question in §9
    /// by scheduling a tick rather than re-entering the protocol on the
    /// releasing caller's own task).
    pub fn poke_now(&self) {
        self.poke.notify_one();
    }

    async fn tick_once(&self) {
        for key in self.waiters.keys_snapshot() {
            let waiters = self.waiters.clone();
            let bulkhead = self.bulkhead.clone();
            let storage = self.storage.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let ct = CancellationToken::new();
                let _ = bulkhead
                    .run(&key, &ct, || {
                        promote_head(&waiters, &storage, &shutdown, &key)
                    })
                    .await;
            });
        }
    }
}

/// `TryAcquirePending`: drops stale heads (cancelled, or whose caller
/// already gave up) until it finds a live one, runs §4.E on it, and
/// either completes+dequeues it (on acquisition or fatal error) or
/// leaves it at the head for the next tick (still unacquired).
async fn promote_head(
    waiters: &Waiters,
    storage: &Storage,
    shutdown: &CancellationToken,
    key: &str,
) -> Result<()> {
    loop {
        let head = {
            let mut queues = waiters.queues.lock().expect("waiter map poisoned");
            let Some(queue) = queues.get_mut(key) else {
                return Ok(());
            };
            let Some(front) = queue.pop_front() else {
                queues.remove(key);
                return Ok(());
            };
            if queue.is_empty() {
                queues.remove(key);
            }
            front
        };

        if head.ct.is_cancelled() || head.completion.is_closed() {
            log::debug!("promote_head: dropping stale waiter for {key}");
            continue;
        }

        let outcome = acquire::acquire(
            storage,
            &head.resource,
            &head.scope,
            head.ttl,
            &head.ct,
            shutdown,
        )
        .await;

        match outcome {
            Ok(Some(record)) => {
                log::debug!("promote_head: promoted waiter for {key} to {}", record.row_key);
                let _ = head.completion.send(Ok(record));
                return Ok(());
            }
            Ok(None) => {
                log::debug!("promote_head: {key} still unavailable, requeuing for the next tick");
                // Still unacquired: requeue at the head for the next tick.
                let mut queues = waiters.queues.lock().expect("waiter map poisoned");
                queues.entry(key.to_string()).or_default().push_front(head);
                return Ok(());
            }
            Err(err) => {
                log::warn!("promote_head: {key} failed: {err}");
                let _ = head.completion.send(Err(err));
                return Ok(());
            }
        }
    }
}
