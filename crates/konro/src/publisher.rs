use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use uuid::Uuid;
use crate::queue::WorkQueue;
use crate::ticket::Ticket;
use crate::wire::ResultRecord;

/// # ResultPublisher
///
/// Writes each request's terminal outcome back exactly once.
///
/// Publication is idempotent on the request id: the first terminal event for
/// an id wins, and any later duplicate (a retried delivery, a completion
/// racing an expiry) is dropped without touching the stored result or
/// re-notifying the caller. The publisher is the only component that fires
/// caller tickets, so "at most one notification" falls out of the same
/// id set.
///
/// Retention of an id is bounded: once every path that could still produce a
/// terminal event for it is done, the settling component calls [`forget`]
/// and the entry is released, keeping the set proportional to live requests
/// rather than to total throughput.
///
/// [`forget`]: ResultPublisher::forget
pub struct ResultPublisher<Q: WorkQueue> {
    queue: Arc<Q>,

    /// Ids that already have a published result.
    published: Mutex<HashSet<Uuid>>,

    /// Pending caller-side notification channels, keyed by request id.
    tickets: Mutex<HashMap<Uuid, oneshot::Sender<ResultRecord>>>,
}

impl<Q: WorkQueue> ResultPublisher<Q> {
    pub fn new(queue: Arc<Q>) -> Self {
        Self {
            queue,
            published: Mutex::new(HashSet::new()),
            tickets: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a caller-side ticket that resolves when `id` reaches a
    /// terminal state.
    pub async fn register(&self, id: Uuid) -> Ticket {
        let (tx, rx) = oneshot::channel();
        self.tickets.lock().await.insert(id, tx);
        Ticket::new(id, rx)
    }

    /// Discards the pending ticket for `id`, if any.
    ///
    /// For submissions that fail after registration; the caller side of the
    /// dropped channel observes the closure instead of hanging.
    pub(crate) async fn unregister(&self, id: Uuid) {
        self.tickets.lock().await.remove(&id);
    }

    /// Whether a caller is still awaiting a result for `id`.
    pub(crate) async fn awaiting_result(&self, id: Uuid) -> bool {
        self.tickets.lock().await.contains_key(&id)
    }

    /// Releases the duplicate-screening entry for `id`.
    ///
    /// Call only once no path can still publish a terminal event for the id;
    /// a later publish for it would be treated as fresh.
    pub async fn forget(&self, id: Uuid) {
        self.published.lock().await.remove(&id);
    }

    /// Number of ids currently held for duplicate screening.
    #[allow(dead_code)]
    pub(crate) async fn retained(&self) -> usize {
        self.published.lock().await.len()
    }

    /// Number of tickets not yet resolved.
    #[allow(dead_code)]
    pub(crate) async fn pending_tickets(&self) -> usize {
        self.tickets.lock().await.len()
    }

    /// Publishes a terminal result, once.
    ///
    /// Returns `false` if a result for this id was already published; the
    /// duplicate is dropped entirely.
    pub async fn publish(&self, record: ResultRecord) -> bool {
        {
            let mut published = self.published.lock().await;
            if !published.insert(record.id) {
                tracing::debug!(id = %record.id, status = ?record.status,
                    "dropping duplicate terminal result");
                return false;
            }
        }

        tracing::debug!(id = %record.id, status = ?record.status, "publishing result");
        if let Err(err) = self.queue.publish(record.clone()).await {
            // The caller still gets notified; the backend missed this write
            // and has to rely on its own redelivery story.
            tracing::warn!(id = %record.id, error = %err, "failed to publish result to queue");
        }

        if let Some(tx) = self.tickets.lock().await.remove(&record.id) {
            let _ = tx.send(record);
        }
        true
    }
}
