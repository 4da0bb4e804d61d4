//! Batch formation.
//!
//! [`form_batch`] is the admission state machine: it owns the decision of
//! which queued requests enter the batch currently under formation, and when
//! that batch closes. It is deliberately a free function over an injected
//! [`WorkQueue`] so it can be driven directly by tests on a paused clock,
//! with no dispatcher around it.

use std::cmp;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;
use crate::cancel::CancelRegistry;
use crate::config::DispatcherConfig;
use crate::queue::WorkQueue;
use crate::request::{Request, RequestState};

/// Ceiling for the dequeue retry backoff when the queue is unavailable.
const MAX_QUEUE_BACKOFF: Duration = Duration::from_secs(1);

/// # Batch
///
/// A transient grouping of request ids admitted together.
///
/// A batch has no life after dispatch: individual requests, not the batch,
/// are the unit of completion and result delivery. The timestamps exist for
/// observability and for asserting the admission-window invariant; nothing
/// downstream keys off them.
#[derive(Debug, Clone)]
pub struct Batch {
    ids: Vec<Uuid>,
    formation_start: Instant,
    admission_close: Option<Instant>,
    dispatch_at: Option<Instant>,
}

impl Batch {
    pub(crate) fn new(formation_start: Instant) -> Self {
        Self {
            ids: Vec::new(),
            formation_start,
            admission_close: None,
            dispatch_at: None,
        }
    }

    pub(crate) fn push(&mut self, id: Uuid) {
        self.ids.push(id);
    }

    pub(crate) fn remove(&mut self, id: Uuid) {
        self.ids.retain(|member| *member != id);
    }

    pub(crate) fn close(&mut self, at: Instant) {
        self.admission_close = Some(at);
    }

    pub(crate) fn mark_dispatched(&mut self, at: Instant) {
        self.dispatch_at = Some(at);
    }

    /// Ids admitted into this batch, in admission order.
    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    /// Instant the first request was admitted.
    pub fn formation_start(&self) -> Instant {
        self.formation_start
    }

    /// Instant admission closed (size cap or window elapsed), if closed.
    pub fn admission_close(&self) -> Option<Instant> {
        self.admission_close
    }

    pub fn dispatch_at(&self) -> Option<Instant> {
        self.dispatch_at
    }
}

/// Everything one batch-forming cycle produced.
///
/// `expired` and `cancelled` requests were screened out before dispatch and
/// already carry their terminal state; the caller publishes their results.
/// `admitted` requests are in state `Admitted` and belong to `batch`.
pub(crate) struct FormationOutcome {
    pub batch: Option<Batch>,
    pub admitted: Vec<Request>,
    pub expired: Vec<Request>,
    pub cancelled: Vec<Request>,
}

impl FormationOutcome {
    fn empty() -> Self {
        Self {
            batch: None,
            admitted: Vec::new(),
            expired: Vec::new(),
            cancelled: Vec::new(),
        }
    }
}

/// Runs one batch-forming cycle against the queue.
///
/// Waits indefinitely (in poll-interval slices, so shutdown is observed) for
/// the first admissible request; from that admission the batch may stay open
/// at most `max_wait`, closing earlier only if the size cap fills it. An
/// empty batch is never produced: on shutdown before the first admission, or
/// when the only requests seen were screened out as expired or cancelled,
/// the outcome carries no batch.
///
/// The admission deadline is computed once and passed into every poll as a
/// bounded slice, rather than resampling wall-clock time, so the cycle is
/// deterministic under a simulated clock.
pub(crate) async fn form_batch<Q: WorkQueue>(
    queue: &Q,
    config: &DispatcherConfig,
    running: &AtomicBool,
    cancels: &CancelRegistry,
) -> FormationOutcome {
    let poll = config.queue_poll_interval();
    let mut out = FormationOutcome::empty();
    let mut backoff = poll;

    // Wait for the first member. No upper bound here: with nothing admitted
    // there is nothing to dispatch, so there is no window to enforce yet.
    let first = loop {
        if !running.load(Ordering::SeqCst) {
            return out;
        }
        match queue.dequeue(poll).await {
            Ok(Some(request)) => {
                backoff = poll;
                match screen(request, cancels, &mut out).await {
                    Some(request) => break request,
                    // Screened out with nothing admitted: end the cycle so
                    // the terminal result publishes now rather than after
                    // some unrelated batch closes.
                    None => return out,
                }
            }
            Ok(None) => backoff = poll,
            Err(err) => {
                tracing::warn!(error = %err, backoff_ms = backoff.as_millis() as u64,
                    "queue unavailable; retrying dequeue");
                tokio::time::sleep(backoff).await;
                backoff = cmp::min(backoff * 2, MAX_QUEUE_BACKOFF);
            }
        }
    };

    let mut batch = Batch::new(Instant::now());
    admit(first, &mut batch, &mut out);
    let deadline = batch.formation_start() + config.max_wait();

    // Race further dequeues against the admission deadline. Size cap closes
    // the batch immediately; the deadline closes whatever has accumulated
    // (a partial fill is valid and expected).
    while out.admitted.len() < config.max_batch_size {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let slice = cmp::min(deadline - now, poll);
        match queue.dequeue(slice).await {
            Ok(Some(request)) => {
                if let Some(request) = screen(request, cancels, &mut out).await {
                    admit(request, &mut batch, &mut out);
                }
            }
            Ok(None) => {}
            Err(err) => {
                // The admission deadline still governs; just sit out one
                // slice before retrying.
                tracing::warn!(error = %err, "queue unavailable during admission window");
                tokio::time::sleep(slice).await;
            }
        }
    }
    batch.close(Instant::now());

    // Drop members cancelled while the batch was still forming.
    let members = mem::take(&mut out.admitted);
    for request in members {
        if cancels.take(request.id()).await {
            batch.remove(request.id());
            settle_cancelled(request, &mut out);
        } else {
            out.admitted.push(request);
        }
    }

    tracing::debug!(
        size = batch.len(),
        window_ms = (batch.admission_close().unwrap_or(batch.formation_start())
            - batch.formation_start())
        .as_millis() as u64,
        "batch closed"
    );
    out.batch = Some(batch);
    out
}

/// Screens a freshly dequeued request: consumes a pending cancellation mark
/// or an already-elapsed deadline without admitting it (and without spending
/// any of the admission window on it).
async fn screen(
    mut request: Request,
    cancels: &CancelRegistry,
    out: &mut FormationOutcome,
) -> Option<Request> {
    if cancels.take(request.id()).await {
        settle_cancelled(request, out);
        return None;
    }
    if request.deadline_elapsed(Instant::now()) {
        tracing::debug!(id = %request.id(), "deadline elapsed before admission; excluding");
        if let Err(err) = request.advance(RequestState::Expired) {
            tracing::error!(id = %request.id(), %err, "could not expire request");
        }
        out.expired.push(request);
        return None;
    }
    Some(request)
}

fn settle_cancelled(mut request: Request, out: &mut FormationOutcome) {
    tracing::debug!(id = %request.id(), "request cancelled before dispatch");
    if let Err(err) = request.advance(RequestState::Failed) {
        tracing::error!(id = %request.id(), %err, "could not mark request cancelled");
    }
    out.cancelled.push(request);
}

fn admit(mut request: Request, batch: &mut Batch, out: &mut FormationOutcome) {
    if let Err(err) = request.advance(RequestState::Admitted) {
        tracing::error!(id = %request.id(), %err, "refusing to admit request in unexpected state");
        return;
    }
    batch.push(request.id());
    out.admitted.push(request);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use async_trait::async_trait;
    use bytes::Bytes;
    use crate::error::QueueError;
    use crate::queue::MemoryQueue;
    use crate::wire::ResultRecord;

    fn config(max_batch_size: usize, max_wait_ms: u64) -> DispatcherConfig {
        DispatcherConfig {
            max_batch_size,
            max_wait_ms,
            queue_poll_interval_ms: 10,
            ..Default::default()
        }
    }

    fn request() -> Request {
        Request::new(Bytes::from_static(b"prompt"), None)
    }

    fn running() -> AtomicBool {
        AtomicBool::new(true)
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_closes_at_the_admission_deadline() {
        let queue = MemoryQueue::new();
        let cancels = CancelRegistry::new();
        queue.enqueue(request()).await.unwrap();
        queue.enqueue(request()).await.unwrap();

        let out = form_batch(&queue, &config(3, 100), &running(), &cancels).await;
        let batch = out.batch.expect("a non-empty batch should close");

        assert_eq!(batch.len(), 2, "both requests should be admitted");
        assert_eq!(out.admitted.len(), 2);
        let window = batch.admission_close().unwrap() - batch.formation_start();
        assert!(window >= Duration::from_millis(100), "window was {:?}", window);
        assert!(window < Duration::from_millis(110), "window was {:?}", window);
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_closes_before_the_deadline() {
        let queue = MemoryQueue::new();
        let cancels = CancelRegistry::new();
        for _ in 0..3 {
            queue.enqueue(request()).await.unwrap();
        }

        let out = form_batch(&queue, &config(3, 100), &running(), &cancels).await;
        let batch = out.batch.unwrap();

        assert_eq!(batch.len(), 3);
        let window = batch.admission_close().unwrap() - batch.formation_start();
        assert!(
            window < Duration::from_millis(100),
            "size cap should close the batch without waiting out the window"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn staggered_arrivals_split_into_full_then_partial_batch() {
        let queue = Arc::new(MemoryQueue::new());
        let cancels = CancelRegistry::new();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    queue.enqueue(request()).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let cfg = config(3, 100);
        let flag = running();

        let first = form_batch(&*queue, &cfg, &flag, &cancels).await;
        let first_batch = first.batch.unwrap();
        assert_eq!(first_batch.len(), 3, "first batch should fill to the cap");
        let window = first_batch.admission_close().unwrap() - first_batch.formation_start();
        assert!(
            window < Duration::from_millis(100),
            "the cap should close the first batch at the third arrival"
        );

        let second = form_batch(&*queue, &cfg, &flag, &cancels).await;
        let second_batch = second.batch.unwrap();
        assert_eq!(second_batch.len(), 2, "second batch should hold the remainder");

        producer.await.unwrap();

        let first_ids: HashSet<Uuid> = first_batch.ids().iter().copied().collect();
        for id in second_batch.ids() {
            assert!(!first_ids.contains(id), "no id may appear in two batches");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_wait_dispatches_singles_immediately() {
        let queue = MemoryQueue::new();
        let cancels = CancelRegistry::new();
        queue.enqueue(request()).await.unwrap();
        queue.enqueue(request()).await.unwrap();

        let out = form_batch(&queue, &config(8, 0), &running(), &cancels).await;
        let batch = out.batch.unwrap();
        assert_eq!(batch.len(), 1, "max_wait of zero should dispatch singles");
        assert_eq!(
            batch.admission_close().unwrap(),
            batch.formation_start(),
            "the window should not stay open at all"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_deadline_is_expired_and_excluded() {
        let queue = MemoryQueue::new();
        let cancels = CancelRegistry::new();

        let doomed = Request::new(
            Bytes::from_static(b"late"),
            Some(Instant::now() + Duration::from_millis(50)),
        );
        let doomed_id = doomed.id();
        queue.enqueue(doomed).await.unwrap();
        // Let the deadline lapse while the request still sits in the queue.
        tokio::time::advance(Duration::from_millis(60)).await;
        let live = request();
        let live_id = live.id();
        queue.enqueue(live).await.unwrap();

        let cfg = config(3, 100);
        let flag = running();

        // Screening out the doomed request ends the cycle with no batch, so
        // its expiry can be published without waiting on a window.
        let out = form_batch(&queue, &cfg, &flag, &cancels).await;
        assert!(out.batch.is_none());
        assert_eq!(out.expired.len(), 1);
        assert_eq!(out.expired[0].id(), doomed_id);
        assert_eq!(out.expired[0].state(), RequestState::Expired);

        let out = form_batch(&queue, &cfg, &flag, &cancels).await;
        let batch = out.batch.unwrap();
        assert!(!batch.contains(doomed_id), "expired request must not join a batch");
        assert!(batch.contains(live_id));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_never_reaches_admission() {
        let queue = MemoryQueue::new();
        let cancels = CancelRegistry::new();

        let victim = request();
        let victim_id = victim.id();
        cancels.mark(victim_id).await;
        queue.enqueue(victim).await.unwrap();
        queue.enqueue(request()).await.unwrap();

        let cfg = config(2, 50);
        let flag = running();

        let out = form_batch(&queue, &cfg, &flag, &cancels).await;
        assert!(out.batch.is_none());
        assert_eq!(out.cancelled.len(), 1);
        assert_eq!(out.cancelled[0].id(), victim_id);
        assert_eq!(out.cancelled[0].state(), RequestState::Failed);

        let out = form_batch(&queue, &cfg, &flag, &cancels).await;
        let batch = out.batch.unwrap();
        assert!(!batch.contains(victim_id));
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_the_window_drops_the_member_at_close() {
        let queue = MemoryQueue::new();
        let cancels = CancelRegistry::new();

        let victim = request();
        let victim_id = victim.id();
        queue.enqueue(victim).await.unwrap();
        queue.enqueue(request()).await.unwrap();

        // Cancel after admission but before the window closes.
        let cancel_task = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancels.mark(victim_id).await;
        };
        let cfg = config(5, 100);
        let flag = running();
        let (out, _) = tokio::join!(form_batch(&queue, &cfg, &flag, &cancels), cancel_task);

        let batch = out.batch.unwrap();
        assert!(!batch.contains(victim_id), "cancelled member must be dropped before dispatch");
        assert_eq!(out.cancelled.len(), 1);
        assert_eq!(out.admitted.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_any_admission_yields_no_batch() {
        let queue = MemoryQueue::new();
        let cancels = CancelRegistry::new();
        let flag = AtomicBool::new(false);

        let out = form_batch(&queue, &config(3, 100), &flag, &cancels).await;
        assert!(out.batch.is_none());
        assert!(out.admitted.is_empty());
    }

    /// Queue that fails its first few dequeues, then hands off to a real one.
    struct FlakyQueue {
        inner: MemoryQueue,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl WorkQueue for FlakyQueue {
        async fn enqueue(&self, request: Request) -> Result<(), QueueError> {
            self.inner.enqueue(request).await
        }

        async fn dequeue(&self, max_wait: Duration) -> Result<Option<Request>, QueueError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(QueueError::Unavailable("simulated outage".into()));
            }
            self.inner.dequeue(max_wait).await
        }

        async fn publish(&self, result: ResultRecord) -> Result<(), QueueError> {
            self.inner.publish(result).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_outage_is_retried_without_losing_the_request() {
        let queue = FlakyQueue {
            inner: MemoryQueue::new(),
            failures_left: AtomicUsize::new(3),
        };
        let cancels = CancelRegistry::new();
        let req = request();
        let id = req.id();
        queue.enqueue(req).await.unwrap();

        let out = form_batch(&queue, &config(1, 100), &running(), &cancels).await;
        let batch = out.batch.expect("the request should survive the outage");
        assert!(batch.contains(id));
    }
}
