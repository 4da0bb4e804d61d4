use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use bytes::Bytes;
use tokio::time::Instant;
use uuid::Uuid;
use crate::batch::form_batch;
use crate::bridge::ExecutionBridge;
use crate::cancel::CancelRegistry;
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Error};
use crate::executor::Executor;
use crate::publisher::ResultPublisher;
use crate::queue::WorkQueue;
use crate::request::Request;
use crate::ticket::Ticket;
use crate::wire::ResultRecord;
use crate::worker::DispatchWorkerHandle;

/// # Dispatcher
///
/// The assembled micro-batching pipeline: queue adapter in, executor out.
///
/// Construction spawns the batch-formation loop as a background worker. The
/// loop is the sole owner of admission decisions; each closed batch is handed
/// to the execution bridge, which completes requests independently while the
/// loop immediately starts forming the next batch. Dropping the dispatcher
/// shuts the worker down gracefully; batches already dispatched keep
/// executing to their own terminal events.
pub struct Dispatcher<Q: WorkQueue, E: Executor> {
    queue: Arc<Q>,
    publisher: Arc<ResultPublisher<Q>>,
    cancels: Arc<CancelRegistry>,
    bridge: Arc<ExecutionBridge<Q, E>>,
    config: DispatcherConfig,
    handle: DispatchWorkerHandle,
}

impl<Q: WorkQueue, E: Executor> Dispatcher<Q, E> {
    /// Validates the configuration and starts the formation loop.
    pub fn new(queue: Q, executor: E, config: DispatcherConfig) -> Result<Self, Error> {
        config.validate()?;

        let queue = Arc::new(queue);
        let publisher = Arc::new(ResultPublisher::new(queue.clone()));
        let cancels = Arc::new(CancelRegistry::new());
        let bridge = Arc::new(ExecutionBridge::new(
            Arc::new(executor),
            publisher.clone(),
            config.cancel_grace(),
        ));

        let handle = DispatchWorkerHandle::new({
            let queue = queue.clone();
            let publisher = publisher.clone();
            let cancels = cancels.clone();
            let bridge = bridge.clone();
            let config = config.clone();

            move |running| {
                tokio::spawn(async move {
                    dispatch_loop(queue, config, running, cancels, bridge, publisher).await;
                })
            }
        });

        Ok(Self {
            queue,
            publisher,
            cancels,
            bridge,
            config,
            handle,
        })
    }

    /// Submits a payload with the configured default deadline.
    ///
    /// Returns a [`Ticket`] resolving to the request's terminal
    /// [`ResultRecord`]; the request id is available on the ticket for
    /// cancellation.
    pub async fn submit(&self, payload: Bytes) -> Result<Ticket, Error> {
        self.submit_with_deadline(payload, Some(self.config.request_deadline()))
            .await
    }

    /// Submits a payload with an explicit completion deadline, or none.
    pub async fn submit_with_deadline(
        &self,
        payload: Bytes,
        deadline: Option<Duration>,
    ) -> Result<Ticket, Error> {
        if !self.handle.is_running() {
            return Err(Error::Shutdown);
        }
        let request = Request::new(payload, deadline.map(|d| Instant::now() + d));
        // Registration precedes the enqueue so a request that is dequeued and
        // settled immediately still finds its ticket.
        let ticket = self.publisher.register(request.id()).await;
        if let Err(err) = self.queue.enqueue(request).await {
            self.publisher.unregister(ticket.id()).await;
            return Err(err.into());
        }
        Ok(ticket)
    }

    /// Cancels a request.
    ///
    /// A request that is already running gets an advisory abort with a
    /// bounded grace period; one still queued or under admission is removed
    /// before dispatch and never reaches the executor. Either way the
    /// request's single result carries status `cancelled` (unless the
    /// executor's own terminal event wins the race).
    ///
    /// An id with no result still pending, one already settled or never
    /// submitted here, is ignored, so cancellation leaves no mark behind.
    pub async fn cancel(&self, id: Uuid) {
        if self.bridge.cancel(id).await {
            // A mark placed while the request was still queued can no longer
            // be consumed by the formation loop.
            self.cancels.take(id).await;
            return;
        }
        if !self.publisher.awaiting_result(id).await {
            return;
        }
        self.cancels.mark(id).await;
        // The batch under formation may have been dispatched between the
        // first check and the mark; retry the running path once so the
        // cancellation is not stranded on an id the loop never screens again.
        if self.bridge.cancel(id).await || !self.publisher.awaiting_result(id).await {
            self.cancels.take(id).await;
        }
    }

    /// The queue this dispatcher pulls from and publishes to.
    pub fn queue(&self) -> Arc<Q> {
        self.queue.clone()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Stops the formation loop. In-flight batches are unaffected.
    pub fn shutdown(&mut self) {
        self.handle.shutdown();
    }
}

/// The batch-formation loop: one cycle per batch, publishing the terminal
/// results of requests screened out before dispatch, then handing the batch
/// to the bridge. Dispatch returns as soon as the executor accepts the
/// batch, so admission of batch N+1 overlaps execution of batch N.
async fn dispatch_loop<Q: WorkQueue, E: Executor>(
    queue: Arc<Q>,
    config: DispatcherConfig,
    running: Arc<AtomicBool>,
    cancels: Arc<CancelRegistry>,
    bridge: Arc<ExecutionBridge<Q, E>>,
    publisher: Arc<ResultPublisher<Q>>,
) {
    tracing::info!(
        max_batch_size = config.max_batch_size,
        max_wait_ms = config.max_wait_ms,
        "dispatch loop started"
    );
    loop {
        let outcome = form_batch(&*queue, &config, &running, &cancels).await;

        // Screened-out requests were never dispatched, so no other path can
        // publish for them; release each id right after its result lands.
        for request in outcome.expired {
            let id = request.id();
            publisher
                .publish(ResultRecord::failed(id, DispatchError::DeadlineExceeded))
                .await;
            publisher.forget(id).await;
        }
        for request in outcome.cancelled {
            let id = request.id();
            publisher
                .publish(ResultRecord::failed(id, DispatchError::Cancelled))
                .await;
            publisher.forget(id).await;
        }

        // A batch closed by shutdown is still dispatched before the loop
        // exits; only then does the flag end the loop.
        if let Some(batch) = outcome.batch {
            if !outcome.admitted.is_empty() {
                bridge.dispatch(batch, outcome.admitted).await;
            }
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
    }
    tracing::info!("dispatch loop stopped");
}
