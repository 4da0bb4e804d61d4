//! Continuous execution.
//!
//! The bridge hands an admitted batch to the executor, then forgets the
//! batch: from that point every request lives and dies on its own. A task
//! per dispatched batch consumes the executor's completion stream, settling
//! each id independently as its event arrives (in any order), expiring ids
//! at their own deadlines, and failing whatever the executor abandons. While
//! that task runs, the formation loop is already assembling the next batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;
use crate::batch::Batch;
use crate::error::DispatchError;
use crate::executor::{Completion, CompletionStream, Executor, Outcome};
use crate::publisher::ResultPublisher;
use crate::queue::WorkQueue;
use crate::request::{Request, RequestState};
use crate::wire::ResultRecord;

pub(crate) struct ExecutionBridge<Q: WorkQueue, E: Executor> {
    executor: Arc<E>,
    publisher: Arc<ResultPublisher<Q>>,

    /// Requests dispatched but not yet settled, across all in-flight batches.
    /// Shared with the per-batch completion tasks and the cancel path; this
    /// map is the only state those tasks touch concurrently.
    in_flight: Arc<Mutex<HashMap<Uuid, Request>>>,

    cancel_grace: Duration,
}

impl<Q: WorkQueue, E: Executor> ExecutionBridge<Q, E> {
    pub fn new(executor: Arc<E>, publisher: Arc<ResultPublisher<Q>>, cancel_grace: Duration) -> Self {
        Self {
            executor,
            publisher,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            cancel_grace,
        }
    }

    /// Number of dispatched requests still awaiting a terminal event.
    #[allow(dead_code)]
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Submits a closed batch to the executor and spawns the completion
    /// task for it. Returns as soon as the submission call does, so the
    /// caller can immediately start forming the next batch.
    pub async fn dispatch(&self, mut batch: Batch, admitted: Vec<Request>) {
        batch.mark_dispatched(Instant::now());

        let mut submitted = Vec::with_capacity(admitted.len());
        let mut pending = HashSet::with_capacity(admitted.len());
        {
            let mut map = self.in_flight.lock().await;
            for mut request in admitted {
                if let Err(err) = request.advance(RequestState::Running) {
                    tracing::error!(id = %request.id(), %err,
                        "refusing to dispatch request in unexpected state");
                    continue;
                }
                pending.insert(request.id());
                submitted.push(request.clone());
                map.insert(request.id(), request);
            }
        }
        if submitted.is_empty() {
            return;
        }

        tracing::debug!(size = submitted.len(), "dispatching batch to executor");
        let stream = self.executor.submit(submitted).await;
        tokio::spawn(drive_completions(
            self.in_flight.clone(),
            self.publisher.clone(),
            pending,
            stream,
        ));
    }

    /// Advisory cancellation of a running request.
    ///
    /// Asks the executor to abort, then gives it `cancel_grace` to report a
    /// terminal event on its own. If the grace period lapses with the
    /// request still in flight, it is force-marked cancelled. Returns `false`
    /// if the id is not currently running.
    pub async fn cancel(&self, id: Uuid) -> bool {
        if !self.in_flight.lock().await.contains_key(&id) {
            return false;
        }
        tracing::debug!(id = %id, "asking executor to abort running request");
        self.executor.cancel(id).await;

        let in_flight = self.in_flight.clone();
        let publisher = self.publisher.clone();
        let grace = self.cancel_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let lingering = in_flight.lock().await.remove(&id);
            if let Some(mut request) = lingering {
                tracing::debug!(id = %id, "abort not acknowledged within grace period; force-marking cancelled");
                if let Err(err) = request.advance(RequestState::Failed) {
                    tracing::error!(id = %id, %err, "could not mark request cancelled");
                }
                publisher
                    .publish(ResultRecord::failed(id, DispatchError::Cancelled))
                    .await;
                publisher.forget(id).await;
            }
        });
        true
    }
}

/// Consumes one batch's completion stream until every member is settled.
///
/// A completion settles exactly one id; its batch siblings continue
/// unaffected. An id whose own deadline lapses first is expired right then,
/// and a later completion for it is dropped as a duplicate.
async fn drive_completions<Q: WorkQueue>(
    in_flight: Arc<Mutex<HashMap<Uuid, Request>>>,
    publisher: Arc<ResultPublisher<Q>>,
    mut pending: HashSet<Uuid>,
    mut stream: CompletionStream,
) {
    while !pending.is_empty() {
        let next_deadline = {
            let map = in_flight.lock().await;
            // An id settled elsewhere (force-cancel) no longer holds this
            // task open.
            pending.retain(|id| map.contains_key(id));
            pending
                .iter()
                .filter_map(|id| map.get(id).and_then(|request| request.deadline()))
                .min()
        };
        if pending.is_empty() {
            break;
        }

        tokio::select! {
            completion = stream.next() => match completion {
                Some(completion) => {
                    if pending.remove(&completion.id) {
                        settle(&in_flight, &publisher, completion).await;
                    } else {
                        tracing::debug!(id = %completion.id,
                            "dropping completion for id not pending in this batch");
                    }
                }
                None => {
                    fail_abandoned(&in_flight, &publisher, &mut pending).await;
                }
            },
            _ = sleep_until_next(next_deadline) => {
                expire_overdue(&in_flight, &publisher, &mut pending).await;
            }
        }
    }
}

async fn settle<Q: WorkQueue>(
    in_flight: &Mutex<HashMap<Uuid, Request>>,
    publisher: &ResultPublisher<Q>,
    completion: Completion,
) {
    let Some(mut request) = in_flight.lock().await.remove(&completion.id) else {
        tracing::debug!(id = %completion.id, "completion for already-settled request");
        return;
    };
    let record = match completion.outcome {
        Outcome::Ok(payload) => {
            if let Err(err) = request.advance(RequestState::Completed) {
                tracing::error!(id = %request.id(), %err, "could not complete request");
            }
            ResultRecord::ok(completion.id, payload)
        }
        Outcome::Err(detail) => {
            if let Err(err) = request.advance(RequestState::Failed) {
                tracing::error!(id = %request.id(), %err, "could not fail request");
            }
            ResultRecord::failed(completion.id, DispatchError::Executor(detail))
        }
    };
    publisher.publish(record).await;
    // Removing the id from `in_flight` above means no other path can still
    // publish for it; release the duplicate-screening entry.
    publisher.forget(completion.id).await;
}

/// Expires every pending id whose own deadline has lapsed.
async fn expire_overdue<Q: WorkQueue>(
    in_flight: &Mutex<HashMap<Uuid, Request>>,
    publisher: &ResultPublisher<Q>,
    pending: &mut HashSet<Uuid>,
) {
    let now = Instant::now();
    let mut overdue = Vec::new();
    {
        let mut map = in_flight.lock().await;
        for id in pending.iter() {
            if map.get(id).is_some_and(|request| request.deadline_elapsed(now)) {
                overdue.push(*id);
            }
        }
        for id in &overdue {
            if let Some(mut request) = map.remove(id) {
                if let Err(err) = request.advance(RequestState::Expired) {
                    tracing::error!(id = %id, %err, "could not expire request");
                }
            }
        }
    }
    for id in overdue {
        tracing::debug!(id = %id, "request deadline elapsed while running");
        pending.remove(&id);
        publisher
            .publish(ResultRecord::failed(id, DispatchError::DeadlineExceeded))
            .await;
        publisher.forget(id).await;
    }
}

/// The executor closed the stream with requests unresolved; fail each of
/// them individually.
async fn fail_abandoned<Q: WorkQueue>(
    in_flight: &Mutex<HashMap<Uuid, Request>>,
    publisher: &ResultPublisher<Q>,
    pending: &mut HashSet<Uuid>,
) {
    for id in pending.drain() {
        let abandoned = in_flight.lock().await.remove(&id);
        if let Some(mut request) = abandoned {
            tracing::warn!(id = %id, "completion stream closed before a result");
            if let Err(err) = request.advance(RequestState::Failed) {
                tracing::error!(id = %id, %err, "could not fail abandoned request");
            }
            publisher
                .publish(ResultRecord::failed(
                    id,
                    DispatchError::Executor("completion stream closed before a result".into()),
                ))
                .await;
            publisher.forget(id).await;
        }
    }
}

async fn sleep_until_next(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
