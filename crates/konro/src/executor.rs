use std::pin::Pin;
use std::task::{Context, Poll};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use uuid::Uuid;
use crate::request::Request;

/// Per-request outcome reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request finished; the payload is its result.
    Ok(Bytes),
    /// The executor failed this request. The detail string is surfaced in
    /// the published result; sibling requests are unaffected.
    Err(String),
}

/// A single completion event for one request in a submitted batch.
#[derive(Debug, Clone)]
pub struct Completion {
    pub id: Uuid,
    pub outcome: Outcome,
}

impl Completion {
    pub fn ok(id: Uuid, payload: Bytes) -> Self {
        Self {
            id,
            outcome: Outcome::Ok(payload),
        }
    }

    pub fn err(id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Err(detail.into()),
        }
    }
}

/// Sending half of a [`CompletionStream`], handed out by
/// [`CompletionStream::channel`] for executor implementations to report
/// completions on.
pub type CompletionSender = mpsc::UnboundedSender<Completion>;

/// # CompletionStream
///
/// Asynchronous stream of per-request completions for one submitted batch.
///
/// Completions may arrive in any order and at any time. This is what models
/// engines that interleave generation across requests in flight and release
/// finished sequences early. The stream ends (`None`) when the executor has
/// nothing further to report for the batch; any request still unresolved at
/// that point is failed by the execution bridge.
pub struct CompletionStream {
    receiver: mpsc::UnboundedReceiver<Completion>,
}

impl CompletionStream {
    /// Creates a connected sender/stream pair.
    ///
    /// The typical executor implementation spawns its own task, moves the
    /// sender into it, and returns the stream from
    /// [`Executor::submit`]. Dropping the sender ends the stream.
    pub fn channel() -> (CompletionSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { receiver: rx })
    }
}

impl Stream for CompletionStream {
    type Item = Completion;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_recv(cx)
    }
}

/// Downstream inference engine boundary.
///
/// The dispatcher submits a whole admitted batch in one call but expects
/// completions per request, not a joint batch response. Engine-internal
/// tuning (scheduling ratios, preemption, KV-cache policy) lives behind this
/// trait and is deliberately not modeled here.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Hands one admitted batch to the engine.
    ///
    /// The returned stream must eventually yield exactly one [`Completion`]
    /// per submitted request id, unless the bridge expires or cancels the
    /// request first. Extra completions for an already-settled id are
    /// tolerated and dropped.
    async fn submit(&self, batch: Vec<Request>) -> CompletionStream;

    /// Advisory abort of a single running request.
    ///
    /// Best effort: the bridge does not wait for acknowledgment beyond a
    /// short grace period. The default implementation ignores the hint.
    async fn cancel(&self, id: Uuid) {
        let _ = id;
    }
}
