use std::time::SystemTime;
use bytes::Bytes;
use tokio::time::Instant;
use uuid::Uuid;
use crate::error::Error;

/// # RequestState
///
/// Lifecycle of a request from enqueue to result publication.
///
/// States advance in the strict order
/// `Queued → Admitted → Running → {Completed | Failed | Expired}`.
/// Two shortcuts exist and nothing else: a request whose deadline has already
/// elapsed when the formation loop sees it goes straight from `Queued` to
/// `Expired`, and a request cancelled before dispatch goes from `Queued` or
/// `Admitted` to `Failed`. No state is ever revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting in the work queue; not yet seen by the formation loop.
    Queued,

    /// Chosen for the batch currently under formation.
    Admitted,

    /// Dispatched to the executor as part of a batch.
    Running,

    /// The executor produced a successful result.
    Completed,

    /// Terminal fault: executor error or cancellation.
    Failed,

    /// The request's own deadline elapsed before a result was produced.
    Expired,
}

impl RequestState {
    /// Whether this state may legally advance to `next`.
    pub fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Queued, Admitted)
                | (Queued, Expired)
                | (Queued, Failed)
                | (Admitted, Running)
                | (Admitted, Expired)
                | (Admitted, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Expired)
        )
    }

    /// Whether this state is terminal (a result has been, or is about to be,
    /// published for the request).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Expired
        )
    }
}

/// # Request
///
/// A single unit of inference work, owned by the dispatcher from enqueue
/// until a terminal state is reached.
///
/// The payload is opaque to the dispatcher; only the executor interprets it.
/// The deadline, when present, is the request's *own* completion deadline:
/// it is independent of any batch the request is grouped into, and it keeps
/// ticking while the request waits in the admission window.
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique identifier; also the idempotency key for result publication.
    id: Uuid,

    /// Opaque work payload handed to the executor.
    payload: Bytes,

    /// Wall-clock time the request entered the queue.
    enqueued_at: SystemTime,

    /// Latest monotonic instant by which the request must complete.
    deadline: Option<Instant>,

    /// Current lifecycle state.
    state: RequestState,
}

impl Request {
    /// Creates a new `Queued` request with a freshly generated id.
    pub fn new(payload: Bytes, deadline: Option<Instant>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: SystemTime::now(),
            deadline,
            state: RequestState::Queued,
        }
    }

    /// Rebuilds a request from parts recovered off the wire.
    pub(crate) fn from_parts(
        id: Uuid,
        payload: Bytes,
        enqueued_at: SystemTime,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            id,
            payload,
            enqueued_at,
            deadline,
            state: RequestState::Queued,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn enqueued_at(&self) -> SystemTime {
        self.enqueued_at
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Whether the request's deadline has elapsed as of `now`.
    pub fn deadline_elapsed(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Advances the lifecycle state, enforcing the strict transition order.
    pub fn advance(&mut self, next: RequestState) -> Result<(), Error> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}
