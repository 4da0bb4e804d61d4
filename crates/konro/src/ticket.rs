use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use uuid::Uuid;
use crate::wire::ResultRecord;

/// # Ticket
///
/// A future resolving to the terminal [`ResultRecord`] of one submitted
/// request.
///
/// Returned by [`Dispatcher::submit`](crate::Dispatcher::submit); backed by a
/// oneshot channel that the result publisher fires on the request's single
/// terminal transition. Resolves to `Err(RecvError)` only if the dispatcher
/// is torn down before the request reaches a terminal state.
pub struct Ticket {
    id: Uuid,
    receiver: oneshot::Receiver<ResultRecord>,
}

impl Ticket {
    pub(crate) fn new(id: Uuid, receiver: oneshot::Receiver<ResultRecord>) -> Self {
        Self { id, receiver }
    }

    /// Id of the request this ticket tracks, usable for cancellation.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for Ticket {
    type Output = Result<ResultRecord, oneshot::error::RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver).poll(cx)
    }
}
