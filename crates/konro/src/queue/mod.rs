//! Work queue abstraction.
//!
//! The dispatcher does not care where requests come from or where results go;
//! it pulls pending work through [`WorkQueue`] and pushes terminal results
//! back through the same trait. Durability, replay-on-restart, and
//! exactly-one-claim delivery across multiple consumer loops are the
//! backend's concern, not the dispatcher's.

mod memory;

use std::time::Duration;
use async_trait::async_trait;
use crate::error::QueueError;
use crate::request::Request;
use crate::wire::ResultRecord;

pub use memory::MemoryQueue;

/// A source of pending requests and a sink for their results.
///
/// Implementations must be safe for concurrent producers and a single
/// consumer loop. If a deployment runs multiple consumer loops, the backend
/// must guarantee each request is claimed by exactly one of them (an
/// at-least-once claim is acceptable as long as redelivery is guarded by the
/// request id; result publication is idempotent on that key).
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Adds a request to the tail of the queue.
    async fn enqueue(&self, request: Request) -> Result<(), QueueError>;

    /// Removes and returns the next pending request, blocking up to
    /// `max_wait`.
    ///
    /// `Ok(None)` on timeout is a normal, expected outcome: the formation
    /// loop polls in bounded slices so it can observe shutdown. Only genuine
    /// backend faults are errors.
    async fn dequeue(&self, max_wait: Duration) -> Result<Option<Request>, QueueError>;

    /// Writes a terminal result back for the originating caller.
    async fn publish(&self, result: ResultRecord) -> Result<(), QueueError>;
}
