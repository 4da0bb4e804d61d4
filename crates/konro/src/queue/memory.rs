use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use crate::error::QueueError;
use crate::request::Request;
use crate::wire::ResultRecord;
use super::WorkQueue;

/// # MemoryQueue
///
/// In-process [`WorkQueue`] backed by an unbounded channel.
///
/// This is the backend used when the dispatcher is embedded directly in the
/// serving process (and by the crate's own tests). Published results are
/// retained in insertion order and can be inspected through
/// [`MemoryQueue::published`]; a durable backend would write them to its own
/// result store instead.
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<Request>,
    /// Single-consumer receiver, locked for the duration of each dequeue.
    rx: Mutex<mpsc::UnboundedReceiver<Request>>,
    results: Mutex<Vec<ResultRecord>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of every result published so far, in publication order.
    pub async fn published(&self) -> Vec<ResultRecord> {
        self.results.lock().await.clone()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, request: Request) -> Result<(), QueueError> {
        self.tx
            .send(request)
            .map_err(|_| QueueError::Unavailable("queue receiver dropped".into()))
    }

    async fn dequeue(&self, max_wait: Duration) -> Result<Option<Request>, QueueError> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(max_wait, rx.recv()).await {
            Ok(Some(request)) => Ok(Some(request)),
            // All senders dropped; nothing will ever arrive again, but from
            // the consumer's view this is indistinguishable from an idle
            // queue.
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn publish(&self, result: ResultRecord) -> Result<(), QueueError> {
        self.results.lock().await.push(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use uuid::Uuid;

    fn request(tag: &'static [u8]) -> Request {
        Request::new(Bytes::from_static(tag), None)
    }

    #[tokio::test]
    async fn dequeue_returns_requests_in_fifo_order() {
        let queue = MemoryQueue::new();
        let first = request(b"first");
        let second = request(b"second");
        let first_id = first.id();
        let second_id = second.id();

        queue.enqueue(first).await.unwrap();
        queue.enqueue(second).await.unwrap();

        let out1 = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        let out2 = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(out1.id(), first_id);
        assert_eq!(out2.id(), second_id);
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_times_out_with_none_on_an_empty_queue() {
        let queue = MemoryQueue::new();
        let out = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        assert!(out.is_none(), "timeout is a normal outcome, not an error");
    }

    #[tokio::test]
    async fn concurrent_producers_each_land_exactly_once() {
        let queue = std::sync::Arc::new(MemoryQueue::new());

        let mut handles = vec![];
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    queue.enqueue(request(b"p")).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let req = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
            assert!(seen.insert(req.id()), "no request should be delivered twice");
        }
        assert!(queue.dequeue(Duration::from_millis(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn published_results_are_retained_in_order() {
        let queue = MemoryQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.publish(ResultRecord::ok(a, Bytes::new())).await.unwrap();
        queue.publish(ResultRecord::ok(b, Bytes::new())).await.unwrap();

        let results = queue.published().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, a);
        assert_eq!(results[1].id, b);
    }
}
