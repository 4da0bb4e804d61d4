use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
use tokio::task::JoinHandle;

/// A handle to the background batch-formation task.
///
/// Owns the running flag the formation loop checks on every poll slice, so
/// the loop observes a shutdown within one slice of it being requested.
/// Dropping the handle initiates a graceful shutdown: the loop closes
/// whatever batch it is forming, dispatches it, and exits; in-flight batches
/// keep executing to their own terminal events.
pub struct DispatchWorkerHandle {
    /// Cleared to stop the formation loop.
    running: Arc<AtomicBool>,

    /// Handle to the spawned loop, taken when shutdown starts.
    handle: Option<JoinHandle<()>>,
}

impl DispatchWorkerHandle {
    /// Spawns the formation loop via `task`, handing it the shared running
    /// flag.
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>) -> JoinHandle<()> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let handle = task(running.clone());

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Whether the formation loop is still accepting work.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Initiates a graceful shutdown: clears the running flag and detaches a
    /// task to await the loop's exit.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            tokio::spawn(async move {
                let _ = handle.await;
            });
        }
    }
}

impl Drop for DispatchWorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time;

    fn poll_loop(running: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
    }

    #[tokio::test]
    async fn worker_starts_running() {
        let worker = DispatchWorkerHandle::new(poll_loop);
        assert!(worker.is_running());
    }

    #[tokio::test]
    async fn shutdown_stops_a_loop_that_only_watches_the_flag() {
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();

        let mut worker = DispatchWorkerHandle::new(move |running| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    time::sleep(Duration::from_millis(5)).await;
                }
                stopped_clone.store(true, Ordering::SeqCst);
            })
        });

        worker.shutdown();
        time::sleep(Duration::from_millis(50)).await;

        assert!(!worker.is_running());
        assert!(
            stopped.load(Ordering::SeqCst),
            "the cleared flag alone should stop the loop within a poll slice"
        );
        assert!(worker.handle.is_none());
    }

    #[tokio::test]
    async fn drop_triggers_shutdown() {
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();

        {
            let _worker = DispatchWorkerHandle::new(move |running| {
                tokio::spawn(async move {
                    while running.load(Ordering::SeqCst) {
                        time::sleep(Duration::from_millis(5)).await;
                    }
                    stopped_clone.store(true, Ordering::SeqCst);
                })
            });
        }

        time::sleep(Duration::from_millis(50)).await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn repeated_shutdown_is_harmless() {
        let mut worker = DispatchWorkerHandle::new(poll_loop);
        worker.shutdown();
        worker.shutdown();
        assert!(!worker.is_running());
    }
}
