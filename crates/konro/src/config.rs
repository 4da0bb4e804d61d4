use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::Error;

/// Tuning knobs for the dispatcher.
///
/// The two load-bearing knobs are `max_batch_size` and `max_wait_ms`: together
/// they set the throughput/latency tradeoff. A batch under formation closes as
/// soon as either the size cap is hit or `max_wait_ms` has elapsed since the
/// first request was admitted into it, whichever comes first.
///
/// All durations are plain integer milliseconds so the struct round-trips
/// cleanly through JSON/TOML configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on the number of requests admitted into one batch.
    /// Should reflect the capacity of the downstream executor.
    pub max_batch_size: usize,

    /// Longest a non-empty batch may stay open, measured from the admission
    /// of its first request. `0` dispatches singles immediately.
    pub max_wait_ms: u64,

    /// Granularity of the blocking dequeue check. Bounds how quickly the
    /// formation loop observes shutdown and queue recovery.
    pub queue_poll_interval_ms: u64,

    /// Default per-request completion deadline applied when the caller does
    /// not supply one.
    pub request_deadline_ms: u64,

    /// How long to wait for the executor to acknowledge an advisory abort of
    /// a running request before force-marking it cancelled.
    pub cancel_grace_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            max_wait_ms: 100,
            queue_poll_interval_ms: 10,
            request_deadline_ms: 30_000,
            cancel_grace_ms: 50,
        }
    }
}

impl DispatcherConfig {
    /// Checks the configuration for values that would wedge the formation
    /// loop.
    ///
    /// `max_wait_ms` of zero is valid (immediate single dispatch); a zero
    /// batch size or poll interval is not.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "max_batch_size must be at least 1".into(),
            ));
        }
        if self.queue_poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "queue_poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub(crate) fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub(crate) fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub(crate) fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
