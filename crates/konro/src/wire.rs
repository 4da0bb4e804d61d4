//! Wire-level records exchanged with queue backends and result consumers.
//!
//! Two shapes cross the process boundary: [`QueueRecord`], the pending-work
//! record a producer writes into the queue, and [`ResultRecord`], the terminal
//! outcome the dispatcher writes back exactly once per request id. Payloads
//! travel base64-encoded; timestamps are unix epoch milliseconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;
use crate::error::DispatchError;
use crate::request::Request;

/// Pending-work record as stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: Uuid,
    #[serde(with = "b64")]
    pub payload: Bytes,
    /// Unix epoch milliseconds.
    pub enqueued_at: u64,
    /// Unix epoch milliseconds, absent for requests without a deadline.
    pub deadline: Option<u64>,
}

impl QueueRecord {
    /// Converts a wire record into an owned [`Request`].
    ///
    /// The epoch-millisecond deadline is mapped onto the monotonic clock
    /// relative to now; a deadline already in the past maps to an instant
    /// that has already elapsed, so the formation loop expires the request
    /// on sight.
    pub fn into_request(self) -> Request {
        let now_wall = SystemTime::now();
        let now = Instant::now();
        let deadline = self.deadline.map(|ms| {
            let at = UNIX_EPOCH + Duration::from_millis(ms);
            match at.duration_since(now_wall) {
                Ok(remaining) => now + remaining,
                Err(_) => now,
            }
        });
        Request::from_parts(
            self.id,
            self.payload,
            UNIX_EPOCH + Duration::from_millis(self.enqueued_at),
            deadline,
        )
    }

    /// Captures a request back into wire form, with the deadline translated
    /// from the monotonic clock to epoch milliseconds.
    pub fn from_request(request: &Request) -> Self {
        let now_wall = SystemTime::now();
        let now = Instant::now();
        let deadline = request.deadline().map(|d| {
            let at = now_wall + d.saturating_duration_since(now);
            epoch_ms(at)
        });
        Self {
            id: request.id(),
            payload: request.payload().clone(),
            enqueued_at: epoch_ms(request.enqueued_at()),
            deadline,
        }
    }
}

/// Terminal status of a request, as published to result consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ok,
    Error,
    Expired,
    Cancelled,
}

/// Terminal outcome record, written at most once per request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: Uuid,
    pub status: ResultStatus,
    #[serde(with = "opt_b64", default)]
    pub payload: Option<Bytes>,
    pub error: Option<String>,
    /// Unix epoch milliseconds.
    pub completed_at: u64,
}

impl ResultRecord {
    /// Successful completion carrying the executor's output payload.
    pub fn ok(id: Uuid, payload: Bytes) -> Self {
        Self {
            id,
            status: ResultStatus::Ok,
            payload: Some(payload),
            error: None,
            completed_at: epoch_ms(SystemTime::now()),
        }
    }

    /// Terminal fault, mapped onto the wire status taxonomy.
    pub fn failed(id: Uuid, cause: DispatchError) -> Self {
        let status = match cause {
            DispatchError::DeadlineExceeded => ResultStatus::Expired,
            DispatchError::Cancelled => ResultStatus::Cancelled,
            DispatchError::Executor(_) => ResultStatus::Error,
        };
        Self {
            id,
            status,
            payload: None,
            error: Some(cause.to_string()),
            completed_at: epoch_ms(SystemTime::now()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }
}

pub(crate) fn epoch_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

mod opt_b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map(Bytes::from))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
