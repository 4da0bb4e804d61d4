//! # Konro
//!
//! A **continuous micro-batching dispatcher** for asynchronous inference
//! workloads: requests stream in, get grouped into batches bounded by size
//! and wait time, and each request's result is released independently the
//! moment it is ready. No request waits for its batch siblings.
//!
//! ## Overview
//!
//! Static batching ties a request's fate to its batch: the slowest member
//! gates everyone's results. Continuous (rolling) batching decouples the
//! two. Here the batch is only an *admission* construct (a transient set of
//! request ids handed to the executor in a single call), while completion,
//! deadlines, cancellation, and result delivery are all per request.
//!
//! The pipeline has four collaborators:
//!
//! - A [`WorkQueue`] adapter the dispatcher pulls pending requests from and
//!   publishes results back to. [`MemoryQueue`] ships for in-process use;
//!   durable backends implement the same trait.
//! - The batch formation engine: one loop that owns admission, closing each
//!   batch on whichever fires first of the size cap and the wait window.
//! - The continuous execution bridge: submits each closed batch to an
//!   [`Executor`] and consumes its out-of-order [`Completion`] stream,
//!   settling every request on its own.
//! - The result publisher: writes exactly one result per request id,
//!   idempotent against duplicate terminal events.
//!
//! Admission and execution are pipelined: while batch N runs, batch N+1 is
//! already forming. That overlap is what makes the batching "continuous".
//!
//! ## Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use konro::{Dispatcher, DispatcherConfig, MemoryQueue};
//!
//! # async fn example(engine: impl konro::Executor) -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::new(
//!     MemoryQueue::new(),
//!     engine,
//!     DispatcherConfig {
//!         max_batch_size: 8,
//!         max_wait_ms: 50,
//!         ..Default::default()
//!     },
//! )?;
//!
//! let ticket = dispatcher.submit(Bytes::from_static(b"prompt")).await?;
//! let result = ticket.await?;
//! assert!(result.is_ok());
//! # Ok(())
//! # }
//! ```
//!
//! ## What this crate is not
//!
//! The inference engine itself (tensor execution, KV-cache management, GPU
//! scheduling) lives behind the [`Executor`] trait, along with all of its
//! tuning knobs. Queue durability and replay-on-restart live behind
//! [`WorkQueue`]. The dispatcher owns nothing but admission, per-request
//! lifecycle, and exactly-once result publication.

mod batch;
mod bridge;
mod cancel;
mod config;
mod dispatcher;
mod error;
mod executor;
mod publisher;
mod queue;
mod request;
mod ticket;
mod wire;
mod worker;

pub use batch::Batch;
pub use config::DispatcherConfig;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Error, QueueError};
pub use executor::{Completion, CompletionSender, CompletionStream, Executor, Outcome};
pub use publisher::ResultPublisher;
pub use queue::{MemoryQueue, WorkQueue};
pub use request::{Request, RequestState};
pub use ticket::Ticket;
pub use wire::{QueueRecord, ResultRecord, ResultStatus};
pub use worker::DispatchWorkerHandle;
