//! Bounded asynchronous work dispatch.
//!
//! - [`Dispatcher`]: posts work items to a handler with bounded parallelism, batching, and a
//!   guarantee that no posted item is left stranded.
//! - [`SerialQueue`]: runs units strictly one at a time in submission order.
//! - [`delay`]: cancellable delayed execution.
//!
//! All of these run their work on a pluggable [`Scheduler`](scheduler::Scheduler), which
//! defaults to the current tokio runtime, and report outcomes through [`Task`]s.

#[macro_use]
extern crate tracing;

mod dispatcher;
mod serial;
mod work_queue;

pub mod cancel;
pub mod delay;
pub mod scheduler;
pub mod task;

pub use crate::{
    cancel::CancellationToken,
    dispatcher::api::*,
    serial::SerialQueue,
    task::{Status, Task},
};

/// Error types
pub mod error;
