//! Deferred results.
//!
//! A [`Task`] is the consumer half of a one-shot result slot, and a [`Completer`] is the producer
//! half. The task resolves to `Ok` with the unit's value, to [`TaskError::Faulted`] if the unit
//! raised a fault, or to [`TaskError::Canceled`] if the unit was cancelled, including the case
//! where the completer is dropped without ever being completed.
//!
//! Since `Task` is an ordinary [`Future`], continuations are chained with
//! [`futures::FutureExt::then`] or by awaiting it.

use crate::error::{Fault, TaskError};
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{
            Ordering::{Acquire, Release},
            AtomicU8,
        },
        Arc,
    },
    task::{Context, Poll},
};
use futures::FutureExt;
use tokio::sync::oneshot;


/// Observable state of a [`Task`]
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Status {
    /// The unit has not yet finished
    Running,
    /// The unit finished successfully
    Completed,
    /// The unit raised a fault
    Faulted,
    /// The unit was cancelled
    Canceled,
}

impl Status {
    fn from_byte(byte: u8) -> Self {
        if byte == Status::Running as u8 {
            Status::Running
        } else if byte == Status::Completed as u8 {
            Status::Completed
        } else if byte == Status::Faulted as u8 {
            Status::Faulted
        } else if byte == Status::Canceled as u8 {
            Status::Canceled
        } else {
            unreachable!("invalid status byte: {}", byte)
        }
    }

    fn of<T>(result: &Result<T, TaskError>) -> Self {
        match result {
            Ok(_) => Status::Completed,
            Err(TaskError::Faulted(_)) => Status::Faulted,
            Err(TaskError::Canceled) => Status::Canceled,
        }
    }
}

/// Create a connected completer and task pair
pub fn pair<T>() -> (Completer<T>, Task<T>) {
    let (tx, rx) = oneshot::channel();
    let status = Arc::new(AtomicU8::new(Status::Running as u8));
    let completer = Completer { tx: Some(tx), status: Arc::clone(&status) };
    let task = Task { rx, status };
    (completer, task)
}

/// Producer half of a [`Task`]
///
/// Dropping a completer without calling [`complete`](Self::complete) resolves its task as
/// cancelled.
pub struct Completer<T> {
    // some until completed.
    tx: Option<oneshot::Sender<Result<T, TaskError>>>,
    status: Arc<AtomicU8>,
}

impl<T> Completer<T> {
    /// Resolve the task with the given result
    pub fn complete(mut self, result: Result<T, TaskError>) {
        self.complete_inner(result);
    }

    /// Resolve the task as cancelled
    pub fn cancel(self) {
        self.complete(Err(TaskError::Canceled));
    }

    // status is stored before sending so that a task that observes its output also observes the
    // matching status.
    fn complete_inner(&mut self, result: Result<T, TaskError>) {
        if let Some(tx) = self.tx.take() {
            self.status.store(Status::of(&result) as u8, Release);
            // the task may have been dropped, which is fine.
            let _ = tx.send(result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.complete_inner(Err(TaskError::Canceled));
    }
}

/// Handle to the eventual outcome of a unit of work
///
/// Resolves to `Ok(value)` on success, or to a [`TaskError`] if the unit faulted or was
/// cancelled. The outcome can also be inspected without awaiting, via [`status`](Self::status).
pub struct Task<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
    status: Arc<AtomicU8>,
}

impl<T> Task<T> {
    /// Construct an already-resolved task
    pub fn ready(result: Result<T, TaskError>) -> Self {
        let (completer, task) = pair();
        completer.complete(result);
        task
    }

    /// Current status of the unit behind this task
    pub fn status(&self) -> Status {
        Status::from_byte(self.status.load(Acquire))
    }

    /// Whether the unit finished successfully
    pub fn is_completed(&self) -> bool {
        self.status() == Status::Completed
    }

    /// Whether the unit raised a fault
    pub fn is_faulted(&self) -> bool {
        self.status() == Status::Faulted
    }

    /// Whether the unit was cancelled
    pub fn is_canceled(&self) -> bool {
        self.status() == Status::Canceled
    }

    /// Whether the unit has reached any of the terminal states
    pub fn is_finished(&self) -> bool {
        self.status() != Status::Running
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(TaskError::Canceled)))
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.status())
            .finish()
    }
}


// ==== running units ====


// drive a unit to completion, converting both returned errors and panics into task errors.
pub(crate) async fn run_unit<T, E, F>(unit: F) -> Result<T, TaskError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<TaskError>,
{
    match AssertUnwindSafe(unit).catch_unwind().await {
        Ok(result) => result.map_err(Into::into),
        Err(payload) => Err(Fault::from_panic(payload).into()),
    }
}

// like run_unit, for a lazily constructed unit. a panic in the factory counts as a fault of the
// unit.
pub(crate) async fn run_factory<T, E, F, G>(factory: G) -> Result<T, TaskError>
where
    G: FnOnce() -> F,
    F: Future<Output = Result<T, E>>,
    E: Into<TaskError>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(factory)) {
        Ok(unit) => run_unit(unit).await,
        Err(payload) => Err(Fault::from_panic(payload).into()),
    }
}
