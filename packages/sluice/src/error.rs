// error types.

use std::{
    any::Any,
    fmt::{self, Debug, Display, Formatter},
};
use thiserror::Error;


// ==== base error types ====


/// Error for trying to use the ambient tokio runtime from outside of one
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[error("no tokio runtime is available on this thread")]
pub struct NoRuntimeError;

/// Failure raised by user-supplied handler or unit logic
///
/// Wraps either the error the handler returned or the message of a panic that unwound out of it.
/// Panics and returned errors are treated identically for sequencing purposes.
pub struct Fault {
    error: anyhow::Error,
    panicked: bool,
}

impl Fault {
    /// Construct from an error returned by a handler
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Fault { error: error.into(), panicked: false }
    }

    /// Construct from the payload of a caught panic
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(&s) = payload.downcast_ref::<&'static str>() {
            s.to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_owned()
        };
        Fault { error: anyhow::anyhow!("handler panicked: {}", msg), panicked: true }
    }

    /// Whether this fault originated from a panic rather than a returned error
    pub fn is_panic(&self) -> bool {
        self.panicked
    }

    /// The underlying error
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// Unwrap into the underlying error
    pub fn into_error(self) -> anyhow::Error {
        self.error
    }
}

impl Debug for Fault {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Fault")
            .field("error", &self.error)
            .field("panicked", &self.panicked)
            .finish()
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.error, f)
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}


// ==== compound error types ====


/// Error for trying to construct a dispatcher or serial queue with invalid configuration
///
/// Construction fails fast: no partially configured object is ever returned.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ConstructionError {
    /// The maximum degree of parallelism was zero
    #[error("max parallelism must be at least 1")]
    ZeroParallelism,
    /// The maximum number of items per scheduled drain was zero
    #[error("max items per task must be at least 1")]
    ZeroItemsPerTask,
    /// No scheduler was given and no ambient tokio runtime exists
    #[error(transparent)]
    NoRuntime(#[from] NoRuntimeError),
}

/// Non-successful outcome of a [`Task`](crate::Task)
#[derive(Error, Debug)]
pub enum TaskError {
    /// The unit raised a fault
    #[error("task faulted: {0}")]
    Faulted(#[from] Fault),
    /// The unit was cancelled before it could produce a value
    #[error("task was cancelled")]
    Canceled,
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        TaskError::Faulted(Fault::new(error))
    }
}

impl TaskError {
    /// Whether this is the cancelled outcome
    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }

    /// Whether this is the faulted outcome
    pub fn is_faulted(&self) -> bool {
        matches!(self, TaskError::Faulted(_))
    }

    /// If faulted, get the fault
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            TaskError::Faulted(fault) => Some(fault),
            TaskError::Canceled => None,
        }
    }
}
