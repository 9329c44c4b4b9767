use std::fmt;

use crate::trace::EventId;

/// Misuse of a [`Basis`][crate::Basis] or a malformed trace.
///
/// All functions of this crate return [`anyhow::Error`]. Errors that
/// originate from the basis itself carry a `BasisError`, which can be
/// recovered with [`anyhow::Error::downcast_ref`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasisError {
    /// A trace element could not be attributed to a thread
    InvalidTrace { event: EventId, reason: String },

    /// The basis already has a topology root
    AlreadySet,

    /// No process matches the requested identity or index
    NotFound(String),

    /// A process without events was handed to the basis
    EmptyProcess(usize),

    /// A cursor was dereferenced or moved outside of the event space
    OutOfRange { process: usize, event: usize },
}

impl fmt::Display for BasisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BasisError::InvalidTrace { event, reason } => {
                write!(f, "Invalid trace at event {}: {reason}", event.0)
            }
            BasisError::AlreadySet => write!(f, "Basis already has a topology root"),
            BasisError::NotFound(what) => write!(f, "Basis has no process {what}"),
            BasisError::EmptyProcess(idx) => write!(f, "Process {idx} has no events"),
            BasisError::OutOfRange { process, event } => {
                write!(f, "Cursor ({process}, {event}) is outside of the event space")
            }
        }
    }
}

impl std::error::Error for BasisError {}
