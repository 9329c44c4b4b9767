//! Recorded execution traces and their per-thread partitioning.
//!
//! A [`Trace`] owns the events of one run of a multithreaded program.
//! A [`Basis`] partitions these events into one process per thread and
//! offers an [`EventsCursor`] to walk them, possibly skipping whole
//! processes.

/// The per-thread partitioning of a trace
pub mod basis;

pub mod classify;
mod error;

/// Events and the trace that owns them
pub mod trace;

pub use basis::{Basis, EventsCursor, Processes, ThreadEvent};
pub use classify::{Classifier, OpClassifier};
pub use error::BasisError;
pub use trace::{Cpid, Event, EventId, Fault, Ipid, MemRef, MemScope, Op, Trace};
