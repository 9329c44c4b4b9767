//! Scheduling interception for the cooperative execution of a
//! multithreaded program.
//!
//! Only one simulated thread commits instructions at a time. Before a
//! potentially blocking instruction (a join or a mutex lock) is committed,
//! the [`Interceptor`] decides whether the thread may proceed or has to be
//! deferred until the thread it joins terminates or the mutex it wants is
//! released. Accepted operations are forwarded to a [`TraceBuilder`],
//! usually a [`TraceRecorder`].

/// Scheduling decisions and hooks of the executor
pub mod intercept;

/// Recording of executed operations into a trace
pub mod recorder;

/// Runtime state of simulated threads and mutexes
pub mod tmgmt;

pub use intercept::{BlockingInstruction, Interceptor, TraceBuilder};
pub use recorder::TraceRecorder;
pub use tmgmt::{MutexState, SchedulerState, ThreadState, WakePolicy};
