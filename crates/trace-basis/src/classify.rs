//! Classification of recorded operations.
//!
//! Exploration needs to know what kind of operation an event stands for,
//! e.g. to decide whether two events of different threads may be
//! reordered. The [`Classifier`] trait answers these questions;
//! [`OpClassifier`] does so based on the recorded [`Op`] alone.

use crate::trace::{Event, MemScope, Op};

/// Answers what kind of operation an event represents.
pub trait Classifier {
    fn is_read(&self, event: &Event) -> bool;
    fn is_write(&self, event: &Event) -> bool;
    fn is_lock(&self, event: &Event) -> bool;
    fn is_unlock(&self, event: &Event) -> bool;
    fn is_join(&self, event: &Event) -> bool;
    fn is_thread_create(&self, event: &Event) -> bool;

    /// A read of memory that is not private to the reading thread.
    fn is_global_read(&self, event: &Event) -> bool;

    /// Returns `true` if `a` and `b` are executed by different threads and
    /// the outcome of the run may depend on their relative order.
    ///
    /// This is the case if both access overlapping memory and at least
    /// one of them writes, or if both operate on the same mutex.
    fn is_dependent(&self, a: &Event, b: &Event) -> bool {
        if a.ipid == b.ipid {
            return false;
        }

        if let (Some(mx), Some(my)) = (a.op.mutex(), b.op.mutex()) {
            return mx == my;
        }

        match (a.op.mref(), b.op.mref()) {
            (Some(rx), Some(ry)) => {
                (self.is_write(a) || self.is_write(b)) && rx.overlaps(ry)
            }
            _ => false,
        }
    }
}

/// A [`Classifier`] that looks at the [`Op`] of an event.
///
/// Acquiring a mutex counts as a read of the mutex and releasing it as a
/// write, so lock operations also show up among the reads and writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpClassifier;

impl Classifier for OpClassifier {
    fn is_read(&self, event: &Event) -> bool {
        matches!(event.op, Op::Load { .. } | Op::Lock { .. })
    }

    fn is_write(&self, event: &Event) -> bool {
        matches!(event.op, Op::Store { .. } | Op::Unlock { .. })
    }

    fn is_lock(&self, event: &Event) -> bool {
        matches!(event.op, Op::Lock { .. })
    }

    fn is_unlock(&self, event: &Event) -> bool {
        matches!(event.op, Op::Unlock { .. })
    }

    fn is_join(&self, event: &Event) -> bool {
        matches!(event.op, Op::Join { .. })
    }

    fn is_thread_create(&self, event: &Event) -> bool {
        matches!(event.op, Op::Spawn { .. })
    }

    fn is_global_read(&self, event: &Event) -> bool {
        match event.op {
            Op::Load { mref } => mref.scope == MemScope::Global,
            _ => false,
        }
    }
}
