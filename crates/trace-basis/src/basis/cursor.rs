use std::{cmp::Ordering, fmt};

use anyhow::Error;

use crate::error::BasisError;

/// A position in the two-dimensional (process, event) space of a
/// [`Processes`][super::Processes] collection.
///
/// The cursor walks the events of all processes as if they were one
/// sequence: stepping forward past the last event of a process lands on
/// the first event of the next process, stepping backward before the
/// first event of a process lands on the last event of the previous one.
/// Callers that care about thread boundaries can query and control them
/// with [`process_start`][Self::process_start],
/// [`process_end`][Self::process_end],
/// [`next_process`][Self::next_process],
/// [`prev_process`][Self::prev_process] and
/// [`skip_process`][Self::skip_process].
///
/// The position `(number of processes, 0)` is the end sentinel. It is
/// reached by stepping forward from the last event of the last process
/// and by stepping backward from the first event of the first process,
/// so it terminates walks in both directions. It must never be
/// dereferenced.
///
/// Moving or dereferencing a cursor that does not point to an event is a
/// bug of the caller and panics.
pub struct EventsCursor<'p, N> {
    processes: &'p [Vec<N>],
    process_idx: usize,
    event_idx: usize,
}

impl<'p, N: Copy> EventsCursor<'p, N> {
    pub(crate) fn new(processes: &'p [Vec<N>], process_idx: usize, event_idx: usize) -> Self {
        Self {
            processes,
            process_idx,
            event_idx,
        }
    }

    pub(crate) fn end_of(processes: &'p [Vec<N>]) -> Self {
        Self::new(processes, processes.len(), 0)
    }

    /// Index of the process the cursor points into.
    pub fn process_id(&self) -> usize {
        self.process_idx
    }

    /// Index of the event inside its process.
    pub fn event_id(&self) -> usize {
        self.event_idx
    }

    /// Returns `true` if this cursor points to an existing event.
    pub fn is_valid(&self) -> bool {
        self.processes
            .get(self.process_idx)
            .is_some_and(|process| self.event_idx < process.len())
    }

    pub fn is_end(&self) -> bool {
        self.process_idx == self.processes.len() && self.event_idx == 0
    }

    /// The end sentinel of the processes this cursor walks.
    pub fn end(&self) -> Self {
        Self::end_of(self.processes)
    }

    fn out_of_range(&self) -> BasisError {
        BasisError::OutOfRange {
            process: self.process_idx,
            event: self.event_idx,
        }
    }

    fn assert_valid(&self, action: &str) {
        if !self.is_valid() {
            panic!("Cannot {action}: {}", self.out_of_range());
        }
    }

    /// The event the cursor points to.
    ///
    /// # Errors
    ///
    /// Fails with [`BasisError::OutOfRange`] if the cursor does not point
    /// to an event, e.g. because it is the end sentinel.
    pub fn try_event(&self) -> Result<N, Error> {
        self.processes
            .get(self.process_idx)
            .and_then(|process| process.get(self.event_idx))
            .copied()
            .ok_or_else(|| Error::new(self.out_of_range()))
    }

    /// The event the cursor points to.
    ///
    /// # Panics
    ///
    /// Panics if the cursor does not point to an event.
    pub fn event(&self) -> N {
        self.assert_valid("dereference cursor");
        self.processes[self.process_idx][self.event_idx]
    }

    /// Steps to the next event, crossing into the next process after the
    /// last event of the current one.
    pub fn advance(&mut self) {
        self.assert_valid("advance cursor");

        if self.event_idx + 1 < self.processes[self.process_idx].len() {
            self.event_idx += 1;
        } else {
            self.event_idx = 0;
            self.process_idx += 1;
        }
    }

    /// Steps to the previous event, crossing into the previous process
    /// before the first event of the current one.
    ///
    /// Stepping back from the very first event yields the end sentinel.
    pub fn retreat(&mut self) {
        self.assert_valid("retreat cursor");

        if self.event_idx > 0 {
            self.event_idx -= 1;
        } else if self.process_idx > 0 {
            self.process_idx -= 1;
            self.event_idx = self.processes[self.process_idx].len() - 1;
        } else {
            self.process_idx = self.processes.len();
        }
    }

    /// Moves to the first event of the next process without looking at
    /// the current one.
    pub fn shift_process(&mut self) {
        self.process_idx += 1;
        self.event_idx = 0;
    }

    /// Moves onto the last event of the current process, so that the
    /// next [`advance`][Self::advance] jumps onto the next process.
    pub fn skip_process(&mut self) {
        self.assert_valid("skip process");
        self.event_idx = self.processes[self.process_idx].len() - 1;
    }

    /// A cursor to the first event of the current process.
    pub fn process_start(&self) -> Self {
        Self::new(self.processes, self.process_idx, 0)
    }

    /// A cursor to the last event of the current process.
    pub fn process_end(&self) -> Self {
        let mut end = *self;
        end.skip_process();
        end
    }

    /// A cursor to the first event of the next process, or the end
    /// sentinel if this is the last process.
    pub fn next_process(&self) -> Self {
        let mut next = self.process_end();
        next.advance();
        next
    }

    /// A cursor to the last event of the previous process, or the end
    /// sentinel if this is the first process.
    pub fn prev_process(&self) -> Self {
        let mut prev = self.process_start();
        prev.retreat();
        prev
    }

    /// Walks forward from this position until the end sentinel.
    pub fn forward(self) -> impl Iterator<Item = N> + 'p
    where
        N: 'p,
    {
        let mut cursor = self;
        std::iter::from_fn(move || {
            if cursor.is_valid() {
                let event = cursor.event();
                cursor.advance();
                Some(event)
            } else {
                None
            }
        })
    }
}

impl<N> Clone for EventsCursor<'_, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for EventsCursor<'_, N> {}

impl<N> PartialEq for EventsCursor<'_, N> {
    fn eq(&self, other: &Self) -> bool {
        self.process_idx == other.process_idx && self.event_idx == other.event_idx
    }
}

impl<N> Eq for EventsCursor<'_, N> {}

impl<N> PartialOrd for EventsCursor<'_, N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<N> Ord for EventsCursor<'_, N> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.process_idx, self.event_idx).cmp(&(other.process_idx, other.event_idx))
    }
}

impl<N> fmt::Debug for EventsCursor<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventsCursor")
            .field("process", &self.process_idx)
            .field("event", &self.event_idx)
            .field("processes", &self.processes.len())
            .finish()
    }
}
