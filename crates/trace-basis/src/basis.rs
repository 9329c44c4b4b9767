use std::{collections::HashMap, ops::Index};

use anyhow::{Error, bail};

use crate::{
    error::BasisError,
    trace::{Cpid, Event, EventId, Trace},
};

mod cursor;

pub use cursor::EventsCursor;

/// Anything that can be stored in a process: it has to know which
/// thread it belongs to and where it sits inside that thread.
pub trait ThreadEvent: Copy {
    fn cpid(&self) -> &Cpid;
    fn order(&self) -> u32;
}

impl ThreadEvent for &Event {
    fn cpid(&self) -> &Cpid {
        &self.cpid
    }

    fn order(&self) -> u32 {
        self.order
    }
}

/// A collection of per-thread event sequences.
///
/// Every inner sequence is a _process_: it is non-empty and all of its
/// elements belong to the same thread, which identifies the process.
/// One process may be designated as the _topology root_, i.e. the
/// initial thread of the program, which serves as anchor for exploring
/// the trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processes<N> {
    processes: Vec<Vec<N>>,
    topology_root: Option<usize>,
}

/// The per-thread partitioning of a recorded trace.
///
/// A basis only borrows the events of a [`Trace`], so it is cheap to
/// clone and can never outlive the events it indexes.
pub type Basis<'a> = Processes<&'a Event>;

fn check_non_empty<N>(processes: &[Vec<N>]) -> Result<(), Error> {
    match processes.iter().position(Vec::is_empty) {
        Some(idx) => bail!(BasisError::EmptyProcess(idx)),
        None => Ok(()),
    }
}

impl<N: ThreadEvent> Processes<N> {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            topology_root: None,
        }
    }

    /// Adopts a list of processes that was partitioned elsewhere.
    ///
    /// # Errors
    ///
    /// Fails with [`BasisError::EmptyProcess`] if a process has no events.
    pub fn from_processes(processes: Vec<Vec<N>>) -> Result<Self, Error> {
        check_non_empty(&processes)?;

        Ok(Self {
            processes,
            topology_root: None,
        })
    }

    /// Exchanges the processes of this collection with `other`.
    ///
    /// The topology root is kept as an index and is not re-validated.
    /// Nothing is exchanged if `other` contains a process without events.
    pub fn swap(&mut self, other: &mut Vec<Vec<N>>) -> Result<(), Error> {
        check_non_empty(other)?;
        std::mem::swap(&mut self.processes, other);

        Ok(())
    }

    /// The number of processes.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn processes(&self) -> &[Vec<N>] {
        &self.processes
    }

    pub fn get(&self, idx: usize) -> Option<&[N]> {
        self.processes.get(idx).map(Vec::as_slice)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Vec<N>> {
        self.processes.iter()
    }

    /// Returns the index of the process of thread `cpid`.
    pub fn process_index_of(&self, cpid: &Cpid) -> Option<usize> {
        self.processes
            .iter()
            .position(|process| process.first().is_some_and(|event| event.cpid() == cpid))
    }

    /// Designates the process of thread `cpid` as the topology root.
    ///
    /// # Errors
    ///
    /// Fails with [`BasisError::AlreadySet`] if there already is a root
    /// and with [`BasisError::NotFound`] if there is no such process.
    pub fn set_topology_root(&mut self, cpid: &Cpid) -> Result<(), Error> {
        if self.topology_root.is_some() {
            bail!(BasisError::AlreadySet);
        }

        match self.process_index_of(cpid) {
            Some(idx) => {
                self.topology_root = Some(idx);
                Ok(())
            }
            None => bail!(BasisError::NotFound(format!("for thread {cpid}"))),
        }
    }

    /// Designates the process at `idx` as the topology root.
    ///
    /// # Errors
    ///
    /// Same as [`set_topology_root`][Self::set_topology_root].
    pub fn set_topology_root_index(&mut self, idx: usize) -> Result<(), Error> {
        if self.topology_root.is_some() {
            bail!(BasisError::AlreadySet);
        }
        if idx >= self.processes.len() {
            bail!(BasisError::NotFound(format!("at index {idx}")));
        }

        self.topology_root = Some(idx);
        Ok(())
    }

    pub fn has_topology_root(&self) -> bool {
        self.topology_root.is_some()
    }

    pub fn is_topology_root(&self, cpid: &Cpid) -> bool {
        self.topology_root_cpid() == Some(cpid)
    }

    pub fn is_topology_root_index(&self, idx: usize) -> bool {
        self.topology_root == Some(idx)
    }

    pub fn topology_root_index(&self) -> Option<usize> {
        self.topology_root
    }

    pub fn topology_root(&self) -> Option<&[N]> {
        self.topology_root.and_then(|idx| self.get(idx))
    }

    pub fn topology_root_cpid(&self) -> Option<&Cpid> {
        self.topology_root().map(|process| process[0].cpid())
    }

    /// A cursor to the first event of the first process.
    pub fn events_begin(&self) -> EventsCursor<'_, N> {
        EventsCursor::new(&self.processes, 0, 0)
    }

    /// The end sentinel.
    pub fn events_end(&self) -> EventsCursor<'_, N> {
        EventsCursor::end_of(&self.processes)
    }

    /// A cursor at an arbitrary position.
    ///
    /// The position is not checked: it is up to the caller to request
    /// either an existing event or the end sentinel.
    pub fn cursor(&self, process: usize, event: usize) -> EventsCursor<'_, N> {
        EventsCursor::new(&self.processes, process, event)
    }
}

impl<N: ThreadEvent> Default for Processes<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> Index<usize> for Processes<N> {
    type Output = [N];

    fn index(&self, idx: usize) -> &Self::Output {
        &self.processes[idx]
    }
}

impl<'a> Basis<'a> {
    /// Partitions `trace` by thread.
    ///
    /// The events are replayed in the order they were recorded and each
    /// one is appended to the process of its thread. Processes are
    /// created on the first event of a thread, so they appear in the order
    /// the threads were discovered.
    ///
    /// If `cutoff` is given, the partitioning stops right after that event:
    /// the cutoff itself is part of the basis, everything recorded later
    /// is not.
    ///
    /// # Errors
    ///
    /// Fails with [`BasisError::InvalidTrace`] if an event cannot be
    /// attributed to a registered thread of the trace or if it breaks the
    /// sequence numbering of its thread.
    pub fn build(trace: &'a Trace, cutoff: Option<&'a Event>) -> Result<Self, Error> {
        // mapping from already discovered threads to process indices
        let mut mapping = HashMap::with_capacity(trace.threads().len());
        let mut processes: Vec<Vec<&'a Event>> = Vec::new();

        for (id, event) in trace.events().iter().enumerate() {
            match trace.cpid(event.ipid) {
                Some(cpid) if *cpid == event.cpid => {}
                Some(cpid) => bail!(BasisError::InvalidTrace {
                    event: EventId(id),
                    reason: format!(
                        "thread {} is registered as {cpid} but the event claims {}",
                        event.ipid, event.cpid
                    ),
                }),
                None => bail!(BasisError::InvalidTrace {
                    event: EventId(id),
                    reason: format!("thread {} is not registered", event.ipid),
                }),
            }

            let idx = *mapping.entry(event.ipid).or_insert_with(|| {
                processes.push(Vec::new());
                processes.len() - 1
            });

            let process = &mut processes[idx];
            if event.order as usize != process.len() {
                bail!(BasisError::InvalidTrace {
                    event: EventId(id),
                    reason: format!(
                        "thread {} expected order {} but found {}",
                        event.cpid,
                        process.len(),
                        event.order
                    ),
                });
            }
            process.push(event);

            if cutoff.is_some_and(|till| std::ptr::eq(till, event)) {
                log::debug!("Stopped partitioning at cutoff event {id}");
                break;
            }
        }

        log::debug!(
            "Partitioned {} events into {} processes",
            processes.iter().map(Vec::len).sum::<usize>(),
            processes.len()
        );

        Self::from_processes(processes)
    }

    /// A cursor to exactly `event`, or the end sentinel if `event` is
    /// not part of this basis.
    pub fn locate(&self, event: &Event) -> EventsCursor<'_, &'a Event> {
        if let Some(pidx) = self.process_index_of(&event.cpid) {
            if let Some(eidx) = self.processes[pidx]
                .iter()
                .position(|candidate| std::ptr::eq(*candidate, event))
            {
                return self.cursor(pidx, eidx);
            }
        }

        self.events_end()
    }

    /// A cursor to the event of thread `cpid` with sequence number
    /// `order`, or the end sentinel if there is no such event.
    pub fn locate_order(&self, cpid: &Cpid, order: u32) -> EventsCursor<'_, &'a Event> {
        if let Some(pidx) = self.process_index_of(cpid) {
            if let Some(eidx) = self.processes[pidx]
                .iter()
                .position(|candidate| candidate.order == order)
            {
                return self.cursor(pidx, eidx);
            }
        }

        self.events_end()
    }

    /// All events of the basis, process after process.
    pub fn events(&self) -> impl Iterator<Item = &'a Event> + '_ {
        self.processes.iter().flatten().copied()
    }

    /// Writes one line per process to the debug log.
    pub fn dump(&self) {
        for (idx, process) in self.processes.iter().enumerate() {
            let root = if self.is_topology_root_index(idx) { " (root)" } else { "" };
            let events: Vec<String> = process.iter().map(|event| event.op.to_string()).collect();
            log::debug!("[{idx}] {}{root}: {}", process[0].cpid, events.join(" "));
        }
    }
}
