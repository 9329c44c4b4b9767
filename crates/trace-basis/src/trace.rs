use std::io::Read;

use anyhow::{Error, anyhow};
use serde::{Deserialize, Serialize};

mod representation;

pub use representation::{Cpid, Event, Fault, Ipid, MemRef, MemScope, Op};

/// Position of an event inside a [`Trace`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub usize);

/// The append-only event store of one execution.
///
/// A trace owns every [`Event`] that was recorded during a run, in the
/// order the events were committed, together with the registry of all
/// threads that took part in the run. Everything else (processes, the
/// [`Basis`][crate::Basis], cursors) only borrows events from here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(try_from = "TraceData")]
pub struct Trace {
    threads: Vec<Cpid>,
    events: Vec<Event>,
    #[serde(skip)]
    next_order: Vec<u32>,
}

/// The serialized form of a [`Trace`]. The per-thread counters are
/// derived from the events when a trace is read back.
#[derive(Deserialize)]
struct TraceData {
    threads: Vec<Cpid>,
    events: Vec<Event>,
}

impl TryFrom<TraceData> for Trace {
    type Error = Error;

    fn try_from(data: TraceData) -> Result<Self, Self::Error> {
        let mut next_order = vec![0u32; data.threads.len()];
        for event in &data.events {
            if let Some(order) = next_order.get_mut(event.ipid.index()) {
                let next = event
                    .order
                    .checked_add(1)
                    .ok_or(anyhow!("Order of event {event} is out of range"))?;
                *order = (*order).max(next);
            }
        }

        Ok(Self {
            threads: data.threads,
            events: data.events,
            next_order,
        })
    }
}

impl Trace {
    /// Creates an empty trace without any registered thread.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new thread and returns its [`Ipid`].
    pub fn register_thread(&mut self, cpid: Cpid) -> Ipid {
        let ipid = Ipid(self.threads.len() as u32);
        self.threads.push(cpid);
        self.next_order.push(0);

        ipid
    }

    /// Append a new event executed by thread `ipid`.
    ///
    /// The event gets the next sequence number of its thread.
    ///
    /// # Errors
    ///
    /// This function fails if `ipid` was never registered.
    pub fn push(&mut self, ipid: Ipid, op: Op) -> Result<EventId, Error> {
        let cpid = self
            .threads
            .get(ipid.index())
            .ok_or(anyhow!("Thread {ipid} is not registered in the trace"))?
            .clone();
        let slot = self
            .next_order
            .get_mut(ipid.index())
            .ok_or(anyhow!("Thread {ipid} has no event counter"))?;
        let order = *slot;
        *slot = order
            .checked_add(1)
            .ok_or(anyhow!("Thread {ipid} exceeded the maximum number of events"))?;

        let id = EventId(self.events.len());
        log::trace!("{id:?}: {ipid}{cpid}#{order}|{op}");
        self.events.push(Event {
            ipid,
            cpid,
            order,
            op,
        });

        Ok(id)
    }

    pub fn get(&self, id: EventId) -> Option<&Event> {
        self.events.get(id.0)
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    /// The identity registered for `ipid`.
    pub fn cpid(&self, ipid: Ipid) -> Option<&Cpid> {
        self.threads.get(ipid.index())
    }

    pub fn threads(&self) -> &[Cpid] {
        &self.threads
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(&self).map_err(Error::from)
    }

    /// Reads a trace that was previously emitted by [`Trace::to_json`].
    ///
    /// The events are taken as they are. Whether they form a valid trace
    /// is checked once a [`Basis`][crate::Basis] is built over it.
    pub fn from_json<R: Read>(reader: R) -> Result<Self, Error> {
        serde_json::from_reader(reader).map_err(Error::from)
    }
}

impl<'a> IntoIterator for &'a Trace {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}
