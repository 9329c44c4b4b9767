use std::collections::BTreeSet;

use anyhow::{Error, ensure};
use trace_basis::{Cpid, Fault, Ipid, MemRef, Op, Trace};

use crate::intercept::TraceBuilder;

/// A [`TraceBuilder`] that records every reported operation into a
/// [`Trace`].
///
/// Besides the events, the recorder keeps the set of threads that may
/// currently be scheduled and whether the last scheduling attempt was
/// refused. The driver consumes both to pick the next thread.
pub struct TraceRecorder {
    trace: Trace,
    available: BTreeSet<Ipid>,
    refused: bool,
}

impl TraceRecorder {
    /// Creates a recorder for a run that starts with the initial thread,
    /// which is registered and available right away.
    pub fn new() -> Self {
        let mut trace = Trace::new();
        let main = trace.register_thread(Cpid::root());

        Self {
            trace,
            available: BTreeSet::from([main]),
            refused: false,
        }
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }

    pub fn is_available(&self, ipid: Ipid) -> bool {
        self.available.contains(&ipid)
    }

    /// The schedulable threads in ascending order.
    pub fn available(&self) -> impl Iterator<Item = Ipid> + '_ {
        self.available.iter().copied()
    }

    /// Returns whether a refusal was signalled since the last call and
    /// resets the flag.
    pub fn take_refusal(&mut self) -> bool {
        std::mem::take(&mut self.refused)
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBuilder for TraceRecorder {
    fn mark_available(&mut self, ipid: Ipid) {
        self.available.insert(ipid);
    }

    fn mark_unavailable(&mut self, ipid: Ipid) {
        self.available.remove(&ipid);
    }

    fn refuse_schedule(&mut self) {
        self.refused = true;
    }

    fn load(&mut self, ipid: Ipid, mref: MemRef) -> Result<(), Error> {
        self.trace.push(ipid, Op::Load { mref }).map(|_| ())
    }

    fn store(&mut self, ipid: Ipid, mref: MemRef) -> Result<(), Error> {
        self.trace.push(ipid, Op::Store { mref }).map(|_| ())
    }

    fn mutex_lock(&mut self, ipid: Ipid, mutex: u64) -> Result<(), Error> {
        self.trace.push(ipid, Op::Lock { mutex }).map(|_| ())
    }

    fn mutex_unlock(&mut self, ipid: Ipid, mutex: u64) -> Result<(), Error> {
        self.trace.push(ipid, Op::Unlock { mutex }).map(|_| ())
    }

    fn spawn(&mut self, ipid: Ipid, child: Ipid, cpid: &Cpid) -> Result<(), Error> {
        let registered = self.trace.register_thread(cpid.clone());
        ensure!(
            registered == child,
            "Thread table out of sync: {cpid} registered as {registered}, scheduled as {child}"
        );

        self.trace.push(ipid, Op::Spawn { child }).map(|_| ())
    }

    fn join(&mut self, ipid: Ipid, target: Ipid) -> Result<(), Error> {
        self.trace.push(ipid, Op::Join { target }).map(|_| ())
    }

    fn fault(&mut self, ipid: Ipid, fault: Fault) -> Result<(), Error> {
        self.trace.push(ipid, Op::Fault { fault }).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use trace_basis::{Cpid, Ipid};

    use crate::intercept::TraceBuilder;

    use super::TraceRecorder;

    #[test]
    fn availability_and_refusal() {
        let mut recorder = TraceRecorder::new();
        assert_eq!(recorder.available().collect::<Vec<_>>(), [Ipid(0)]);

        recorder.mark_available(Ipid(2));
        recorder.mark_available(Ipid(1));
        recorder.mark_unavailable(Ipid(0));
        assert_eq!(recorder.available().collect::<Vec<_>>(), [Ipid(1), Ipid(2)]);

        assert!(!recorder.take_refusal());
        recorder.refuse_schedule();
        assert!(recorder.take_refusal());
        assert!(!recorder.take_refusal());
    }

    #[test]
    fn spawn_registers_the_child() -> Result<(), Error> {
        let mut recorder = TraceRecorder::new();
        let cpid = Cpid::root().spawn(0);

        recorder.spawn(Ipid(0), Ipid(1), &cpid)?;
        assert_eq!(recorder.trace().cpid(Ipid(1)), Some(&cpid));

        // The child has to get the next free ipid
        recorder.spawn(Ipid(0), Ipid(5), &Cpid::root().spawn(1)).unwrap_err();

        Ok(())
    }
}
