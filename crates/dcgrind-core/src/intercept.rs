use anyhow::{Error, bail};
use trace_basis::{Cpid, Fault, Ipid, MemRef};

use crate::tmgmt::{SchedulerState, WakePolicy};

/// Tells the interceptor which instructions may block.
///
/// Implemented by the instruction type of the executor, which is the only
/// party that knows how joins and locks look like in the analysed program.
pub trait BlockingInstruction {
    /// The thread id an instruction joins, as written in the program.
    fn join_target(&self) -> Option<i64>;

    /// The address of the mutex an instruction locks.
    fn lock_target(&self) -> Option<u64>;
}

/// Receiver of everything the interceptor observes.
///
/// The trace builder records accepted operations as events and keeps
/// track of which threads may currently be scheduled.
pub trait TraceBuilder {
    fn mark_available(&mut self, ipid: Ipid);
    fn mark_unavailable(&mut self, ipid: Ipid);

    /// Signals that the pending instruction of the current thread was not
    /// committed and has to be retried in a later round.
    fn refuse_schedule(&mut self);

    fn load(&mut self, ipid: Ipid, mref: MemRef) -> Result<(), Error>;
    fn store(&mut self, ipid: Ipid, mref: MemRef) -> Result<(), Error>;
    fn mutex_lock(&mut self, ipid: Ipid, mutex: u64) -> Result<(), Error>;
    fn mutex_unlock(&mut self, ipid: Ipid, mutex: u64) -> Result<(), Error>;
    fn spawn(&mut self, ipid: Ipid, child: Ipid, cpid: &Cpid) -> Result<(), Error>;
    fn join(&mut self, ipid: Ipid, target: Ipid) -> Result<(), Error>;
    fn fault(&mut self, ipid: Ipid, fault: Fault) -> Result<(), Error>;
}

/// The scheduling policy that sits between the executor and the trace
/// builder.
///
/// Before a join or lock is committed, the executor asks
/// [`should_refuse`][Self::should_refuse] whether the current thread may
/// proceed. Refused threads are marked unavailable and parked on the
/// thread or mutex they wait for; they become available again exactly
/// once, when that thread terminates or that mutex is unlocked.
///
/// Misuse of threads and mutexes by the analysed program is never
/// refused. It is recorded as a [`Fault`] so the run produces an error
/// trace instead of stalling.
pub struct Interceptor<B: TraceBuilder> {
    state: SchedulerState,
    builder: B,
    policy: WakePolicy,
}

impl<B: TraceBuilder> Interceptor<B> {
    /// Creates an interceptor for a run that starts with the initial
    /// thread only.
    pub fn new(builder: B, policy: WakePolicy) -> Self {
        Self {
            state: SchedulerState::new(),
            builder,
            policy,
        }
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut B {
        &mut self.builder
    }

    pub fn into_builder(self) -> B {
        self.builder
    }

    pub fn current(&self) -> Ipid {
        self.state.current()
    }

    /// Selects the thread whose instructions are committed next.
    pub fn set_current(&mut self, ipid: Ipid) -> Result<(), Error> {
        self.state.set_current(ipid)
    }

    /// Decides whether the pending instruction of the current thread has
    /// to be deferred.
    ///
    /// A join is refused while its target is still running, a lock is
    /// refused while its mutex is held. A refused thread is marked
    /// unavailable until the blocking condition clears.
    pub fn should_refuse<I: BlockingInstruction>(&mut self, instruction: &I) -> bool {
        let current = self.state.current();

        if let Some(tid) = instruction.join_target() {
            // Erroneous thread ids are let through and produce an error trace
            if let Some(target) = self.state.join_target(tid) {
                if let Some(thread) = self.state.thread(target).filter(|t| t.is_running()) {
                    log::debug!("{current}: join({target}) refused, {} still running", thread.cpid());
                    self.builder.mark_unavailable(current);
                    self.builder.refuse_schedule();
                    // The waiter is made available again in on_thread_terminate
                    if let Ok(thread) = self.state.thread_mut(target) {
                        thread.await_join(current);
                    }
                    return true;
                }
            }
        }

        if let Some(addr) = instruction.lock_target() {
            // Unlocked and uninitialized mutexes are handled by on_lock
            if let Some(mutex) = self.state.mutex_mut(addr).filter(|m| m.is_locked()) {
                log::debug!("{current}: lock({addr:#x}) refused, held by {:?}", mutex.owner());
                mutex.enqueue(current);
                self.builder.mark_unavailable(current);
                self.builder.refuse_schedule();
                return true;
            }
        }

        false
    }

    /// Reports a load of the current thread. Must be called before the
    /// memory is read.
    pub fn on_load(&mut self, mref: MemRef) -> Result<(), Error> {
        self.builder.load(self.state.current(), mref)
    }

    /// Reports a store of the current thread. Must be called before the
    /// memory is written.
    pub fn on_store(&mut self, mref: MemRef) -> Result<(), Error> {
        self.builder.store(self.state.current(), mref)
    }

    /// Commits a lock that was not refused.
    ///
    /// # Errors
    ///
    /// Fails if the mutex is held, i.e. the lock was committed without
    /// asking [`should_refuse`][Self::should_refuse] first.
    pub fn on_lock(&mut self, addr: u64) -> Result<(), Error> {
        let current = self.state.current();
        let mutex = self.state.mutex_or_init(addr);

        if let Some(owner) = mutex.owner() {
            bail!("{current} committed lock({addr:#x}) which is held by {owner}");
        }
        mutex.acquire(current);

        self.builder.mutex_lock(current, addr)
    }

    /// Commits an unlock and wakes the threads waiting for the mutex
    /// according to the configured [`WakePolicy`].
    ///
    /// Unlocking a mutex that is not locked is a fault of the analysed
    /// program: it is recorded and returned, the mutex is left untouched.
    pub fn on_unlock(&mut self, addr: u64) -> Result<Option<Fault>, Error> {
        let current = self.state.current();

        let woken = match self.state.mutex_mut(addr).filter(|m| m.is_locked()) {
            Some(mutex) => {
                mutex.release();
                mutex.dequeue(self.policy)
            }
            None => {
                let fault = Fault::UnlockUnlocked { mutex: addr };
                log::warn!("{current}: {fault}");
                self.builder.fault(current, fault)?;
                return Ok(Some(fault));
            }
        };

        self.builder.mutex_unlock(current, addr)?;
        for waiter in woken {
            log::debug!("{current}: unlock({addr:#x}) wakes {waiter}");
            self.builder.mark_available(waiter);
        }

        Ok(None)
    }

    /// Creates a new thread as a child of the current one.
    pub fn on_spawn(&mut self) -> Result<Ipid, Error> {
        let current = self.state.current();
        let (child, cpid) = self.state.add_thread(current)?;

        self.builder.spawn(current, child, &cpid)?;
        self.builder.mark_available(child);

        Ok(child)
    }

    /// Commits a join that was not refused.
    ///
    /// Joining something that is not another existing thread is a fault
    /// of the analysed program: it is recorded and returned.
    ///
    /// # Errors
    ///
    /// Fails if the target is still running, i.e. the join was committed
    /// without asking [`should_refuse`][Self::should_refuse] first.
    pub fn on_join(&mut self, tid: i64) -> Result<Option<Fault>, Error> {
        let current = self.state.current();

        match self.state.join_target(tid) {
            Some(target) => {
                if self.state.thread(target).is_some_and(|t| t.is_running()) {
                    bail!("{current} committed join({target}) while the target is running");
                }
                self.builder.join(current, target)?;
                Ok(None)
            }
            None => {
                let fault = Fault::InvalidJoin { tid };
                log::warn!("{current}: {fault}");
                self.builder.fault(current, fault)?;
                Ok(Some(fault))
            }
        }
    }

    /// The current thread entered a new function.
    pub fn on_call(&mut self) -> Result<(), Error> {
        let current = self.state.current();
        self.state.thread_mut(current)?.push_frame();

        Ok(())
    }

    /// The current thread returned from a function. Returns `true` if
    /// this emptied its call stack, in which case the thread terminated.
    pub fn on_return(&mut self) -> Result<bool, Error> {
        let current = self.state.current();
        let terminated = self.state.thread_mut(current)?.pop_frame();

        if terminated {
            self.on_thread_terminate(current)?;
        }

        Ok(terminated)
    }

    /// Releases every thread that waits to join `ipid`.
    ///
    /// # Errors
    ///
    /// Fails if `ipid` does not exist or is still running.
    pub fn on_thread_terminate(&mut self, ipid: Ipid) -> Result<(), Error> {
        let thread = self.state.thread_mut(ipid)?;
        if thread.is_running() {
            bail!("Thread {ipid} cannot terminate with a non-empty call stack");
        }

        let waiters = thread.take_awaiting_join();
        log::debug!("{ipid} terminated, releasing {waiters:?}");

        self.builder.mark_unavailable(ipid);
        for waiter in waiters {
            self.builder.mark_available(waiter);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use trace_basis::{Fault, Ipid, MemRef, Op};

    use crate::{recorder::TraceRecorder, tmgmt::WakePolicy};

    use super::{BlockingInstruction, Interceptor, TraceBuilder};

    enum Instr {
        Join(i64),
        Lock(u64),
        Store,
    }

    impl BlockingInstruction for Instr {
        fn join_target(&self) -> Option<i64> {
            match self {
                Instr::Join(tid) => Some(*tid),
                _ => None,
            }
        }

        fn lock_target(&self) -> Option<u64> {
            match self {
                Instr::Lock(addr) => Some(*addr),
                _ => None,
            }
        }
    }

    fn interceptor(policy: WakePolicy) -> Interceptor<TraceRecorder> {
        Interceptor::new(TraceRecorder::new(), policy)
    }

    #[test]
    fn join_on_running_thread_is_refused() -> Result<(), Error> {
        let mut icpt = interceptor(WakePolicy::All);
        let (a, b) = (Ipid(0), icpt.on_spawn()?);

        assert!(icpt.should_refuse(&Instr::Join(1)));
        assert!(icpt.builder_mut().take_refusal());
        assert!(!icpt.builder().is_available(a));
        assert_eq!(icpt.state().thread(b).map(|t| t.awaiting_join().to_vec()), Some(vec![a]));

        icpt.set_current(b)?;
        assert!(icpt.on_return()?);

        assert!(icpt.builder().is_available(a));
        assert!(!icpt.builder().is_available(b));
        assert!(icpt.state().thread(b).is_some_and(|t| t.awaiting_join().is_empty()));

        icpt.set_current(a)?;
        assert!(!icpt.should_refuse(&Instr::Join(1)));
        assert_eq!(icpt.on_join(1)?, None);

        let ops: Vec<Op> = icpt.builder().trace().events().iter().map(|e| e.op).collect();
        assert_eq!(ops, [Op::Spawn { child: b }, Op::Join { target: b }]);

        Ok(())
    }

    #[test]
    fn waiters_are_released_exactly_once() -> Result<(), Error> {
        let mut icpt = interceptor(WakePolicy::All);
        let b = icpt.on_spawn()?;
        let c = icpt.on_spawn()?;

        for waiter in [Ipid(0), c] {
            icpt.set_current(waiter)?;
            assert!(icpt.should_refuse(&Instr::Join(i64::from(b.0))));
        }

        icpt.set_current(b)?;
        icpt.on_return()?;
        assert!(icpt.builder().is_available(Ipid(0)));
        assert!(icpt.builder().is_available(c));

        // A second termination report must not wake anyone again
        icpt.builder_mut().mark_unavailable(c);
        icpt.on_thread_terminate(b)?;
        assert!(!icpt.builder().is_available(c));

        Ok(())
    }

    #[test]
    fn invalid_join_is_never_refused() -> Result<(), Error> {
        let mut icpt = interceptor(WakePolicy::All);
        icpt.on_spawn()?;

        for tid in [-1, 0, 2, 1000] {
            assert!(!icpt.should_refuse(&Instr::Join(tid)));
            assert!(!icpt.builder_mut().take_refusal());
        }

        assert_eq!(icpt.on_join(7)?, Some(Fault::InvalidJoin { tid: 7 }));
        assert!(icpt.builder().is_available(Ipid(0)));

        Ok(())
    }

    #[test]
    fn lock_on_held_mutex_is_refused() -> Result<(), Error> {
        let mut icpt = interceptor(WakePolicy::All);
        let (a, b) = (Ipid(0), icpt.on_spawn()?);

        // Uninitialized mutexes are not refused
        assert!(!icpt.should_refuse(&Instr::Lock(0x10)));
        icpt.on_lock(0x10)?;
        assert_eq!(icpt.state().mutex(0x10).and_then(|m| m.owner()), Some(a));

        icpt.set_current(b)?;
        assert!(icpt.should_refuse(&Instr::Lock(0x10)));
        assert!(!icpt.builder().is_available(b));
        assert!(icpt.state().mutex(0x10).is_some_and(|m| m.waiting().contains(&b)));

        icpt.set_current(a)?;
        assert_eq!(icpt.on_unlock(0x10)?, None);
        assert!(icpt.builder().is_available(b));
        assert!(icpt.state().mutex(0x10).is_some_and(|m| m.waiting().is_empty()));

        icpt.set_current(b)?;
        assert!(!icpt.should_refuse(&Instr::Lock(0x10)));
        icpt.on_lock(0x10)?;
        assert_eq!(icpt.state().mutex(0x10).and_then(|m| m.owner()), Some(b));

        Ok(())
    }

    #[test]
    fn wake_first_releases_one_waiter() -> Result<(), Error> {
        let mut icpt = interceptor(WakePolicy::First);
        let b = icpt.on_spawn()?;
        let c = icpt.on_spawn()?;

        icpt.on_lock(0x20)?;
        for waiter in [c, b] {
            icpt.set_current(waiter)?;
            assert!(icpt.should_refuse(&Instr::Lock(0x20)));
        }

        icpt.set_current(Ipid(0))?;
        icpt.on_unlock(0x20)?;
        assert!(icpt.builder().is_available(b));
        assert!(!icpt.builder().is_available(c));

        // The remaining waiter stays queued on the now unlocked mutex
        let mutex = icpt.state().mutex(0x20).cloned().unwrap_or_default();
        assert!(!mutex.is_locked());
        assert_eq!(mutex.waiting().iter().copied().collect::<Vec<_>>(), [c]);

        // and is woken by the next unlock
        icpt.set_current(b)?;
        assert!(!icpt.should_refuse(&Instr::Lock(0x20)));
        icpt.on_lock(0x20)?;
        icpt.on_unlock(0x20)?;
        assert!(icpt.builder().is_available(c));
        assert!(icpt.state().mutex(0x20).is_some_and(|m| m.waiting().is_empty()));

        Ok(())
    }

    #[test]
    fn unlock_of_unlocked_mutex_is_a_fault() -> Result<(), Error> {
        let mut icpt = interceptor(WakePolicy::All);

        let fault = Fault::UnlockUnlocked { mutex: 0x30 };
        assert_eq!(icpt.on_unlock(0x30)?, Some(fault));

        icpt.on_lock(0x30)?;
        assert_eq!(icpt.on_unlock(0x30)?, None);
        assert_eq!(icpt.on_unlock(0x30)?, Some(fault));

        let last = icpt.builder().trace().last().map(|e| e.op);
        assert_eq!(last, Some(Op::Fault { fault }));

        Ok(())
    }

    #[test]
    fn committing_blocked_operations_fails() -> Result<(), Error> {
        let mut icpt = interceptor(WakePolicy::All);
        let b = icpt.on_spawn()?;

        icpt.on_lock(0x40)?;
        icpt.set_current(b)?;
        icpt.on_lock(0x40).unwrap_err();
        icpt.on_join(0).unwrap_err();
        icpt.on_thread_terminate(Ipid(0)).unwrap_err();

        Ok(())
    }

    #[test]
    fn memory_accesses_are_recorded() -> Result<(), Error> {
        let mut icpt = interceptor(WakePolicy::All);

        assert!(!icpt.should_refuse(&Instr::Store));
        icpt.on_store(MemRef::global(0x100, 8))?;
        icpt.on_load(MemRef::local(0x7f00, 4))?;

        let ops: Vec<Op> = icpt.builder().trace().events().iter().map(|e| e.op).collect();
        assert_eq!(
            ops,
            [
                Op::Store { mref: MemRef::global(0x100, 8) },
                Op::Load { mref: MemRef::local(0x7f00, 4) },
            ]
        );

        Ok(())
    }
}
