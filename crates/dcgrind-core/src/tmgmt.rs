use std::collections::{BTreeSet, HashMap};

use anyhow::{Error, anyhow};
use serde::{Deserialize, Serialize};
use trace_basis::{Cpid, Ipid};

/// Runtime bookkeeping of a single simulated thread.
#[derive(Debug, Clone)]
pub struct ThreadState {
    cpid: Cpid,
    stack_depth: usize,
    awaiting_join: Vec<Ipid>,
    spawned: u32,
}

impl ThreadState {
    fn new(cpid: Cpid) -> Self {
        Self {
            cpid,
            stack_depth: 1,
            awaiting_join: Vec::new(),
            spawned: 0,
        }
    }

    pub fn cpid(&self) -> &Cpid {
        &self.cpid
    }

    /// A thread runs as long as its call stack is not empty.
    pub fn is_running(&self) -> bool {
        self.stack_depth > 0
    }

    pub fn stack_depth(&self) -> usize {
        self.stack_depth
    }

    /// Threads that are blocked until this thread terminates.
    pub fn awaiting_join(&self) -> &[Ipid] {
        &self.awaiting_join
    }

    pub(crate) fn push_frame(&mut self) {
        self.stack_depth += 1;
    }

    /// Pops the innermost frame and returns `true` if the stack is empty
    /// afterwards.
    pub(crate) fn pop_frame(&mut self) -> bool {
        self.stack_depth = self.stack_depth.saturating_sub(1);
        self.stack_depth == 0
    }

    pub(crate) fn await_join(&mut self, waiter: Ipid) {
        self.awaiting_join.push(waiter);
    }

    pub(crate) fn take_awaiting_join(&mut self) -> Vec<Ipid> {
        std::mem::take(&mut self.awaiting_join)
    }
}

/// Runtime bookkeeping of a single mutex.
///
/// A mutex comes into existence with its first lock, so an address
/// without a `MutexState` is an uninitialized mutex.
#[derive(Debug, Clone, Default)]
pub struct MutexState {
    owner: Option<Ipid>,
    waiting: BTreeSet<Ipid>,
}

impl MutexState {
    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub fn owner(&self) -> Option<Ipid> {
        self.owner
    }

    /// Threads that are blocked trying to acquire this mutex.
    pub fn waiting(&self) -> &BTreeSet<Ipid> {
        &self.waiting
    }

    pub(crate) fn acquire(&mut self, ipid: Ipid) {
        self.owner = Some(ipid);
    }

    pub(crate) fn release(&mut self) {
        self.owner = None;
    }

    pub(crate) fn enqueue(&mut self, ipid: Ipid) {
        self.waiting.insert(ipid);
    }

    /// Removes the threads that become eligible to retry the lock.
    pub(crate) fn dequeue(&mut self, policy: WakePolicy) -> Vec<Ipid> {
        match policy {
            WakePolicy::All => std::mem::take(&mut self.waiting).into_iter().collect(),
            WakePolicy::First => self.waiting.pop_first().into_iter().collect(),
        }
    }
}

/// Which waiters become schedulable again when a mutex is unlocked.
///
/// Woken threads do not get the mutex handed over. They retry their lock
/// and the driver decides which of them gets to run first.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WakePolicy {
    /// Every waiter, in ascending thread order
    #[default]
    All,
    /// Only the waiter with the lowest thread id. The others stay queued
    /// even though the mutex is unlocked and are woken one per unlock.
    First,
}

/// The complete runtime state the scheduling decisions are based on.
///
/// The state starts out with a single running thread, the initial thread
/// `Ipid(0)` with identity [`Cpid::root`].
#[derive(Debug, Clone)]
pub struct SchedulerState {
    threads: Vec<ThreadState>,
    mutexes: HashMap<u64, MutexState>,
    current: Ipid,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            threads: vec![ThreadState::new(Cpid::root())],
            mutexes: HashMap::new(),
            current: Ipid(0),
        }
    }

    /// The thread whose instruction is about to be committed.
    pub fn current(&self) -> Ipid {
        self.current
    }

    pub fn set_current(&mut self, ipid: Ipid) -> Result<(), Error> {
        if ipid.index() >= self.threads.len() {
            return Err(anyhow!("Cannot schedule unknown thread {ipid}"));
        }
        self.current = ipid;

        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, ipid: Ipid) -> Option<&ThreadState> {
        self.threads.get(ipid.index())
    }

    pub(crate) fn thread_mut(&mut self, ipid: Ipid) -> Result<&mut ThreadState, Error> {
        self.threads
            .get_mut(ipid.index())
            .ok_or(anyhow!("Thread {ipid} does not exist"))
    }

    pub fn threads(&self) -> impl Iterator<Item = (Ipid, &ThreadState)> {
        self.threads
            .iter()
            .enumerate()
            .map(|(idx, thread)| (Ipid(idx as u32), thread))
    }

    /// Resolves a thread id as it appears in the analysed program.
    ///
    /// Returns `None` unless `tid` names an existing thread other than
    /// the current one.
    pub fn join_target(&self, tid: i64) -> Option<Ipid> {
        usize::try_from(tid)
            .ok()
            .filter(|idx| *idx < self.threads.len() && *idx != self.current.index())
            .map(|idx| Ipid(idx as u32))
    }

    pub fn mutex(&self, addr: u64) -> Option<&MutexState> {
        self.mutexes.get(&addr)
    }

    pub(crate) fn mutex_mut(&mut self, addr: u64) -> Option<&mut MutexState> {
        self.mutexes.get_mut(&addr)
    }

    /// Returns the state of the mutex at `addr`, initializing it if this is
    /// its first use.
    pub(crate) fn mutex_or_init(&mut self, addr: u64) -> &mut MutexState {
        self.mutexes.entry(addr).or_default()
    }

    /// Creates a new running thread as a child of `parent`.
    pub(crate) fn add_thread(&mut self, parent: Ipid) -> Result<(Ipid, Cpid), Error> {
        let parent = self.thread_mut(parent)?;
        let cpid = parent.cpid.spawn(parent.spawned);
        parent.spawned += 1;

        let ipid = Ipid(self.threads.len() as u32);
        self.threads.push(ThreadState::new(cpid.clone()));

        Ok((ipid, cpid))
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}
