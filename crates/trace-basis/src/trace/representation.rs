use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a thread inside the thread table of one run.
///
/// Ipids are handed out in the order threads are created, the initial
/// thread being `Ipid(0)`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipid(pub u32);

impl Ipid {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Ipid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Hierarchical identity of a thread.
///
/// The initial thread is `<0>`, the `n`-th child spawned by a thread
/// with identity `<p>` is `<p.n>`. Unlike an [`Ipid`], a Cpid does not
/// depend on the global order in which threads were created, so it is
/// stable across alternative interleavings of the same program.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cpid(Vec<u32>);

impl Cpid {
    /// The identity of the initial thread.
    pub fn root() -> Self {
        Self(vec![0])
    }

    /// The identity of the `n`-th thread spawned by `self`.
    pub fn spawn(&self, n: u32) -> Self {
        let mut path = self.0.clone();
        path.push(n);
        Self(path)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.len() > 1 {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        } else {
            None
        }
    }

    /// Number of spawns between the initial thread and this one. An
    /// empty path has depth 0.
    pub fn depth(&self) -> usize {
        self.0.len().saturating_sub(1)
    }
}

impl From<Vec<u32>> for Cpid {
    fn from(path: Vec<u32>) -> Self {
        Self(path)
    }
}

impl fmt::Display for Cpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path: Vec<String> = self.0.iter().map(|n| n.to_string()).collect();
        write!(f, "<{}>", path.join("."))
    }
}

/// Where a memory location lives.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemScope {
    /// Globals and heap: potentially shared between threads
    #[default]
    Global,
    /// A stack slot of the accessing thread
    Local,
}

/// Descriptor of a single memory access: `size` bytes starting at `addr`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRef {
    pub addr: u64,
    pub size: u32,
    #[serde(default)]
    pub scope: MemScope,
}

impl MemRef {
    pub fn global(addr: u64, size: u32) -> Self {
        Self {
            addr,
            size,
            scope: MemScope::Global,
        }
    }

    pub fn local(addr: u64, size: u32) -> Self {
        Self {
            addr,
            size,
            scope: MemScope::Local,
        }
    }

    /// Returns `true` if both accesses share at least one byte.
    pub fn overlaps(&self, other: &MemRef) -> bool {
        let end = self.addr.saturating_add(u64::from(self.size));
        let other_end = other.addr.saturating_add(u64::from(other.size));

        self.addr < other_end && other.addr < end
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            MemScope::Global => write!(f, "{:#x}:{}", self.addr, self.size),
            MemScope::Local => write!(f, "{:#x}:{} (local)", self.addr, self.size),
        }
    }
}

/// Misuse of a synchronisation primitive by the analysed program.
///
/// Faults are not errors of the analysis. They are recorded in the
/// trace like any other operation so the run ends with a reproducible
/// error trace.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Fault {
    /// Join on a thread id that does not name another existing thread
    InvalidJoin { tid: i64 },
    /// Unlock of a mutex that is not locked
    UnlockUnlocked { mutex: u64 },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::InvalidJoin { tid } => write!(f, "join on invalid thread id {tid}"),
            Fault::UnlockUnlocked { mutex } => write!(f, "unlock of unlocked mutex {mutex:#x}"),
        }
    }
}

/// The operation an event represents.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Op {
    /// A _load_ from the referenced memory
    Load { mref: MemRef },

    /// A _store_ to the referenced memory
    Store { mref: MemRef },

    /// The mutex at address `mutex` was acquired
    Lock { mutex: u64 },

    /// The mutex at address `mutex` was released
    Unlock { mutex: u64 },

    /// The thread `child` was created
    Spawn { child: Ipid },

    /// The thread `target` was joined
    Join { target: Ipid },

    /// The program misused a synchronisation primitive
    Fault { fault: Fault },
}

impl Op {
    /// The memory reference of a load or store.
    pub fn mref(&self) -> Option<&MemRef> {
        match self {
            Op::Load { mref } | Op::Store { mref } => Some(mref),
            _ => None,
        }
    }

    /// The mutex address of a lock or unlock.
    pub fn mutex(&self) -> Option<u64> {
        match self {
            Op::Lock { mutex } | Op::Unlock { mutex } => Some(*mutex),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Load { mref } => write!(f, "r({mref})"),
            Op::Store { mref } => write!(f, "w({mref})"),
            Op::Lock { mutex } => write!(f, "acq(L{mutex:#x})"),
            Op::Unlock { mutex } => write!(f, "rel(L{mutex:#x})"),
            Op::Spawn { child } => write!(f, "fork({child})"),
            Op::Join { target } => write!(f, "join({target})"),
            Op::Fault { fault } => write!(f, "fault({fault})"),
        }
    }
}

/// A single event of the execution trace.
///
/// `order` is the position of the event inside its own thread: the
/// first event of every thread has order 0 and each further event of
/// the same thread increments it by one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub ipid: Ipid,
    pub cpid: Cpid,
    pub order: u32,
    #[serde(flatten)]
    pub op: Op,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}#{}|{}", self.ipid, self.cpid, self.order, self.op)
    }
}
