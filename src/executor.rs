use std::collections::HashMap;

use anyhow::{Error, anyhow};
use dcgrind_core::{BlockingInstruction, Interceptor, TraceRecorder};
use trace_basis::{Basis, Cpid, Fault, Ipid, MemRef, Trace};

use crate::{
    config::Config,
    program::{Program, Stmt},
};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every thread terminated
    Completed,

    /// No thread can be scheduled but `blocked` have not terminated
    Deadlock { blocked: Vec<Ipid> },

    /// The analysed program misused a thread or mutex
    Fault { thread: Ipid, fault: Fault },

    /// The configured step limit was reached
    StepLimit { steps: usize },
}

/// The result of executing a program once.
pub struct Run {
    pub outcome: Outcome,
    pub steps: usize,
    pub trace: Trace,
}

impl Run {
    /// Partitions the recorded trace by thread, with the initial thread
    /// as topology root.
    pub fn basis(&self) -> Result<Basis<'_>, Error> {
        let mut basis = Basis::build(&self.trace, None)?;
        if !basis.is_empty() {
            basis.set_topology_root(&Cpid::root())?;
        }

        Ok(basis)
    }
}

/// A statement with its operands resolved in the context of the
/// executing thread.
#[derive(Debug, Clone, Copy)]
enum Instruction<'p> {
    Load(MemRef),
    Store(MemRef),
    Lock(u64),
    Unlock(u64),
    Spawn(&'p str, Option<&'p str>),
    Join(i64),
    Call(&'p str),
    Local,
}

impl BlockingInstruction for Instruction<'_> {
    fn join_target(&self) -> Option<i64> {
        match self {
            Instruction::Join(tid) => Some(*tid),
            _ => None,
        }
    }

    fn lock_target(&self) -> Option<u64> {
        match self {
            Instruction::Lock(addr) => Some(*addr),
            _ => None,
        }
    }
}

struct Frame<'p> {
    body: &'p [Stmt],
    pc: usize,
}

#[derive(Default)]
struct ThreadContext<'p> {
    frames: Vec<Frame<'p>>,
    handles: HashMap<&'p str, Ipid>,
}

enum Step {
    Progress,
    Refused,
    Fault(Fault),
}

/// A cooperative interpreter for [`Program`]s.
///
/// Threads are scheduled round-robin: every round gives each available
/// thread, in ascending id order, the chance to commit one instruction.
/// Joins and locks go through the [`Interceptor`] first. A refused thread
/// stays unavailable until the interceptor wakes it up, so it is only
/// retried after another thread made progress.
pub struct Executor<'p> {
    program: &'p Program,
    config: Config,
    interceptor: Interceptor<TraceRecorder>,
    threads: Vec<ThreadContext<'p>>,
}

impl<'p> Executor<'p> {
    pub fn new(program: &'p Program, config: Config) -> Result<Self, Error> {
        let entry = program.function(&program.entry)?;
        let main = ThreadContext {
            frames: vec![Frame { body: entry, pc: 0 }],
            handles: HashMap::new(),
        };

        Ok(Self {
            program,
            interceptor: Interceptor::new(TraceRecorder::new(), config.wake_policy),
            config,
            threads: vec![main],
        })
    }

    /// Executes the program until every thread terminated or the run
    /// cannot or must not continue.
    pub fn run(mut self) -> Result<Run, Error> {
        let mut steps = 0;

        let outcome = 'run: loop {
            let round: Vec<Ipid> = self.interceptor.builder().available().collect();

            if round.is_empty() {
                let blocked: Vec<Ipid> = self
                    .interceptor
                    .state()
                    .threads()
                    .filter(|(_, thread)| thread.is_running())
                    .map(|(ipid, _)| ipid)
                    .collect();

                if blocked.is_empty() {
                    break Outcome::Completed;
                }

                log::warn!("Deadlock: {blocked:?} cannot make progress");
                break Outcome::Deadlock { blocked };
            }

            for ipid in round {
                // An earlier step of this round may have blocked the thread
                if !self.interceptor.builder().is_available(ipid) {
                    continue;
                }

                if steps >= self.config.max_steps {
                    log::warn!("Step limit of {} reached", self.config.max_steps);
                    break 'run Outcome::StepLimit { steps };
                }

                match self.step(ipid)? {
                    Step::Progress => steps += 1,
                    Step::Refused => continue,
                    Step::Fault(fault) => {
                        steps += 1;
                        if self.config.stop_on_fault {
                            break 'run Outcome::Fault { thread: ipid, fault };
                        }
                    }
                }
            }
        };

        log::info!("Run finished after {steps} steps: {outcome:?}");

        Ok(Run {
            outcome,
            steps,
            trace: self.interceptor.into_builder().into_trace(),
        })
    }

    fn context(&mut self, ipid: Ipid) -> Result<&mut ThreadContext<'p>, Error> {
        self.threads
            .get_mut(ipid.index())
            .ok_or(anyhow!("No execution context for thread {ipid}"))
    }

    fn decode(&mut self, ipid: Ipid) -> Result<Option<Instruction<'p>>, Error> {
        let context = self.context(ipid)?;
        let frame = context
            .frames
            .last()
            .ok_or(anyhow!("Thread {ipid} is scheduled after it terminated"))?;

        let body: &'p [Stmt] = frame.body;
        let Some(stmt) = body.get(frame.pc) else {
            return Ok(None);
        };

        let instruction = match stmt {
            Stmt::Load { addr, size, scope } => Instruction::Load(MemRef {
                addr: *addr,
                size: *size,
                scope: *scope,
            }),
            Stmt::Store { addr, size, scope } => Instruction::Store(MemRef {
                addr: *addr,
                size: *size,
                scope: *scope,
            }),
            Stmt::Lock { mutex } => Instruction::Lock(*mutex),
            Stmt::Unlock { mutex } => Instruction::Unlock(*mutex),
            Stmt::Spawn { function, handle } => Instruction::Spawn(function, handle.as_deref()),
            Stmt::Join { tid } => Instruction::Join(*tid),
            Stmt::JoinHandle { handle } => Instruction::Join(
                context
                    .handles
                    .get(handle.as_str())
                    .map_or(-1, |ipid| i64::from(ipid.0)),
            ),
            Stmt::Call { function } => Instruction::Call(function),
            Stmt::Local => Instruction::Local,
        };

        Ok(Some(instruction))
    }

    /// Commits at most one instruction of thread `ipid`.
    fn step(&mut self, ipid: Ipid) -> Result<Step, Error> {
        self.interceptor.set_current(ipid)?;

        let Some(instruction) = self.decode(ipid)? else {
            // Falling off the end of a function returns from it
            self.context(ipid)?.frames.pop();
            if self.interceptor.on_return()? {
                log::debug!("{ipid} terminated");
            }
            return Ok(Step::Progress);
        };

        if self.interceptor.should_refuse(&instruction) {
            self.interceptor.builder_mut().take_refusal();
            return Ok(Step::Refused);
        }

        log::trace!("{ipid}: {instruction:?}");
        self.advance(ipid)?;

        let fault = match instruction {
            Instruction::Load(mref) => {
                self.interceptor.on_load(mref)?;
                None
            }
            Instruction::Store(mref) => {
                self.interceptor.on_store(mref)?;
                None
            }
            Instruction::Lock(addr) => {
                self.interceptor.on_lock(addr)?;
                None
            }
            Instruction::Unlock(addr) => self.interceptor.on_unlock(addr)?,
            Instruction::Spawn(function, handle) => {
                let child = self.interceptor.on_spawn()?;
                let program: &'p Program = self.program;
                let body = program.function(function)?;

                self.threads.push(ThreadContext {
                    frames: vec![Frame { body, pc: 0 }],
                    handles: HashMap::new(),
                });
                if let Some(handle) = handle {
                    self.context(ipid)?.handles.insert(handle, child);
                }
                None
            }
            Instruction::Join(tid) => self.interceptor.on_join(tid)?,
            Instruction::Call(function) => {
                let program: &'p Program = self.program;
                let body = program.function(function)?;
                self.context(ipid)?.frames.push(Frame { body, pc: 0 });
                self.interceptor.on_call()?;
                None
            }
            Instruction::Local => None,
        };

        Ok(fault.map_or(Step::Progress, Step::Fault))
    }

    fn advance(&mut self, ipid: Ipid) -> Result<(), Error> {
        let frame = self
            .context(ipid)?
            .frames
            .last_mut()
            .ok_or(anyhow!("Thread {ipid} has no frame to advance"))?;
        frame.pc += 1;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use dcgrind_core::WakePolicy;
    use trace_basis::{Classifier, Cpid, Fault, Ipid, MemRef, Op, OpClassifier};

    use crate::{config::Config, program::Program};

    use super::{Executor, Outcome, Run};

    fn run(json: &str, config: Config) -> Result<Run, Error> {
        let program = Program::from_json(json.as_bytes())?;
        Executor::new(&program, config)?.run()
    }

    fn ops(run: &Run, ipid: u32) -> Vec<Op> {
        run.trace
            .events()
            .iter()
            .filter(|e| e.ipid == Ipid(ipid))
            .map(|e| e.op)
            .collect()
    }

    #[test]
    fn join_waits_for_termination() -> Result<(), Error> {
        let run = run(
            r#"{"functions": {
                "main": [
                    {"op": "spawn", "function": "worker", "handle": "w"},
                    {"op": "join_handle", "handle": "w"},
                    {"op": "load", "addr": 0, "size": 4}
                ],
                "worker": [
                    {"op": "local"},
                    {"op": "local"},
                    {"op": "store", "addr": 0, "size": 4}
                ]
            }}"#,
            Config::default(),
        )?;

        assert_eq!(run.outcome, Outcome::Completed);

        // The join is committed after the worker's store
        let events = run.trace.events();
        let store = events.iter().position(|e| matches!(e.op, Op::Store { .. }));
        let join = events.iter().position(|e| matches!(e.op, Op::Join { .. }));
        assert!(store < join);
        assert_eq!(
            ops(&run, 0),
            [
                Op::Spawn { child: Ipid(1) },
                Op::Join { target: Ipid(1) },
                Op::Load { mref: MemRef::global(0, 4) },
            ]
        );

        Ok(())
    }

    #[test]
    fn mutual_exclusion() -> Result<(), Error> {
        let run = run(
            r#"{"functions": {
                "main": [
                    {"op": "spawn", "function": "worker", "handle": "a"},
                    {"op": "spawn", "function": "worker", "handle": "b"},
                    {"op": "join_handle", "handle": "a"},
                    {"op": "join_handle", "handle": "b"}
                ],
                "worker": [
                    {"op": "lock", "mutex": 64},
                    {"op": "load", "addr": 8, "size": 8},
                    {"op": "store", "addr": 8, "size": 8},
                    {"op": "unlock", "mutex": 64}
                ]
            }}"#,
            Config::default(),
        )?;

        assert_eq!(run.outcome, Outcome::Completed);

        // Critical sections never interleave
        let mut holder = None;
        for event in run.trace.events() {
            match event.op {
                Op::Lock { .. } => {
                    assert_eq!(holder, None);
                    holder = Some(event.ipid);
                }
                Op::Unlock { .. } => {
                    assert_eq!(holder, Some(event.ipid));
                    holder = None;
                }
                Op::Load { .. } | Op::Store { .. } => assert_eq!(holder, Some(event.ipid)),
                _ => {}
            }
        }

        Ok(())
    }

    #[test]
    fn lock_order_inversion_deadlocks() -> Result<(), Error> {
        let run = run(
            r#"{"functions": {
                "main": [
                    {"op": "spawn", "function": "ab", "handle": "x"},
                    {"op": "spawn", "function": "ba", "handle": "y"},
                    {"op": "join_handle", "handle": "x"},
                    {"op": "join_handle", "handle": "y"}
                ],
                "ab": [
                    {"op": "lock", "mutex": 1},
                    {"op": "local"},
                    {"op": "lock", "mutex": 2},
                    {"op": "unlock", "mutex": 2},
                    {"op": "unlock", "mutex": 1}
                ],
                "ba": [
                    {"op": "lock", "mutex": 2},
                    {"op": "local"},
                    {"op": "lock", "mutex": 1},
                    {"op": "unlock", "mutex": 1},
                    {"op": "unlock", "mutex": 2}
                ]
            }}"#,
            Config::default(),
        )?;

        assert_eq!(
            run.outcome,
            Outcome::Deadlock {
                blocked: vec![Ipid(0), Ipid(1), Ipid(2)]
            }
        );

        Ok(())
    }

    #[test]
    fn invalid_join_ends_with_fault() -> Result<(), Error> {
        let run = run(
            r#"{"functions": {"main": [
                {"op": "join", "tid": 3},
                {"op": "store", "addr": 0, "size": 1}
            ]}}"#,
            Config::default(),
        )?;

        let fault = Fault::InvalidJoin { tid: 3 };
        assert_eq!(run.outcome, Outcome::Fault { thread: Ipid(0), fault });
        assert_eq!(ops(&run, 0), [Op::Fault { fault }]);

        Ok(())
    }

    #[test]
    fn faults_can_be_stepped_over() -> Result<(), Error> {
        let config = Config {
            stop_on_fault: false,
            ..Config::default()
        };
        let run = run(
            r#"{"functions": {"main": [
                {"op": "unlock", "mutex": 5},
                {"op": "join_handle", "handle": "nobody"},
                {"op": "store", "addr": 0, "size": 1}
            ]}}"#,
            config,
        )?;

        assert_eq!(run.outcome, Outcome::Completed);
        assert_eq!(
            ops(&run, 0),
            [
                Op::Fault { fault: Fault::UnlockUnlocked { mutex: 5 } },
                Op::Fault { fault: Fault::InvalidJoin { tid: -1 } },
                Op::Store { mref: MemRef::global(0, 1) },
            ]
        );

        Ok(())
    }

    #[test]
    fn calls_keep_the_thread_alive() -> Result<(), Error> {
        let run = run(
            r#"{"functions": {
                "main": [
                    {"op": "spawn", "function": "outer", "handle": "t"},
                    {"op": "join_handle", "handle": "t"}
                ],
                "outer": [
                    {"op": "call", "function": "inner"},
                    {"op": "store", "addr": 4, "size": 4}
                ],
                "inner": [
                    {"op": "load", "addr": 4, "size": 4}
                ]
            }}"#,
            Config::default(),
        )?;

        assert_eq!(run.outcome, Outcome::Completed);
        assert_eq!(
            ops(&run, 1),
            [
                Op::Load { mref: MemRef::global(4, 4) },
                Op::Store { mref: MemRef::global(4, 4) },
            ]
        );

        Ok(())
    }

    #[test]
    fn step_limit() -> Result<(), Error> {
        let config = Config {
            max_steps: 3,
            ..Config::default()
        };
        let limited = run(
            r#"{"functions": {"main": [
                {"op": "local"}, {"op": "local"}, {"op": "local"}, {"op": "local"}
            ]}}"#,
            config,
        )?;

        assert_eq!(limited.outcome, Outcome::StepLimit { steps: 3 });

        let config = Config {
            max_steps: 0,
            ..Config::default()
        };
        let idle = run(r#"{"functions": {"main": [{"op": "lock", "mutex": 1}]}}"#, config)?;
        assert_eq!(idle.outcome, Outcome::StepLimit { steps: 0 });
        assert!(idle.trace.is_empty());

        // Finishing on the last allowed step completes the run
        let config = Config {
            max_steps: 1,
            ..Config::default()
        };
        let finished = run(r#"{"functions": {"main": []}}"#, config)?;
        assert_eq!(finished.outcome, Outcome::Completed);
        assert_eq!(finished.steps, 1);

        Ok(())
    }

    #[test]
    fn wake_policies_complete_contended_runs() -> Result<(), Error> {
        let program = r#"{"functions": {
            "main": [
                {"op": "lock", "mutex": 9},
                {"op": "spawn", "function": "worker", "handle": "a"},
                {"op": "spawn", "function": "worker", "handle": "b"},
                {"op": "spawn", "function": "worker", "handle": "c"},
                {"op": "local"},
                {"op": "unlock", "mutex": 9},
                {"op": "join_handle", "handle": "a"},
                {"op": "join_handle", "handle": "b"},
                {"op": "join_handle", "handle": "c"}
            ],
            "worker": [
                {"op": "lock", "mutex": 9},
                {"op": "store", "addr": 0, "size": 4},
                {"op": "unlock", "mutex": 9}
            ]
        }}"#;

        for wake_policy in [WakePolicy::All, WakePolicy::First] {
            let config = Config {
                wake_policy,
                ..Config::default()
            };
            let run = run(program, config)?;

            assert_eq!(run.outcome, Outcome::Completed);
            let locks = run.trace.events().iter().filter(|e| OpClassifier.is_lock(e)).count();
            assert_eq!(locks, 4);
        }

        Ok(())
    }

    #[test]
    fn basis_of_a_run() -> Result<(), Error> {
        let run = run(
            r#"{"functions": {
                "main": [
                    {"op": "spawn", "function": "worker", "handle": "w"},
                    {"op": "store", "addr": 32, "size": 4},
                    {"op": "join_handle", "handle": "w"}
                ],
                "worker": [
                    {"op": "load", "addr": 32, "size": 4}
                ]
            }}"#,
            Config::default(),
        )?;
        let basis = run.basis()?;

        assert_eq!(basis.len(), 2);
        assert!(basis.is_topology_root(&Cpid::root()));
        assert_eq!(basis.process_index_of(&Cpid::root().spawn(0)), Some(1));

        let store = basis.locate_order(&Cpid::root(), 1).event();
        let load = basis.locate_order(&Cpid::root().spawn(0), 0).event();
        assert!(OpClassifier.is_dependent(store, load));

        Ok(())
    }
}
