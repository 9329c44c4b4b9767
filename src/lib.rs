use std::path::Path;

use anyhow::Error;

pub use crate::{
    config::Config,
    executor::{Executor, Outcome, Run},
    program::{Program, Stmt},
};

/// Settings of a run.
pub mod config;

/// The cooperative interpreter that drives the scheduling interceptor.
pub mod executor;

/// Programs for the simulated executor.
pub mod program;

/// Loads the program at `program` and executes it once.
///
/// It serves as a shortcut for:
/// `Executor::new(&Program::load(program)?, config)?.run()`.
///
/// # Examples
/// ```no_run
/// # use anyhow::Error;
/// # fn main() -> Result<(), Error> {
/// let run = dcgrind::grind("program.json", dcgrind::Config::default())?;
///
/// let basis = run.basis()?;
/// for process in basis.iter() {
///     println!("{}: {} events", process[0].cpid, process.len());
/// }
/// # Ok(())
/// # }
/// ```
pub fn grind<P: AsRef<Path>>(program: P, config: Config) -> Result<Run, Error> {
    let program = Program::load(program)?;
    Executor::new(&program, config)?.run()
}
