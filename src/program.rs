use std::{collections::BTreeMap, io::Read, path::Path};

use anyhow::{Error, anyhow, ensure};
use serde::{Deserialize, Serialize};
use trace_basis::MemScope;

/// A single statement of a simulated thread.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Stmt {
    /// Read `size` bytes starting at `addr`
    Load {
        addr: u64,
        size: u32,
        #[serde(default)]
        scope: MemScope,
    },

    /// Write `size` bytes starting at `addr`
    Store {
        addr: u64,
        size: u32,
        #[serde(default)]
        scope: MemScope,
    },

    /// Acquire the mutex at address `mutex`
    Lock { mutex: u64 },

    /// Release the mutex at address `mutex`
    Unlock { mutex: u64 },

    /// Start a new thread running `function`, optionally remembering its
    /// thread id under `handle`
    Spawn {
        function: String,
        #[serde(default)]
        handle: Option<String>,
    },

    /// Wait for the thread with id `tid` to terminate
    Join { tid: i64 },

    /// Wait for the thread remembered under `handle` to terminate
    JoinHandle { handle: String },

    /// Execute `function` and return here afterwards
    Call { function: String },

    /// A computation that is invisible to other threads
    Local,
}

/// A multithreaded program for the simulated executor.
///
/// The program consists of named functions. The run starts with a single
/// thread executing `entry`; further threads are created with
/// [`Stmt::Spawn`]. Thread ids are assigned in creation order, the initial
/// thread having id 0.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Program {
    #[serde(default = "default_entry")]
    pub entry: String,
    pub functions: BTreeMap<String, Vec<Stmt>>,
}

fn default_entry() -> String {
    String::from("main")
}

impl Program {
    /// Parses a program from JSON and checks that every function it
    /// refers to exists.
    pub fn from_json<R: Read>(reader: R) -> Result<Self, Error> {
        let program: Program = serde_json::from_reader(reader).map_err(Error::from)?;
        program.validate()?;

        Ok(program)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = std::fs::File::open(path.as_ref())
            .map_err(|e| anyhow!("Could not open program {}: {e}", path.as_ref().display()))?;

        Self::from_json(std::io::BufReader::new(file))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(&self).map_err(Error::from)
    }

    pub fn function(&self, name: &str) -> Result<&[Stmt], Error> {
        self.functions
            .get(name)
            .map(Vec::as_slice)
            .ok_or(anyhow!("Function `{name}` is not defined"))
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.function(&self.entry)?;

        for (name, body) in &self.functions {
            for stmt in body {
                if let Stmt::Spawn { function, .. } | Stmt::Call { function } = stmt {
                    ensure!(
                        self.functions.contains_key(function),
                        "Function `{name}` refers to undefined function `{function}`"
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use trace_basis::MemScope;

    use super::{Program, Stmt};

    #[test]
    fn parse_program() -> Result<(), Error> {
        let json = r#"{
            "functions": {
                "main": [
                    {"op": "spawn", "function": "worker", "handle": "w"},
                    {"op": "store", "addr": 16, "size": 4},
                    {"op": "join_handle", "handle": "w"}
                ],
                "worker": [
                    {"op": "load", "addr": 16, "size": 4, "scope": "local"},
                    {"op": "local"}
                ]
            }
        }"#;
        let program = Program::from_json(json.as_bytes())?;

        assert_eq!(program.entry, "main");
        assert_eq!(
            program.function("worker")?[0],
            Stmt::Load { addr: 16, size: 4, scope: MemScope::Local }
        );
        assert_eq!(
            program.function("main")?[1],
            Stmt::Store { addr: 16, size: 4, scope: MemScope::Global }
        );

        let reparsed = Program::from_json(program.to_json()?.as_bytes())?;
        assert_eq!(program, reparsed);

        Ok(())
    }

    #[test]
    fn undefined_functions_are_rejected() {
        let missing_entry = r#"{"entry": "start", "functions": {"main": []}}"#;
        Program::from_json(missing_entry.as_bytes()).unwrap_err();

        let missing_callee = r#"{"functions": {"main": [{"op": "call", "function": "f"}]}}"#;
        Program::from_json(missing_callee.as_bytes()).unwrap_err();
    }
}
