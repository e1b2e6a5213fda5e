//! Execution-type resolution.
//!
//! Turns a job's `execution_type` into the concrete argv a worker is
//! started with. Presets map a short name to an interpreter plus the
//! reference handler script; explicit `{executable, handler}` pairs may
//! borrow either half from a preset with a `!name` value.

use crate::error::{MultirunnerError, Result};
use crate::job::{Executable, ExecutionType};
use crate::paths;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

/// Prefix marking a value borrowed from a preset.
const PRESET_REF_PREFIX: char = '!';

/// Subcommand that runs the built-in shell worker.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// A fully resolved worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    argv: Vec<OsString>,
}

impl WorkerCommand {
    /// Build from an argv whose first element is the program.
    pub fn new(argv: Vec<OsString>) -> Self {
        Self { argv }
    }

    pub fn program(&self) -> &OsStr {
        self.argv.first().map(OsString::as_os_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[OsString] {
        self.argv.get(1..).unwrap_or_default()
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.argv.push(arg.into());
        self
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.argv {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{}", part.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Interpreter and handler script for one named execution type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    /// Program followed by its leading arguments.
    pub executable: Vec<OsString>,
    /// Handler script appended after the executable, if any.
    pub handler: Option<PathBuf>,
}

impl Preset {
    pub fn new<I, S>(executable: I, handler: Option<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            executable: executable.into_iter().map(Into::into).collect(),
            handler,
        }
    }

    fn command(&self) -> WorkerCommand {
        let mut argv = self.executable.clone();
        if let Some(handler) = &self.handler {
            argv.push(handler.clone().into_os_string());
        }
        WorkerCommand::new(argv)
    }
}

/// Table of named presets.
#[derive(Debug, Clone, Default)]
pub struct Presets {
    table: BTreeMap<String, Preset>,
}

impl Presets {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in presets, with handler scripts from [`paths::handlers_dir`].
    pub fn builtin() -> Self {
        let worker_exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("multirunner"));
        Self::with_dirs(&paths::handlers_dir(), &worker_exe)
    }

    /// Built-in presets with explicit handler-script and worker-binary locations.
    pub fn with_dirs(handlers_dir: &Path, worker_exe: &Path) -> Self {
        let python = Preset::new(["python3", "-u"], Some(handlers_dir.join("python.py")));
        let node = Preset::new(
            ["node", "--no-deprecation"],
            Some(handlers_dir.join("node.js")),
        );
        let sh = Preset::new(
            [worker_exe.as_os_str(), OsStr::new(WORKER_SUBCOMMAND)],
            None,
        );

        Self::new()
            .insert("python", python.clone())
            .insert("python3", python)
            .insert("node", node)
            .insert("sh", sh)
    }

    /// Point the `sh` preset at a specific multirunner binary.
    pub fn with_worker_exe(self, worker_exe: impl AsRef<Path>) -> Self {
        let sh = Preset::new(
            [worker_exe.as_ref().as_os_str(), OsStr::new(WORKER_SUBCOMMAND)],
            None,
        );
        self.insert("sh", sh)
    }

    /// Add or replace a preset.
    pub fn insert(mut self, name: impl Into<String>, preset: Preset) -> Self {
        self.table.insert(name.into(), preset);
        self
    }

    pub fn get(&self, name: &str) -> Result<&Preset> {
        self.table
            .get(name)
            .ok_or_else(|| MultirunnerError::UnknownPreset {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    /// Preset names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.table.keys().map(String::as_str).collect()
    }
}

/// Resolve an execution type into the command a worker runs.
pub fn resolve(execution_type: &ExecutionType, presets: &Presets) -> Result<WorkerCommand> {
    let command = match execution_type {
        ExecutionType::Named(name) => presets.get(name)?.command(),
        ExecutionType::Explicit {
            executable,
            handler,
        } => {
            let mut argv = match executable {
                Executable::Program(program) => match preset_ref(program) {
                    Some(name) => presets.get(name)?.executable.clone(),
                    None => vec![OsString::from(program)],
                },
                Executable::Argv(argv) => argv.iter().map(OsString::from).collect(),
            };
            if argv.is_empty() {
                return Err(MultirunnerError::InvalidSpec(
                    "execution_type.executable must not be empty".to_string(),
                ));
            }

            match preset_ref(handler) {
                Some(name) => {
                    if let Some(script) = &presets.get(name)?.handler {
                        argv.push(script.clone().into_os_string());
                    }
                }
                None if handler.is_empty() => {}
                None => argv.push(OsString::from(handler)),
            }
            WorkerCommand::new(argv)
        }
    };

    tracing::debug!(command = %command, "Resolved worker command");
    Ok(command)
}

fn preset_ref(value: &str) -> Option<&str> {
    value.strip_prefix(PRESET_REF_PREFIX)
}
