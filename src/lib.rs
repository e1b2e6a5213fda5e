//! multirunner - fan a stream of JSON items out across a pool of worker
//! processes, each of which may be written in a different language.
//!
//! A [`JobSpec`] names an execution type (a preset like `python`, `node` or
//! the built-in `sh` worker, or an explicit executable and handler script)
//! and the execution info every worker loads at startup. The
//! [`JobRunner`] resolves it to a command, spawns the pool, handshakes each
//! worker and dispatches items, yielding one [`TaskResult`] per item.
//!
//! The lower layers are public too: [`resolver`], [`pool`] (spawn,
//! handshake, dispatch) and [`stats`].

pub mod cli;
pub mod error;
pub mod job;
pub mod logging;
pub mod memory;
pub mod output;
pub mod paths;
pub mod pool;
pub mod protocol;
pub mod resolver;
pub mod runner;
pub mod stats;
pub mod version;
pub mod worker;

pub use error::{MultirunnerError, Result};
pub use job::{CodeSource, Executable, ExecutionInfo, ExecutionType, JobSpec};
pub use protocol::TaskResult;
pub use runner::{JobRunner, RunSummary, RunnerConfig};
