//! Worker process pool: spawn, handshake, dispatch, teardown.
//!
//! A [`WorkerPool`] owns N worker subprocesses for one resolved command.
//! [`handshake`] sends every worker the job's execution info and marks the
//! pool valid only if all of them load. [`dispatch`] then consumes a fully
//! ready pool and fans items out across its workers, yielding a lazy
//! [`ResultStream`] that tears the pool down when it ends or is dropped.

pub mod dispatch;
pub mod handshake;
pub mod ipc;
pub mod manager;
pub mod proc;
pub mod signals;
pub mod spawn;

pub use dispatch::{DispatchOptions, ResultStream, dispatch, dispatch_fallible};
pub use handshake::{HandshakeOutcome, handshake, handshake_cancellable};
pub use manager::{PoolOptions, Worker, WorkerPool, WorkerState};
pub use signals::TerminationReason;
pub use spawn::WorkerStderr;
