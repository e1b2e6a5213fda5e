//! Pool of worker subprocesses.
//!
//! Spawns a fixed number of workers for one resolved command and owns their
//! lifecycle until teardown. A worker that fails to start is kept in the pool
//! in the `Failed` state so the handshake can report it.

use super::proc::Proc;
use super::signals::TerminationReason;
use super::spawn::{WorkerStderr, spawn_worker};
use crate::error::{MultirunnerError, Result};
use crate::protocol::{Diagnostic, Phase, WorkerDiagnostic};
use crate::resolver::WorkerCommand;
use std::fmt;
use std::time::Duration;

/// Default time a worker gets to exit after SIGTERM before SIGKILL.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Options for spawning a pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Where worker stderr goes.
    pub stderr: WorkerStderr,
    /// SIGTERM → SIGKILL grace period during teardown.
    pub grace: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            stderr: WorkerStderr::Inherit,
            grace: DEFAULT_GRACE,
        }
    }
}

impl PoolOptions {
    pub fn quiet_workers(mut self, quiet: bool) -> Self {
        self.stderr = if quiet {
            WorkerStderr::Null
        } else {
            WorkerStderr::Inherit
        };
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Lifecycle state of a pool member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawned,
    AwaitingHandshake,
    Ready,
    Failed,
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawned => "spawned",
            Self::AwaitingHandshake => "awaiting handshake",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A single worker in the pool.
pub struct Worker {
    id: usize,
    /// `None` if the process could not be started.
    proc: Option<Proc>,
    state: WorkerState,
    /// Why the worker failed, once it has.
    failure: Option<Diagnostic>,
}

impl Worker {
    fn spawn(id: usize, command: &WorkerCommand, stderr: WorkerStderr) -> Self {
        match spawn_worker(command, stderr) {
            Ok(proc) => {
                tracing::debug!(worker_id = id, pid = proc.raw_pid(), "Spawned worker");
                Self {
                    id,
                    proc: Some(proc),
                    state: WorkerState::Spawned,
                    failure: None,
                }
            }
            Err(e) => {
                tracing::warn!(worker_id = id, error = %e, "Failed to spawn worker");
                Self {
                    id,
                    proc: None,
                    state: WorkerState::Failed,
                    failure: Some(Diagnostic::reported(e.to_string(), Phase::SpawningWorker)),
                }
            }
        }
    }

    /// Pool index.
    pub fn id(&self) -> usize {
        self.id
    }

    /// OS process id, if the worker was started.
    pub fn pid(&self) -> Option<u32> {
        self.proc.as_ref().map(Proc::raw_pid)
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == WorkerState::Ready
    }

    /// Diagnostic recorded when the worker failed.
    pub fn failure(&self) -> Option<&Diagnostic> {
        self.failure.as_ref()
    }

    pub(crate) fn proc_mut(&mut self) -> Option<&mut Proc> {
        self.proc.as_mut()
    }

    pub(crate) fn set_state(&mut self, state: WorkerState) {
        tracing::trace!(worker_id = self.id, from = %self.state, to = %state, "Worker state change");
        self.state = state;
    }

    pub(crate) fn fail(&mut self, diagnostic: Diagnostic) {
        self.failure = Some(diagnostic);
        self.set_state(WorkerState::Failed);
    }

    /// Whether the process is still alive (non-blocking).
    pub fn is_running(&mut self) -> bool {
        self.proc.as_mut().is_some_and(Proc::is_running)
    }

    /// Reap the process if it has exited, waiting up to `timeout`.
    pub(crate) fn exit_reason(&mut self, timeout: Duration) -> TerminationReason {
        match self.proc.as_mut() {
            Some(proc) => proc
                .wait_timeout(timeout)
                .ok()
                .flatten()
                .unwrap_or(TerminationReason::StillAlive),
            None => TerminationReason::Unknown,
        }
    }
}

/// A fixed-size pool of worker subprocesses running the same command.
pub struct WorkerPool {
    workers: Vec<Worker>,
    command: WorkerCommand,
    options: PoolOptions,
    terminated: bool,
}

impl WorkerPool {
    /// Spawn `n` workers running `command`.
    ///
    /// Individual spawn failures do not fail the pool; those workers start
    /// out `Failed` and surface in the handshake.
    pub fn spawn(command: &WorkerCommand, n: usize, options: PoolOptions) -> Result<Self> {
        if n == 0 {
            return Err(MultirunnerError::InvalidSpec(
                "worker count must be at least 1".to_string(),
            ));
        }

        tracing::info!(workers = n, command = %command, "Spawning worker pool");
        let workers = (0..n)
            .map(|id| Worker::spawn(id, command, options.stderr))
            .collect();

        Ok(Self {
            workers,
            command: command.clone(),
            options,
            terminated: false,
        })
    }

    /// Number of workers in the pool.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub(crate) fn workers_mut(&mut self) -> &mut [Worker] {
        &mut self.workers
    }

    pub(crate) fn worker_mut(&mut self, id: usize) -> Option<&mut Worker> {
        self.workers.get_mut(id)
    }

    /// Process ids of all started workers.
    pub fn pids(&self) -> Vec<u32> {
        self.workers.iter().filter_map(Worker::pid).collect()
    }

    /// Number of workers in the `Ready` state.
    pub fn ready_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_ready()).count()
    }

    /// Whether every worker passed the handshake.
    pub fn all_ready(&self) -> bool {
        !self.workers.is_empty() && self.workers.iter().all(Worker::is_ready)
    }

    /// One diagnostic per worker that is not `Ready`, in pool order.
    pub fn diagnostics(&self) -> Vec<WorkerDiagnostic> {
        self.workers
            .iter()
            .filter(|w| !w.is_ready())
            .map(|w| WorkerDiagnostic {
                worker: w.id(),
                pid: w.pid(),
                diagnostic: w.failure().cloned().unwrap_or_else(|| {
                    Diagnostic::reported(
                        format!("worker is {}", w.state()),
                        Phase::AwaitingHandshake,
                    )
                }),
            })
            .collect()
    }

    /// Count of workers whose process is still alive.
    pub fn live_count(&mut self) -> usize {
        self.workers
            .iter_mut()
            .map(Worker::is_running)
            .filter(|alive| *alive)
            .count()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Stop every worker: close pipes, SIGTERM all, then wait out the grace
    /// period and SIGKILL stragglers. Safe to call more than once.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        // Signal everyone first so the grace periods overlap
        for worker in &mut self.workers {
            if let Some(proc) = worker.proc.as_mut() {
                proc.close_channel();
                if let Err(e) = proc.terminate() {
                    tracing::debug!(worker_id = worker.id, error = %e, "SIGTERM failed");
                }
            }
        }

        let grace = self.options.grace;
        for worker in &mut self.workers {
            if let Some(proc) = worker.proc.as_mut() {
                let reason = proc.finish_stop(grace);
                tracing::debug!(worker_id = worker.id, reason = %reason, "Worker stopped");
            }
            if worker.state != WorkerState::Failed {
                worker.set_state(WorkerState::Terminated);
            }
        }

        tracing::debug!(workers = self.workers.len(), "Worker pool terminated");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(argv: &[&str]) -> WorkerCommand {
        WorkerCommand::new(argv.iter().map(Into::into).collect())
    }

    fn quick() -> PoolOptions {
        PoolOptions::default()
            .quiet_workers(true)
            .grace(Duration::from_millis(500))
    }

    #[test]
    fn test_spawn_exact_count() {
        let mut pool = WorkerPool::spawn(&command(&["cat"]), 3, quick()).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.pids().len(), 3);
        assert!(
            pool.workers()
                .iter()
                .all(|w| w.state() == WorkerState::Spawned)
        );
        assert_eq!(pool.live_count(), 3);
        pool.terminate();
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_unhandshaken_pool_not_ready() {
        let pool = WorkerPool::spawn(&command(&["cat"]), 2, quick()).unwrap();
        assert!(!pool.all_ready());
        let diagnostics = pool.diagnostics();
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics.iter().all(|d| {
            d.pid.is_some() && d.diagnostic.phase() == Some(&Phase::AwaitingHandshake)
        }));
    }

    #[test]
    fn test_spawn_zero_workers_rejected() {
        assert!(WorkerPool::spawn(&command(&["cat"]), 0, quick()).is_err());
    }

    #[test]
    fn test_spawn_failure_recorded_per_worker() {
        let pool =
            WorkerPool::spawn(&command(&["/nonexistent/worker-binary"]), 2, quick()).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.pids().is_empty());
        for worker in pool.workers() {
            assert_eq!(worker.state(), WorkerState::Failed);
            let failure = worker.failure().unwrap();
            assert_eq!(failure.phase(), Some(&Phase::SpawningWorker));
        }
    }

    #[test]
    fn test_terminate_twice() {
        let mut pool = WorkerPool::spawn(&command(&["sleep", "60"]), 2, quick()).unwrap();
        pool.terminate();
        assert!(pool.is_terminated());
        pool.terminate();
        assert_eq!(pool.live_count(), 0);
        assert!(
            pool.workers()
                .iter()
                .all(|w| w.state() == WorkerState::Terminated)
        );
    }

    #[test]
    fn test_terminate_escalates_for_stubborn_workers() {
        let mut pool = WorkerPool::spawn(
            &command(&["sh", "-c", "trap '' TERM; sleep 60"]),
            2,
            PoolOptions::default()
                .quiet_workers(true)
                .grace(Duration::from_millis(200)),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        pool.terminate();
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_terminate_tolerates_exited_workers() {
        let mut pool = WorkerPool::spawn(&command(&["true"]), 2, quick()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        pool.terminate();
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_drop_terminates() {
        let pool = WorkerPool::spawn(&command(&["sleep", "60"]), 2, quick()).unwrap();
        let pids = pool.pids();
        drop(pool);
        for pid in pids {
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
            assert!(alive.is_err(), "pid {pid} still alive");
        }
    }
}
