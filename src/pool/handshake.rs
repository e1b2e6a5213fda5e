//! Handshake: deliver execution info to every worker and collect readiness.

use super::manager::{Worker, WorkerPool, WorkerState};
use crate::error::{MultirunnerError, Result};
use crate::job::ExecutionInfo;
use crate::protocol::{self, Diagnostic, ERROR_TOKEN, HandshakeReply, Phase, WorkerDiagnostic};
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// How long to wait for a worker that closed its pipe to be reaped, so the
/// diagnostic can include its exit status.
const EXIT_REAP_WAIT: Duration = Duration::from_millis(200);

/// How often a pending handshake checks the cancel flag.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of handshaking a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeOutcome {
    /// True iff every worker reported ready.
    pub valid: bool,
    /// One entry per failed worker, in pool order.
    pub diagnostics: Vec<WorkerDiagnostic>,
}

impl HandshakeOutcome {
    /// Convert an invalid outcome into [`MultirunnerError::HandshakeFailed`].
    pub fn into_result(self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(MultirunnerError::HandshakeFailed(self.diagnostics))
        }
    }
}

/// Send `info` to every worker and wait for each reply.
///
/// Workers are handshaken concurrently, one scoped thread each. Only workers
/// still in the `Spawned` state are contacted, so calling this twice never
/// re-sends execution info; the second call reports the states reached by
/// the first. `timeout` bounds each read; `None` waits indefinitely.
pub fn handshake(
    pool: &mut WorkerPool,
    info: &ExecutionInfo,
    timeout: Option<Duration>,
) -> Result<HandshakeOutcome> {
    handshake_cancellable(pool, info, timeout, &AtomicBool::new(false))
}

/// Like [`handshake`], but gives up with [`MultirunnerError::Cancelled`] once
/// `cancel` is set. Workers still being waited on are killed so their reads
/// return; the caller is expected to terminate the pool.
pub fn handshake_cancellable(
    pool: &mut WorkerPool,
    info: &ExecutionInfo,
    timeout: Option<Duration>,
    cancel: &AtomicBool,
) -> Result<HandshakeOutcome> {
    let line = protocol::encode_execution_info(info)?;
    let line = line.as_str();
    let total = pool.len();
    let pending: Vec<u32> = pool
        .workers()
        .iter()
        .filter(|w| w.state() == WorkerState::Spawned)
        .filter_map(Worker::pid)
        .collect();
    let finished = AtomicBool::new(false);

    tracing::info!(workers = total, "Handshaking with workers");

    thread::scope(|s| {
        let handles: Vec<_> = pool
            .workers_mut()
            .iter_mut()
            .filter(|w| w.state() == WorkerState::Spawned)
            .map(|worker| s.spawn(move || handshake_worker(worker, line, timeout)))
            .collect();
        s.spawn(|| watch_cancel(cancel, &finished, &pending));

        for handle in handles {
            if handle.join().is_err() {
                tracing::debug!("Handshake thread panicked");
            }
        }
        finished.store(true, Ordering::Relaxed);
    });

    if cancel.load(Ordering::Relaxed) {
        tracing::info!(workers = total, "Handshake cancelled");
        return Err(MultirunnerError::Cancelled);
    }

    let diagnostics = pool.diagnostics();

    let valid = diagnostics.is_empty();
    if valid {
        tracing::info!(workers = total, "All workers ready");
    } else {
        tracing::warn!(
            workers = total,
            failed = diagnostics.len(),
            "Worker handshake failed"
        );
    }

    Ok(HandshakeOutcome { valid, diagnostics })
}

/// Kill every pending worker once `cancel` is set, until `finished`.
fn watch_cancel(cancel: &AtomicBool, finished: &AtomicBool, pids: &[u32]) {
    while !finished.load(Ordering::Relaxed) {
        if cancel.load(Ordering::Relaxed) {
            for &pid in pids {
                let pid = Pid::from_raw(pid as i32);
                if killpg(pid, Signal::SIGKILL).is_err() {
                    let _ = kill(pid, Signal::SIGKILL);
                }
            }
            return;
        }
        thread::sleep(CANCEL_POLL_INTERVAL);
    }
}

fn handshake_worker(worker: &mut Worker, line: &str, timeout: Option<Duration>) {
    worker.set_state(WorkerState::AwaitingHandshake);
    match exchange(worker, line, timeout) {
        Ok(()) => {
            tracing::debug!(worker_id = worker.id(), pid = ?worker.pid(), "Worker ready");
            worker.set_state(WorkerState::Ready);
        }
        Err(diagnostic) => {
            tracing::debug!(
                worker_id = worker.id(),
                pid = ?worker.pid(),
                diagnostic = %diagnostic,
                "Worker failed handshake"
            );
            worker.fail(diagnostic);
        }
    }
}

fn exchange(
    worker: &mut Worker,
    line: &str,
    timeout: Option<Duration>,
) -> std::result::Result<(), Diagnostic> {
    let awaiting = |msg: String| Diagnostic::reported(msg, Phase::AwaitingHandshake);
    let worker_id = worker.id();

    let reply = {
        let channel = worker
            .proc_mut()
            .and_then(|p| p.channel_mut())
            .ok_or_else(|| awaiting("worker pipes are closed".to_string()))?;

        // A worker that already died shows up as EOF on the read below
        if let Err(e) = channel.send_line(line) {
            tracing::debug!(worker_id = worker_id, error = %e, "Failed to send execution info");
        }
        read_reply(channel, timeout)
    };

    match reply {
        Ok(Some(reply)) => match HandshakeReply::from_line(&reply) {
            HandshakeReply::Ready => Ok(()),
            HandshakeReply::Failed(token) if token.eq_ignore_ascii_case(ERROR_TOKEN) => {
                let channel = worker
                    .proc_mut()
                    .and_then(|p| p.channel_mut())
                    .ok_or_else(|| awaiting("worker pipes are closed".to_string()))?;
                match read_reply(channel, timeout) {
                    Ok(Some(detail)) => Err(Diagnostic::from_line(&detail)),
                    Ok(None) => Err(awaiting(
                        "worker replied ERROR without a diagnostic".to_string(),
                    )),
                    Err(e) => Err(awaiting(format!("failed to read diagnostic: {}", e))),
                }
            }
            HandshakeReply::Failed(other) => Err(Diagnostic::Raw(other)),
        },
        Ok(None) => {
            let reason = worker.exit_reason(EXIT_REAP_WAIT);
            Err(awaiting(format!("worker {} before replying", reason)))
        }
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(awaiting(format!(
            "no reply within {}s",
            timeout.unwrap_or_default().as_secs_f64()
        ))),
        Err(e) => Err(awaiting(format!("failed to read reply: {}", e))),
    }
}

fn read_reply(
    channel: &mut super::proc::Channel,
    timeout: Option<Duration>,
) -> io::Result<Option<String>> {
    // Blank lines before the reply are noise from chatty interpreters
    loop {
        match channel.recv_line(timeout)? {
            Some(line) if line.trim().is_empty() => continue,
            other => return Ok(other),
        }
    }
}
