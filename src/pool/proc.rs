//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its IPC channel and reaping state.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{MultirunnerError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::io;
use std::time::{Duration, Instant};

/// How often a stopping worker is polled for exit.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Request/response pipes of one worker: its stdin and stdout.
pub struct Channel {
    writer: LineWriter,
    reader: LineReader,
}

impl Channel {
    pub fn new(stdin: PipeFd, stdout: PipeFd) -> Self {
        Self {
            writer: LineWriter::new(stdin),
            reader: LineReader::new(stdout),
        }
    }

    /// Write one line to the worker.
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_line(line)
    }

    /// Read one line from the worker, `None` on EOF.
    pub fn recv_line(&mut self, timeout: Option<Duration>) -> io::Result<Option<String>> {
        Ok(self.reader.read_line_timeout(timeout)?.map(String::from))
    }
}

/// Handle to a worker subprocess.
pub struct Proc {
    pid: Pid,
    /// `None` while a dispatch lane holds the pipes, or once closed.
    channel: Option<Channel>,
    /// Set once the process has been reaped.
    exit: Option<TerminationReason>,
}

impl Proc {
    /// Create from a spawned `std::process::Child`.
    ///
    /// Takes ownership of the child's stdin and stdout.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MultirunnerError::Spawn("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MultirunnerError::Spawn("child stdout not captured".into()))?;

        Ok(Self {
            pid,
            channel: Some(Channel::new(stdin.into(), stdout.into())),
            exit: None,
        })
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Process ID as an unsigned integer.
    pub fn raw_pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Borrow the worker's pipes, if they are still held here.
    pub fn channel_mut(&mut self) -> Option<&mut Channel> {
        self.channel.as_mut()
    }

    /// Hand the pipes to a dispatch lane.
    pub fn take_channel(&mut self) -> Option<Channel> {
        self.channel.take()
    }

    /// Close both pipes. A protocol-conforming worker exits on stdin EOF.
    pub fn close_channel(&mut self) {
        self.channel = None;
    }

    /// Whether the process has been reaped.
    pub fn is_reaped(&self) -> bool {
        self.exit.is_some()
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Try to reap the process without blocking.
    ///
    /// Returns `None` if it is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = &self.exit {
            return Ok(Some(reason.clone()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(self.record_exit(analyze_wait_status(status)))),
            Err(Errno::ECHILD) => Ok(Some(self.record_exit(TerminationReason::Unknown))),
            Err(e) => Err(MultirunnerError::Io(io::Error::from_raw_os_error(e as i32))),
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = &self.exit {
            return Ok(reason.clone());
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => return Ok(self.record_exit(analyze_wait_status(status))),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(self.record_exit(TerminationReason::Unknown)),
                Err(e) => return Err(MultirunnerError::Io(io::Error::from_raw_os_error(e as i32))),
            }
        }
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<TerminationReason>> {
        let start = Instant::now();
        loop {
            if let Some(reason) = self.try_wait()? {
                return Ok(Some(reason));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(REAP_POLL_INTERVAL);
        }
    }

    /// Send SIGTERM to the process. A no-op once reaped.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        self.signal(Signal::SIGKILL)?;
        self.wait()
    }

    /// Signal the worker's process group, which also reaches anything the
    /// worker started; falls back to the pid alone when it leads no group.
    fn signal(&self, sig: Signal) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        let sent = match signal::killpg(self.pid, sig) {
            Err(Errno::ESRCH) | Err(Errno::EPERM) => signal::kill(self.pid, sig),
            other => other,
        };
        match sent {
            // Exited but not yet reaped
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(MultirunnerError::Io(io::Error::from_raw_os_error(e as i32))),
        }
    }

    /// Stop the worker: SIGTERM, wait up to `grace`, then SIGKILL and reap.
    ///
    /// Idempotent and infallible: errors are logged and swallowed.
    pub fn stop(&mut self, grace: Duration) -> TerminationReason {
        if let Some(reason) = &self.exit {
            return reason.clone();
        }
        if let Err(e) = self.terminate() {
            tracing::debug!(pid = self.pid.as_raw(), error = %e, "SIGTERM failed");
        }
        self.finish_stop(grace)
    }

    /// Second half of [`stop`](Self::stop), for callers that already signalled.
    pub fn finish_stop(&mut self, grace: Duration) -> TerminationReason {
        match self.wait_timeout(grace) {
            Ok(Some(reason)) => reason,
            Ok(None) | Err(_) => {
                tracing::debug!(pid = self.pid.as_raw(), "Worker ignored SIGTERM, sending SIGKILL");
                self.kill().unwrap_or_else(|e| {
                    tracing::debug!(pid = self.pid.as_raw(), error = %e, "SIGKILL failed");
                    self.record_exit(TerminationReason::Unknown)
                })
            }
        }
    }

    fn record_exit(&mut self, reason: TerminationReason) -> TerminationReason {
        self.exit = Some(reason.clone());
        reason
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.exit.is_none() {
            self.close_channel();
            self.stop(Duration::from_millis(100));
        }
    }
}
