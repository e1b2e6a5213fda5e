//! Crash analysis for worker subprocesses.
//!
//! Turns wait statuses into human-readable reasons for crash reports.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by SIGKILL, which is usually the OOM killer.
    Killed,
    /// Killed by another signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Killed => "killed by SIGKILL (possibly out of memory)".to_string(),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::Killed,
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// Information about a worker failure during dispatch.
#[derive(Debug)]
pub struct WorkerFailure {
    /// Why the worker terminated.
    pub reason: TerminationReason,
    /// What the worker was doing when it failed.
    pub context: Option<String>,
    /// Additional error message.
    pub message: Option<String>,
}

impl WorkerFailure {
    pub fn new(reason: TerminationReason) -> Self {
        Self {
            reason,
            context: None,
            message: None,
        }
    }

    /// Add context about what the worker was doing.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Add an error message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(ctx) = &self.context {
            write!(f, " while {}", ctx)?;
        }
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_termination_reason_success() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(1).is_success());
        assert!(!TerminationReason::Killed.is_success());
    }

    #[test]
    fn test_analyze_wait_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 0);
        assert_eq!(analyze_wait_status(status), TerminationReason::Exited(0));

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(analyze_wait_status(status), TerminationReason::Killed);

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGSEGV, true);
        assert_eq!(
            analyze_wait_status(status),
            TerminationReason::Signaled(Signal::SIGSEGV)
        );

        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_worker_failure_display() {
        let failure = WorkerFailure::new(TerminationReason::Exited(1))
            .with_context("awaiting a result")
            .with_message("pipe closed");

        let display = failure.to_string();
        assert!(display.contains("exited with code 1"));
        assert!(display.contains("awaiting a result"));
        assert!(display.contains("pipe closed"));
    }
}
