//! Worker subprocess spawning.

use super::proc::Proc;
use crate::error::{MultirunnerError, Result};
use crate::resolver::WorkerCommand;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// Where a worker's standard error goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerStderr {
    /// Share the orchestrator's stderr (default).
    #[default]
    Inherit,
    /// Discard it.
    Null,
}

/// Spawn a worker subprocess running `command`.
///
/// The worker gets piped stdin/stdout and its own process group, so a
/// terminal Ctrl+C reaches the orchestrator only and teardown stays in
/// its hands.
pub fn spawn_worker(command: &WorkerCommand, stderr: WorkerStderr) -> Result<Proc> {
    let mut cmd = Command::new(command.program());
    cmd.args(command.args());

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(match stderr {
        WorkerStderr::Inherit => Stdio::inherit(),
        WorkerStderr::Null => Stdio::null(),
    });
    cmd.process_group(0);

    // Interpreters must not block-buffer protocol lines
    cmd.env("PYTHONUNBUFFERED", "1");

    let child = cmd
        .spawn()
        .map_err(|e| MultirunnerError::Spawn(format!("{}: {}", command, e)))?;

    Proc::from_child(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_spawn_worker_pipes() {
        let command = WorkerCommand::new(vec!["cat".into()]);
        let mut proc = spawn_worker(&command, WorkerStderr::Null).expect("spawn cat");
        assert!(proc.is_running());

        let channel = proc.channel_mut().unwrap();
        channel.send_line("ping").unwrap();
        assert_eq!(
            channel.recv_line(Some(Duration::from_secs(5))).unwrap(),
            Some("ping".to_string())
        );
        proc.stop(Duration::from_secs(1));
    }

    #[test]
    fn test_spawn_worker_own_process_group() {
        let command = WorkerCommand::new(vec!["sleep".into(), "30".into()]);
        let mut proc = spawn_worker(&command, WorkerStderr::Null).expect("spawn sleep");
        let pgid = nix::unistd::getpgid(Some(proc.pid())).unwrap();
        assert_eq!(pgid, proc.pid());
        proc.stop(Duration::from_secs(1));
    }

    #[test]
    fn test_spawn_missing_executable() {
        let command = WorkerCommand::new(vec!["/nonexistent/multirunner-worker".into()]);
        let err = spawn_worker(&command, WorkerStderr::Null).err().unwrap();
        assert!(matches!(err, MultirunnerError::Spawn(_)));
        assert!(err.to_string().contains("/nonexistent/multirunner-worker"));
    }
}
