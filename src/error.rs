//! Error types for multirunner.

use crate::protocol::WorkerDiagnostic;
use std::time::Duration;
use thiserror::Error;

/// Main error type for multirunner.
#[derive(Error, Debug)]
pub enum MultirunnerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to load job spec from {path}: {message}")]
    SpecLoad { path: String, message: String },

    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Unknown execution type '{name}'. Available presets: {available}")]
    UnknownPreset { name: String, available: String },

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("{}", describe_handshake_failure(.0))]
    HandshakeFailed(Vec<WorkerDiagnostic>),

    #[error("Worker {worker} crashed: {reason}")]
    WorkerCrash { worker: usize, reason: String },

    #[error("Worker {worker} did not respond within {}s", .timeout.as_secs_f64())]
    WorkerTimeout { worker: usize, timeout: Duration },

    #[error("Protocol violation from worker {worker}: {message}")]
    Protocol { worker: usize, message: String },

    #[error("No worker in the pool is ready to take items")]
    NoReadyWorkers,

    #[error("Interrupted")]
    Cancelled,

    #[error("Invalid input on line {line}: {source}")]
    InvalidInput {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Memory configuration error: {0}")]
    Memory(#[from] crate::memory::MemoryError),
}

impl MultirunnerError {
    /// Diagnostics carried by a failed handshake, if this is one.
    pub fn diagnostics(&self) -> Option<&[WorkerDiagnostic]> {
        match self {
            Self::HandshakeFailed(diags) => Some(diags),
            _ => None,
        }
    }
}

fn describe_handshake_failure(diags: &[WorkerDiagnostic]) -> String {
    match diags.first() {
        Some(first) if diags.len() == 1 => format!("Worker handshake failed: {}", first),
        Some(first) => format!(
            "Worker handshake failed on {} workers; first: {}",
            diags.len(),
            first
        ),
        None => "Worker handshake failed".to_string(),
    }
}

/// Result type alias for multirunner operations.
pub type Result<T> = std::result::Result<T, MultirunnerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Diagnostic, Phase};
    use std::io;

    #[test]
    fn test_unknown_preset_message() {
        let err = MultirunnerError::UnknownPreset {
            name: "ruby".to_string(),
            available: "node, python, sh".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ruby"));
        assert!(msg.contains("node, python, sh"));
    }

    #[test]
    fn test_handshake_failed_single() {
        let err = MultirunnerError::HandshakeFailed(vec![WorkerDiagnostic {
            worker: 0,
            pid: Some(42),
            diagnostic: Diagnostic::reported("Traceback...", Phase::SetupHook),
        }]);
        let msg = err.to_string();
        assert!(msg.contains("handshake failed"));
        assert!(msg.contains("setup hook"));
        assert_eq!(err.diagnostics().map(|d| d.len()), Some(1));
    }

    #[test]
    fn test_handshake_failed_many() {
        let diag = |worker| WorkerDiagnostic {
            worker,
            pid: None,
            diagnostic: Diagnostic::reported("no code", Phase::LoadingCode),
        };
        let err = MultirunnerError::HandshakeFailed(vec![diag(0), diag(1), diag(2)]);
        let msg = err.to_string();
        assert!(msg.contains("3 workers"));
        assert!(msg.contains("loading code"));
    }

    #[test]
    fn test_worker_timeout_message() {
        let err = MultirunnerError::WorkerTimeout {
            worker: 3,
            timeout: Duration::from_millis(1500),
        };
        let msg = err.to_string();
        assert!(msg.contains("Worker 3"));
        assert!(msg.contains("1.5s"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: MultirunnerError = io_err.into();
        assert!(err.to_string().contains("file not found"));
        assert!(err.diagnostics().is_none());
    }

    #[test]
    fn test_invalid_input_keeps_source() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err = MultirunnerError::InvalidInput {
            line: 7,
            source: json_err,
        };
        assert!(err.to_string().contains("line 7"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
