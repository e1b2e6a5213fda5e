//! Handler protocol spoken between the orchestrator and worker processes.
//!
//! Every message is a single UTF-8 line:
//!
//! 1. orchestrator → worker: the job's execution info as JSON
//! 2. worker → orchestrator: `OK`, or `ERROR` followed by a diagnostic line
//! 3. then, per item: one JSON item line in, one [`TaskResult`] line out

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Reply token for a worker that finished loading.
pub const READY_TOKEN: &str = "OK";

/// Reply token for a worker that failed to load; a diagnostic line follows.
pub const ERROR_TOKEN: &str = "ERROR";

/// Stage of worker startup a diagnostic refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Phase {
    /// Execution info was not parseable.
    LoadingSpec,
    /// `code` missing, empty, unreadable or of an unknown type.
    LoadingCode,
    /// Handler could not be found in the loaded code.
    LoadingModule,
    /// The setup hook failed.
    SetupHook,
    /// The worker process could not be started.
    SpawningWorker,
    /// The orchestrator could not read a handshake reply.
    AwaitingHandshake,
    /// Any phase name this crate does not know about.
    Other(String),
}

impl Phase {
    pub fn as_str(&self) -> &str {
        match self {
            Self::LoadingSpec => "loading spec",
            Self::LoadingCode => "loading code",
            Self::LoadingModule => "loading module",
            Self::SetupHook => "setup hook",
            Self::SpawningWorker => "spawning worker",
            Self::AwaitingHandshake => "awaiting handshake",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for Phase {
    fn from(s: String) -> Self {
        match s.as_str() {
            "loading spec" => Self::LoadingSpec,
            "loading code" => Self::LoadingCode,
            "loading module" => Self::LoadingModule,
            "setup hook" => Self::SetupHook,
            "spawning worker" => Self::SpawningWorker,
            "awaiting handshake" => Self::AwaitingHandshake,
            _ => Self::Other(s),
        }
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.as_str().to_string()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure detail for a worker that did not become ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Diagnostic {
    /// Structured `{stack, when}` report.
    Reported { stack: String, when: Phase },
    /// A diagnostic line that was not valid JSON, kept verbatim.
    Raw(String),
}

impl Diagnostic {
    pub fn reported(stack: impl Into<String>, when: Phase) -> Self {
        Self::Reported {
            stack: stack.into(),
            when,
        }
    }

    /// Parse the line following an `ERROR` reply.
    pub fn from_line(line: &str) -> Self {
        let trimmed = line.trim();
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value @ Value::Object(_)) => serde_json::from_value(value.clone())
                .unwrap_or_else(|_| Self::Raw(value.to_string())),
            _ => Self::Raw(trimmed.to_string()),
        }
    }

    /// The phase, when the worker reported one.
    pub fn phase(&self) -> Option<&Phase> {
        match self {
            Self::Reported { when, .. } => Some(when),
            Self::Raw(_) => None,
        }
    }

    /// Serialize to a single line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("Diagnostic serialization failed");
        json.push('\n');
        json
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reported { stack, when } => write!(f, "error when {}: {}", when, stack.trim_end()),
            Self::Raw(raw) => write!(f, "{}", raw),
        }
    }
}

/// A diagnostic attributed to one pool member.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerDiagnostic {
    /// Pool index of the worker.
    pub worker: usize,
    /// OS process id, if the worker was spawned.
    pub pid: Option<u32>,
    pub diagnostic: Diagnostic,
}

impl fmt::Display for WorkerDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "worker {} (pid {}): {}", self.worker, pid, self.diagnostic),
            None => write!(f, "worker {}: {}", self.worker, self.diagnostic),
        }
    }
}

/// First line a worker writes after receiving execution info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Ready,
    /// `ERROR`, or any other unexpected line (kept for diagnostics).
    Failed(String),
}

impl HandshakeReply {
    pub fn from_line(line: &str) -> Self {
        let token = line.trim();
        if token.eq_ignore_ascii_case(READY_TOKEN) {
            Self::Ready
        } else {
            Self::Failed(token.to_string())
        }
    }
}

/// Correlated outcome of processing one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// The original item, unmodified. The orchestrator fills this in from
    /// the item it sent, so a worker that omits it is still understood.
    #[serde(default)]
    pub data: Value,
    /// Integer-coerced handler return value.
    #[serde(default, deserialize_with = "deserialize_exit")]
    pub exit: i64,
    /// Captured standard error of the handler call.
    #[serde(default)]
    pub stderr: String,
    /// Captured standard output of the handler call.
    #[serde(default)]
    pub stdout: String,
}

impl TaskResult {
    pub fn new(data: Value, exit: i64, stdout: String, stderr: String) -> Self {
        Self {
            data,
            exit,
            stderr,
            stdout,
        }
    }

    /// Whether the handler reported success.
    pub fn is_success(&self) -> bool {
        self.exit == 0
    }

    /// Serialize to JSON line (with newline). Keys are emitted sorted.
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("TaskResult serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

fn deserialize_exit<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_exit(&value))
}

/// Coerce a handler return value to an integer exit code.
///
/// Integers pass through, finite floats truncate toward zero, booleans map
/// to 0/1 and integer strings are parsed. Anything else is 0.
pub fn coerce_exit(value: &Value) -> i64 {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i
            } else if let Some(u) = n.as_u64() {
                i64::try_from(u).unwrap_or(0)
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                    .map(|f| f.trunc() as i64)
                    .unwrap_or(0)
            }
        }
        Value::Bool(b) => i64::from(*b),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Encode an item as a request line (with newline).
pub fn encode_item(item: &Value) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(item)?;
    line.push('\n');
    Ok(line)
}

/// Encode execution info as the handshake request line (with newline).
pub fn encode_execution_info<T: Serialize>(info: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(info)?;
    line.push('\n');
    Ok(line)
}

/// The per-call context handed to handlers. Always empty for now.
pub fn handler_context() -> Value {
    Value::Object(serde_json::Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handshake_reply_tokens() {
        assert_eq!(HandshakeReply::from_line("OK\n"), HandshakeReply::Ready);
        assert_eq!(HandshakeReply::from_line("  ok \r\n"), HandshakeReply::Ready);
        assert_eq!(
            HandshakeReply::from_line("ERROR\n"),
            HandshakeReply::Failed("ERROR".to_string())
        );
        assert_eq!(
            HandshakeReply::from_line("Traceback (most recent call last):"),
            HandshakeReply::Failed("Traceback (most recent call last):".to_string())
        );
    }

    #[test]
    fn test_diagnostic_structured() {
        let diag = Diagnostic::from_line(r#"{"stack": "boom", "when": "setup hook"}"#);
        assert_eq!(diag, Diagnostic::reported("boom", Phase::SetupHook));
        assert_eq!(diag.phase(), Some(&Phase::SetupHook));
    }

    #[test]
    fn test_diagnostic_unknown_phase_preserved() {
        let diag = Diagnostic::from_line(r#"{"stack": "x", "when": "writing file"}"#);
        assert_eq!(
            diag.phase(),
            Some(&Phase::Other("writing file".to_string()))
        );
        let line = diag.to_line();
        assert!(line.contains("\"when\":\"writing file\""));
    }

    #[test]
    fn test_diagnostic_raw_text() {
        let diag = Diagnostic::from_line("SyntaxError: unexpected token\n");
        assert_eq!(
            diag,
            Diagnostic::Raw("SyntaxError: unexpected token".to_string())
        );
        assert!(diag.phase().is_none());
    }

    #[test]
    fn test_diagnostic_json_without_fields_is_raw() {
        let diag = Diagnostic::from_line(r#"{"message": "nope"}"#);
        assert!(matches!(diag, Diagnostic::Raw(ref s) if s.contains("nope")));
    }

    #[test]
    fn test_phase_round_trip_names() {
        for phase in [
            Phase::LoadingSpec,
            Phase::LoadingCode,
            Phase::LoadingModule,
            Phase::SetupHook,
        ] {
            assert_eq!(Phase::from(phase.to_string()), phase);
        }
    }

    #[test]
    fn test_task_result_keys_sorted() {
        let result = TaskResult::new(json!({"foo": 1}), 1, "1\n".into(), String::new());
        let line = result.to_line();
        assert!(line.ends_with('\n'));
        let data = line.find("\"data\"").unwrap();
        let exit = line.find("\"exit\"").unwrap();
        let stderr = line.find("\"stderr\"").unwrap();
        let stdout = line.find("\"stdout\"").unwrap();
        assert!(data < exit && exit < stderr && stderr < stdout);
    }

    #[test]
    fn test_task_result_lenient_exit() {
        let parsed =
            TaskResult::from_line(r#"{"data": 1, "exit": "3", "stdout": "", "stderr": ""}"#)
                .unwrap();
        assert_eq!(parsed.exit, 3);

        let parsed = TaskResult::from_line(r#"{"data": 1, "exit": null}"#).unwrap();
        assert_eq!(parsed.exit, 0);
        assert_eq!(parsed.stdout, "");
    }

    #[test]
    fn test_task_result_rejects_non_json() {
        assert!(TaskResult::from_line("not json").is_err());
    }

    #[test]
    fn test_coerce_exit() {
        assert_eq!(coerce_exit(&json!(7)), 7);
        assert_eq!(coerce_exit(&json!(-2)), -2);
        assert_eq!(coerce_exit(&json!(2.9)), 2);
        assert_eq!(coerce_exit(&json!(-2.9)), -2);
        assert_eq!(coerce_exit(&json!(true)), 1);
        assert_eq!(coerce_exit(&json!(false)), 0);
        assert_eq!(coerce_exit(&json!(" 12 ")), 12);
        assert_eq!(coerce_exit(&json!("3.5")), 0);
        assert_eq!(coerce_exit(&json!("hello")), 0);
        assert_eq!(coerce_exit(&json!(null)), 0);
        assert_eq!(coerce_exit(&json!([1, 2])), 0);
        assert_eq!(coerce_exit(&json!({"exit": 1})), 0);
        assert_eq!(coerce_exit(&json!(u64::MAX)), 0);
    }

    #[test]
    fn test_encode_item_single_line() {
        let line = encode_item(&json!({"text": "a\nb"})).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_handler_context_is_empty_object() {
        assert_eq!(handler_context(), json!({}));
    }
}
