//! Built-in shell worker.
//!
//! Runs when `multirunner worker` is invoked, which is what the `sh` preset
//! resolves to. It speaks the handler protocol on stdin/stdout: execution
//! info in, `OK` or `ERROR` out, then one result line per item line.
//!
//! The `code` is POSIX shell that defines functions. Every handler call runs
//! in a fresh `sh` with the item JSON as `$1` (and on stdin) and the context
//! as `$2`; its stdout and stderr are captured through that call's own
//! pipes. The function's exit status becomes the result's `exit`.

use crate::job::{CodeSource, ExecutionInfo};
use crate::pool::ipc::{LineReader, LineWriter, PipeFd};
use crate::protocol::{self, Diagnostic, ERROR_TOKEN, Phase, READY_TOKEN, TaskResult};
use serde_json::Value;
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use thiserror::Error;

/// Shell used to run worker code.
const SHELL: &str = "sh";

#[derive(Debug, Error)]
enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Load(Diagnostic),
}

/// Loaded shell code plus the function to call per item.
#[derive(Debug, Clone)]
pub struct ShellModule {
    code: String,
    handler: String,
}

/// Output of one shell invocation.
struct Captured {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Run `script` in a fresh shell with `args` as positional parameters and
/// `stdin` fed to it, capturing both output streams.
fn run_shell(script: &str, args: &[&str], stdin: Option<&str>) -> io::Result<Captured> {
    let mut child = Command::new(SHELL)
        .arg("-c")
        .arg(script)
        .arg(SHELL)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Feed stdin from a separate thread so a handler that never reads it
    // cannot wedge us against a full output pipe.
    let feeder = match (child.stdin.take(), stdin) {
        (Some(mut pipe), Some(input)) => {
            let input = input.to_string();
            Some(thread::spawn(move || {
                // The handler may exit without reading; EPIPE is fine.
                let _ = pipe.write_all(input.as_bytes());
            }))
        }
        _ => None,
    };

    let output = child.wait_with_output()?;
    if let Some(feeder) = feeder {
        let _ = feeder.join();
    }

    Ok(Captured {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn failure_text(captured: &Captured, fallback: String) -> String {
    let stderr = captured.stderr.trim();
    if stderr.is_empty() {
        fallback
    } else {
        stderr.to_string()
    }
}

impl ShellModule {
    /// Load a module from the handshake line.
    pub fn load(line: &str) -> Result<Self, Diagnostic> {
        let info: ExecutionInfo = serde_json::from_str(line.trim())
            .map_err(|e| Diagnostic::reported(e.to_string(), Phase::LoadingSpec))?;

        let code_value = info.code.clone().unwrap_or(Value::Null);
        let code = CodeSource::from_value(&code_value)
            .and_then(|source| source.load().map_err(|e| e.to_string()))
            .map_err(|e| Diagnostic::reported(e, Phase::LoadingCode))?;

        let handler = info.handler_name().to_string();
        if !is_identifier(&handler) {
            return Err(Diagnostic::reported(
                format!("'{}' is not a valid shell function name", handler),
                Phase::LoadingModule,
            ));
        }

        let syntax = Command::new(SHELL)
            .arg("-n")
            .arg("-c")
            .arg(&code)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| Diagnostic::reported(e.to_string(), Phase::LoadingModule))?;
        if !syntax.status.success() {
            return Err(Diagnostic::reported(
                String::from_utf8_lossy(&syntax.stderr).trim().to_string(),
                Phase::LoadingModule,
            ));
        }

        let module = Self { code, handler };
        module.check_defined()?;
        if let Some(hook) = info.setup_hook.as_deref() {
            module.run_setup_hook(hook)?;
        }

        tracing::debug!(handler = %module.handler, "Shell module loaded");
        Ok(module)
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    fn check_defined(&self) -> Result<(), Diagnostic> {
        let script = format!("{}\ncommand -v {} >/dev/null", self.code, self.handler);
        let captured = run_shell(&script, &[], None)
            .map_err(|e| Diagnostic::reported(e.to_string(), Phase::LoadingModule))?;
        if captured.status.success() {
            Ok(())
        } else {
            Err(Diagnostic::reported(
                failure_text(
                    &captured,
                    format!("handler '{}' is not defined", self.handler),
                ),
                Phase::LoadingModule,
            ))
        }
    }

    fn run_setup_hook(&self, hook: &str) -> Result<(), Diagnostic> {
        if !is_identifier(hook) {
            return Err(Diagnostic::reported(
                format!("'{}' is not a valid shell function name", hook),
                Phase::SetupHook,
            ));
        }
        let captured = run_shell(&format!("{}\n{}", self.code, hook), &[], None)
            .map_err(|e| Diagnostic::reported(e.to_string(), Phase::SetupHook))?;
        // Output of a successful hook is discarded.
        if captured.status.success() {
            Ok(())
        } else {
            Err(Diagnostic::reported(
                failure_text(
                    &captured,
                    format!("setup hook '{}' {}", hook, describe_status(captured.status)),
                ),
                Phase::SetupHook,
            ))
        }
    }

    /// Run the handler on one item line and build its result.
    pub fn process(&self, line: &str) -> TaskResult {
        let item: Value = match serde_json::from_str(line) {
            Ok(item) => item,
            Err(e) => {
                return TaskResult::new(
                    Value::String(line.to_string()),
                    1,
                    String::new(),
                    format!("invalid item: {}\n", e),
                );
            }
        };

        let context = protocol::handler_context().to_string();
        let script = format!("{}\n{} \"$@\"", self.code, self.handler);
        let mut stdin = line.to_string();
        stdin.push('\n');

        match run_shell(&script, &[line, &context], Some(&stdin)) {
            Ok(captured) => {
                let mut stderr = captured.stderr;
                let exit = match (captured.status.code(), captured.status.signal()) {
                    (Some(code), _) => i64::from(code),
                    (None, signal) => {
                        if !stderr.is_empty() && !stderr.ends_with('\n') {
                            stderr.push('\n');
                        }
                        stderr.push_str(&format!(
                            "handler '{}' was killed by signal {}\n",
                            self.handler,
                            signal.unwrap_or_default()
                        ));
                        1
                    }
                };
                TaskResult::new(item, exit, captured.stdout, stderr)
            }
            Err(e) => TaskResult::new(
                item,
                1,
                String::new(),
                format!("failed to run handler '{}': {}\n", self.handler, e),
            ),
        }
    }
}

fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with status {}", code),
        (None, Some(signal)) => format!("was killed by signal {}", signal),
        (None, None) => "failed".to_string(),
    }
}

fn serve(reader: &mut LineReader, writer: &mut LineWriter) -> Result<(), WorkerError> {
    let Some(spec_line) = reader.read_line_owned()? else {
        // Closed before the handshake
        return Ok(());
    };

    let module = match ShellModule::load(&spec_line) {
        Ok(module) => module,
        Err(diagnostic) => {
            writer.write_line(ERROR_TOKEN)?;
            writer.write_line(&diagnostic.to_line())?;
            return Err(WorkerError::Load(diagnostic));
        }
    };
    writer.write_line(READY_TOKEN)?;

    while let Some(line) = reader.read_line()? {
        if line.trim().is_empty() {
            continue;
        }
        let result = module.process(line);
        writer.write_line(&result.to_line())?;
    }
    Ok(())
}

/// Run the worker on this process's stdin/stdout and exit.
///
/// Exits 0 when the orchestrator closes stdin, 1 after a failed load or a
/// broken pipe.
pub fn run_worker_main() -> ! {
    // Pipe errors surface as io::Error instead of killing us.
    // SAFETY: installing SIG_IGN has no handler code to race with.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let pipes = io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .and_then(|stdin| Ok((stdin, io::stdout().as_fd().try_clone_to_owned()?)));
    let (stdin_fd, stdout_fd) = match pipes {
        Ok(fds) => fds,
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    };

    let mut reader = LineReader::new(PipeFd::new(stdin_fd));
    let mut writer = LineWriter::new(PipeFd::new(stdout_fd));

    match serve(&mut reader, &mut writer) {
        Ok(()) => std::process::exit(0),
        Err(WorkerError::Load(diagnostic)) => {
            tracing::debug!(diagnostic = %diagnostic, "Worker failed to load");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_line(info: Value) -> String {
        info.to_string()
    }

    fn load(info: Value) -> Result<ShellModule, Diagnostic> {
        ShellModule::load(&spec_line(info))
    }

    const ECHO: &str = r#"main() { printf '%s' "$1"; }"#;

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("main"));
        assert!(is_identifier("_private2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("rm -rf"));
        assert!(!is_identifier("a;b"));
    }

    #[test]
    fn test_load_inline_code() {
        let module = load(json!({"code": ECHO})).unwrap();
        assert_eq!(module.handler(), "main");
    }

    #[test]
    fn test_load_code_descriptor_and_custom_handler() {
        let module = load(json!({
            "code": {"type": "string", "data": "handle() { :; }"},
            "handler": "handle"
        }))
        .unwrap();
        assert_eq!(module.handler(), "handle");
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.sh");
        std::fs::write(&path, ECHO).unwrap();
        let module = load(json!({"code": {"type": "path", "data": path}})).unwrap();
        assert_eq!(module.process("7").stdout, "7");
    }

    #[test]
    fn test_load_phases() {
        let phase = |info: Value| load(info).unwrap_err().phase().cloned();

        assert_eq!(
            ShellModule::load("not json").unwrap_err().phase(),
            Some(&Phase::LoadingSpec)
        );
        assert_eq!(phase(json!({})), Some(Phase::LoadingCode));
        assert_eq!(phase(json!({"code": ""})), Some(Phase::LoadingCode));
        assert_eq!(
            phase(json!({"code": {"type": "url", "data": "x"}})),
            Some(Phase::LoadingCode)
        );
        assert_eq!(
            phase(json!({"code": {"type": "path", "data": "/nonexistent/job.sh"}})),
            Some(Phase::LoadingCode)
        );
        assert_eq!(
            phase(json!({"code": ECHO, "handler": "not a name"})),
            Some(Phase::LoadingModule)
        );
        assert_eq!(
            phase(json!({"code": "main() {"})),
            Some(Phase::LoadingModule)
        );
        assert_eq!(
            phase(json!({"code": ECHO, "handler": "missing_fn"})),
            Some(Phase::LoadingModule)
        );
    }

    #[test]
    fn test_setup_hook() {
        let ok = json!({"code": format!("{}\nsetup() {{ echo noisy; }}", ECHO), "setup_hook": "setup"});
        assert!(load(ok).is_ok());

        let failing = json!({
            "code": format!("{}\nsetup() {{ echo 'no database' >&2; return 3; }}", ECHO),
            "setup_hook": "setup"
        });
        let diag = load(failing).unwrap_err();
        assert_eq!(diag.phase(), Some(&Phase::SetupHook));
        assert!(diag.to_string().contains("no database"));

        let missing = json!({"code": ECHO, "setup_hook": "nope"});
        assert_eq!(load(missing).unwrap_err().phase(), Some(&Phase::SetupHook));
    }

    #[test]
    fn test_process_captures_output_and_exit() {
        let module = load(json!({
            "code": r#"main() { echo "out $1"; echo "err" >&2; return 4; }"#
        }))
        .unwrap();
        let result = module.process(r#"{"foo":1}"#);
        assert_eq!(result.data, json!({"foo": 1}));
        assert_eq!(result.exit, 4);
        assert_eq!(result.stdout, "out {\"foo\":1}\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[test]
    fn test_process_item_on_stdin_and_context() {
        let module = load(json!({"code": r#"main() { cat; printf '%s' "$2"; }"#})).unwrap();
        let result = module.process("[1,2]");
        assert_eq!(result.stdout, "[1,2]\n{}");
        assert_eq!(result.exit, 0);
    }

    #[test]
    fn test_process_calls_are_isolated() {
        let module = load(json!({"code": r#"main() { echo "$1"; }"#})).unwrap();
        let first = module.process("1");
        let second = module.process("2");
        assert_eq!(first.stdout, "1\n");
        assert_eq!(second.stdout, "2\n");
    }

    #[test]
    fn test_process_signal_is_an_error() {
        let module = load(json!({"code": "main() { kill -9 $$; }"})).unwrap();
        let result = module.process("1");
        assert_eq!(result.exit, 1);
        assert!(result.stderr.contains("signal 9"));
    }

    #[test]
    fn test_process_invalid_item() {
        let module = load(json!({"code": ECHO})).unwrap();
        let result = module.process("{nope");
        assert_eq!(result.exit, 1);
        assert!(result.stderr.contains("invalid item"));
    }
}
