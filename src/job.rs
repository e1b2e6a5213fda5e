//! Job specifications: what to run and how to reach it.
//!
//! A job spec names an execution type (a preset such as `"python"` or an
//! explicit `{executable, handler}` pair) and carries execution info that is
//! forwarded verbatim to every worker at handshake time.

use crate::error::{MultirunnerError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Handler function invoked per item when the spec names none.
pub const DEFAULT_HANDLER: &str = "main";

/// Per-worker memory estimate when the spec gives none (64 MiB).
pub const DEFAULT_MEMORY_ESTIMATE: u64 = 64 * 1024 * 1024;

/// Per-worker CPU estimate when the spec gives none.
pub const DEFAULT_CPU_ESTIMATE: f64 = 1.0;

/// How worker processes are launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionType {
    /// A named preset, e.g. `"python"` or `"node"`.
    Named(String),
    /// An explicit executable and handler script. Either may be `!preset`
    /// to borrow that part from a preset.
    Explicit {
        executable: Executable,
        handler: String,
    },
}

/// Executable half of an explicit execution type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Executable {
    /// A single program name or path.
    Program(String),
    /// A program followed by leading arguments, e.g. `["python3", "-u"]`.
    Argv(Vec<String>),
}

/// Where a worker finds the code to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeSource {
    /// Source text carried in the spec.
    Inline(String),
    /// A path to a source file readable by the worker.
    Path(PathBuf),
}

impl CodeSource {
    /// Interpret a `code` value: a bare string, or `{type: "string"|"path", data}`.
    pub fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let (kind, data) = match value {
            Value::String(s) => ("string", s.as_str()),
            Value::Object(obj) => {
                let kind = obj
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "code descriptor is missing a string 'type'".to_string())?;
                let data = obj
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "code descriptor is missing a string 'data'".to_string())?;
                (kind, data)
            }
            Value::Null => return Err("no code provided".to_string()),
            other => return Err(format!("code must be a string or object, got {}", other)),
        };

        if data.trim().is_empty() {
            return Err("code is empty".to_string());
        }
        match kind {
            "string" => Ok(Self::Inline(data.to_string())),
            "path" => Ok(Self::Path(PathBuf::from(data))),
            other => Err(format!("{} is not a valid input type", other)),
        }
    }

    /// The descriptor form sent on the wire.
    pub fn to_value(&self) -> Value {
        let (kind, data) = match self {
            Self::Inline(src) => ("string", src.clone()),
            Self::Path(path) => ("path", path.to_string_lossy().into_owned()),
        };
        serde_json::json!({ "type": kind, "data": data })
    }

    /// Read the source text.
    pub fn load(&self) -> std::io::Result<String> {
        match self {
            Self::Inline(src) => Ok(src.clone()),
            Self::Path(path) => {
                if !path.is_file() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} is not a valid local path", path.display()),
                    ));
                }
                std::fs::read_to_string(path)
            }
        }
    }
}

/// Payload forwarded to workers at handshake time.
///
/// Only the fields the orchestrator looks at are typed; everything else is
/// kept in `extra` and sent through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_hook: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecutionInfo {
    /// Execution info with inline source code.
    pub fn inline(code: impl Into<String>) -> Self {
        Self {
            code: Some(Value::String(code.into())),
            ..Default::default()
        }
    }

    /// Execution info pointing at a source file.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            code: Some(CodeSource::Path(path.into()).to_value()),
            ..Default::default()
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_setup_hook(mut self, hook: impl Into<String>) -> Self {
        self.setup_hook = Some(hook.into());
        self
    }

    /// Handler name, defaulting to `main`.
    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or(DEFAULT_HANDLER)
    }
}

/// A complete, validated job specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(alias = "exec_type")]
    pub execution_type: ExecutionType,
    #[serde(alias = "exec_info")]
    pub execution_info: ExecutionInfo,
    /// Expected resident memory per worker, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_estimate: Option<u64>,
    /// Expected CPU cores used per worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_estimate: Option<f64>,
}

impl JobSpec {
    pub fn new(execution_type: ExecutionType, execution_info: ExecutionInfo) -> Self {
        Self {
            execution_type,
            execution_info,
            memory_estimate: None,
            cpu_estimate: None,
        }
    }

    /// Spec for a named preset.
    pub fn preset(name: impl Into<String>, execution_info: ExecutionInfo) -> Self {
        Self::new(ExecutionType::Named(name.into()), execution_info)
    }

    pub fn memory_estimate(&self) -> u64 {
        self.memory_estimate
            .filter(|&m| m > 0)
            .unwrap_or(DEFAULT_MEMORY_ESTIMATE)
    }

    pub fn cpu_estimate(&self) -> f64 {
        self.cpu_estimate
            .filter(|c| c.is_finite() && *c > 0.0)
            .unwrap_or(DEFAULT_CPU_ESTIMATE)
    }
}

/// A spec file as written on disk; any part may be supplied by overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSpecFile {
    #[serde(default, alias = "exec_type")]
    pub execution_type: Option<ExecutionType>,
    #[serde(default, alias = "exec_info")]
    pub execution_info: Option<ExecutionInfo>,
    #[serde(default)]
    pub memory_estimate: Option<u64>,
    #[serde(default)]
    pub cpu_estimate: Option<f64>,
}

impl JobSpecFile {
    /// Load a JSON spec file.
    pub fn load(path: &Path) -> Result<Self> {
        let spec_load = |message: String| MultirunnerError::SpecLoad {
            path: path.display().to_string(),
            message,
        };

        let contents = std::fs::read_to_string(path).map_err(|e| spec_load(e.to_string()))?;
        let value: Value = serde_json::from_str(&contents).map_err(|e| spec_load(e.to_string()))?;
        if !value.is_object() {
            return Err(spec_load("spec must be a JSON object".to_string()));
        }
        serde_json::from_value(value).map_err(|e| spec_load(e.to_string()))
    }
}

/// Command-line replacements for parts of a spec file.
#[derive(Debug, Clone, Default)]
pub struct SpecOverrides {
    pub execution_type: Option<String>,
    pub code_path: Option<PathBuf>,
    pub handler: Option<String>,
    pub setup_hook: Option<String>,
}

impl SpecOverrides {
    /// Merge overrides into `file` and validate the result.
    pub fn apply(self, file: JobSpecFile) -> Result<JobSpec> {
        let mut execution_type = file.execution_type;
        let mut execution_info = file.execution_info;

        if let Some(name) = self.execution_type {
            execution_type = Some(ExecutionType::Named(name));
        }
        if let Some(path) = self.code_path {
            execution_info.get_or_insert_with(Default::default).code =
                Some(CodeSource::Path(path).to_value());
        }
        if let Some(handler) = self.handler {
            execution_info.get_or_insert_with(Default::default).handler = Some(handler);
        }
        if let Some(hook) = self.setup_hook {
            execution_info.get_or_insert_with(Default::default).setup_hook = Some(hook);
        }

        let mut errors = Vec::new();
        if execution_type.is_none() {
            errors.push("You must specify an execution_type");
        }
        if execution_info.is_none() {
            errors.push("You must specify execution_info");
        }
        match (execution_type, execution_info) {
            (Some(execution_type), Some(execution_info)) => Ok(JobSpec {
                execution_type,
                execution_info,
                memory_estimate: file.memory_estimate,
                cpu_estimate: file.cpu_estimate,
            }),
            _ => Err(MultirunnerError::InvalidSpec(errors.join("; "))),
        }
    }
}
