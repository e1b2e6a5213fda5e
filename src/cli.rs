//! Command-line interface definitions using clap.

use crate::job::SpecOverrides;
use crate::logging::{LogConfig, LogFormat};
use crate::memory::MemorySize;
use crate::output::OutputFormat;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Fan a stream of JSON items out across a pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "multirunner")]
#[command(author, version = crate::version::long_version(), about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log errors only.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log level (error, warn, info, debug, trace); overrides -v/-q.
    #[arg(long, global = true, value_parser = parse_level_arg)]
    pub log_level: Option<Level>,

    /// Log output format.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormatArg>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job spec over a stream of JSON items.
    Run(RunArgs),

    /// Built-in shell worker (spawned by the `sh` preset).
    #[command(hide = true)]
    Worker,

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "multirunner",
            &mut std::io::stdout(),
        );
    }
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Job spec file (JSON).
    #[arg(short, long)]
    pub spec: Option<PathBuf>,

    /// Input file with one JSON value per line (default: stdin).
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Number of workers (default: estimated from memory and CPU budgets).
    #[arg(short = 'n', long, env = "MULTIRUNNER_WORKERS")]
    pub workers: Option<usize>,

    /// Write results here instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Append to the output file instead of truncating it.
    #[arg(long, requires = "output")]
    pub append: bool,

    /// Execution type preset, e.g. python, node or sh.
    #[arg(short, long)]
    pub exec_type: Option<String>,

    /// Path to the worker code.
    #[arg(short, long)]
    pub code_path: Option<PathBuf>,

    /// Function to call per item.
    #[arg(long)]
    pub handler: Option<String>,

    /// Function to call once when a worker starts.
    #[arg(long)]
    pub setup_hook: Option<String>,

    /// Emit results in input order.
    #[arg(long)]
    pub ordered: bool,

    /// Seconds to wait for each worker's handshake reply.
    #[arg(long, value_parser = parse_secs)]
    pub handshake_timeout: Option<Duration>,

    /// Seconds a worker may spend on one item.
    #[arg(long, value_parser = parse_secs)]
    pub item_timeout: Option<Duration>,

    /// Memory budget for sizing the pool, e.g. 4G or 512M.
    #[arg(long)]
    pub memory_limit: Option<MemorySize>,

    /// CPU budget (cores) for sizing the pool.
    #[arg(long)]
    pub cpu_limit: Option<f64>,

    /// Do not sample worker CPU and memory.
    #[arg(long)]
    pub no_stats: bool,

    /// Stats sampling interval in milliseconds.
    #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u64).range(1..))]
    pub stats_interval: u64,

    /// Stats summary format.
    #[arg(long, value_enum, default_value_t = StatsFormatArg::Plain)]
    pub stats_format: StatsFormatArg,

    /// Report stats per worker process.
    #[arg(long)]
    pub stats_per_worker: bool,

    /// Discard worker stderr.
    #[arg(long)]
    pub quiet_workers: bool,
}

impl RunArgs {
    /// Spec fields given on the command line.
    pub fn overrides(&self) -> SpecOverrides {
        SpecOverrides {
            execution_type: self.exec_type.clone(),
            code_path: self.code_path.clone(),
            handler: self.handler.clone(),
            setup_hook: self.setup_hook.clone(),
        }
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (!self.no_stats).then(|| Duration::from_millis(self.stats_interval))
    }
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", s))?;
    if !(secs.is_finite() && secs > 0.0) {
        return Err(format!("timeout must be positive, got {}", s));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn parse_level_arg(s: &str) -> Result<Level, String> {
    crate::logging::parse_level(s).ok_or_else(|| {
        format!(
            "Unknown log level: '{}'. Valid options: error, warn, info, debug, trace",
            s
        )
    })
}

/// Log format argument.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Stats summary format argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatsFormatArg {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object.
    Json,
}

impl From<StatsFormatArg> for OutputFormat {
    fn from(arg: StatsFormatArg) -> Self {
        match arg {
            StatsFormatArg::Plain => OutputFormat::Plain,
            StatsFormatArg::Json => OutputFormat::Json,
        }
    }
}

impl Cli {
    /// Level implied by -v/-q, if either was given.
    fn flag_level(&self) -> Option<Level> {
        if self.quiet {
            return Some(Level::ERROR);
        }
        match self.verbose {
            0 => None,
            1 => Some(Level::INFO),
            _ => Some(Level::DEBUG),
        }
    }

    /// Logging configuration for the orchestrator. Flags win over
    /// `MULTIRUNNER_LOG*` variables.
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::for_cli().with_ansi(!self.no_color);
        if let Some(level) = self.log_level.or_else(|| self.flag_level()) {
            config = config
                .with_level(level)
                .with_filter(level.to_string().to_lowercase());
        }
        let mut config = config.with_env_overrides();
        if let Some(format) = self.log_format {
            config.format = format.into();
        }
        if let Some(path) = &self.log_file {
            config.file_path = Some(path.clone());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(args: &[&str]) -> RunArgs {
        let argv: Vec<&str> = ["multirunner", "run"].iter().chain(args).copied().collect();
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(run) => run,
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parsing() {
        // Verify the CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let run = run_args(&[]);
        assert!(run.spec.is_none());
        assert!(run.data.is_none());
        assert!(!run.ordered);
        assert_eq!(run.stats_interval(), Some(Duration::from_millis(500)));
        assert_eq!(run.stats_format, StatsFormatArg::Plain);
        assert!(run.handshake_timeout.is_none());
    }

    #[test]
    fn test_run_with_options() {
        let run = run_args(&[
            "-s",
            "job.json",
            "-n",
            "4",
            "-e",
            "python",
            "-c",
            "job.py",
            "--handler",
            "handle",
            "--setup-hook",
            "setup",
            "--ordered",
            "--item-timeout",
            "2.5",
            "--memory-limit",
            "2G",
            "--no-stats",
        ]);
        assert_eq!(run.spec, Some(PathBuf::from("job.json")));
        assert_eq!(run.workers, Some(4));
        assert!(run.ordered);
        assert_eq!(run.item_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(run.memory_limit, Some(MemorySize::from_gib(2)));
        assert_eq!(run.stats_interval(), None);

        let overrides = run.overrides();
        assert_eq!(overrides.execution_type.as_deref(), Some("python"));
        assert_eq!(overrides.code_path, Some(PathBuf::from("job.py")));
        assert_eq!(overrides.handler.as_deref(), Some("handle"));
        assert_eq!(overrides.setup_hook.as_deref(), Some("setup"));
    }

    #[test]
    fn test_append_requires_output() {
        let result = Cli::try_parse_from(["multirunner", "run", "--append"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        assert!(Cli::try_parse_from(["multirunner", "run", "--item-timeout", "0"]).is_err());
        assert!(Cli::try_parse_from(["multirunner", "run", "--item-timeout", "soon"]).is_err());
    }

    #[test]
    fn test_worker_command_hidden() {
        let args = Cli::try_parse_from(["multirunner", "worker"]).unwrap();
        assert!(matches!(args.command, Commands::Worker));
        let help = Cli::command().render_help().to_string();
        assert!(!help.contains("Built-in shell worker"));
        assert!(help.contains("completions"));
    }

    #[test]
    fn test_global_options() {
        let args = Cli::try_parse_from(["multirunner", "run", "-vv", "--no-color"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.no_color);
        let config = args.log_config();
        assert_eq!(config.level, Level::DEBUG);
        assert!(!config.ansi);
    }

    #[test]
    fn test_log_level_beats_verbose() {
        let args =
            Cli::try_parse_from(["multirunner", "-v", "--log-level", "trace", "run"]).unwrap();
        assert_eq!(args.log_config().level, Level::TRACE);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["multirunner", "-v", "-q", "run"]);
        assert!(result.is_err());
    }
}
