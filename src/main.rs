//! multirunner - polyglot worker pool orchestrator

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::{OwoColorize, Stream::Stderr};
use std::fs::File;
use std::io::{BufRead, BufReader, IsTerminal};
use std::sync::atomic::Ordering;
use std::time::Duration;

use multirunner::MultirunnerError;
use multirunner::cli::{Cli, Commands, RunArgs};
use multirunner::job::JobSpecFile;
use multirunner::logging::{self, LogConfig};
use multirunner::output::{self, ResultWriter};
use multirunner::pool::{DispatchOptions, PoolOptions};
use multirunner::runner::{self, JobRunner, RunnerConfig};
use multirunner::{paths, worker};

/// Exit status for spec errors and failed handshakes.
const EXIT_SPEC_ERROR: i32 = 2;
/// Exit status for runtime errors and interruption.
const EXIT_RUNTIME_ERROR: i32 = 1;

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Worker => {
            let mut config = LogConfig::for_worker().with_env_overrides();
            // Workers share the orchestrator's stderr; the log file is its alone
            config.file_path = None;
            logging::init(config);
            worker::run_worker_main()
        }
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
        Commands::Run(args) => {
            logging::init(cli.log_config());
            cmd_run(&cli, args)
        }
    };

    if let Err(e) = result {
        report_error(&e);
        std::process::exit(exit_code(&e));
    }
}

fn report_error(e: &anyhow::Error) {
    eprintln!(
        "{}: {}",
        "error"
            .if_supports_color(Stderr, |text| text.red())
            .if_supports_color(Stderr, |text| text.bold()),
        e
    );
    if let Some(diagnostics) = e
        .downcast_ref::<MultirunnerError>()
        .and_then(MultirunnerError::diagnostics)
    {
        for diagnostic in diagnostics {
            eprintln!(
                "  {}: {}",
                "worker".if_supports_color(Stderr, |text| text.yellow()),
                diagnostic
            );
        }
    }
    // Print the error chain if there are causes
    for cause in e.chain().skip(1) {
        eprintln!(
            "  {}: {}",
            "caused by".if_supports_color(Stderr, |text| text.yellow()),
            cause
        );
    }
}

fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<MultirunnerError>() {
        Some(
            MultirunnerError::SpecLoad { .. }
            | MultirunnerError::InvalidSpec(_)
            | MultirunnerError::UnknownPreset { .. }
            | MultirunnerError::HandshakeFailed(_)
            | MultirunnerError::Memory(_),
        ) => EXIT_SPEC_ERROR,
        _ => EXIT_RUNTIME_ERROR,
    }
}

fn open_input(args: &RunArgs) -> Result<Box<dyn BufRead + Send>> {
    Ok(match &args.data {
        Some(path) => {
            let path = paths::expand_tilde(path);
            let file = File::open(&path)
                .with_context(|| format!("Failed to open input file {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(std::io::stdin())),
    })
}

fn progress_spinner(cli: &Cli) -> Option<ProgressBar> {
    if cli.quiet || !std::io::stderr().is_terminal() {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {pos} items [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    Some(pb)
}

/// Load the spec, run it over the input and write results.
fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let file = match &args.spec {
        Some(path) => JobSpecFile::load(&paths::expand_tilde(path))?,
        None => JobSpecFile::default(),
    };
    let spec = args.overrides().apply(file)?;

    let mut config = RunnerConfig::default()
        .pool_options(PoolOptions::default().quiet_workers(args.quiet_workers))
        .handshake_timeout(args.handshake_timeout)
        .dispatch_options(
            DispatchOptions::default()
                .ordered(args.ordered)
                .response_timeout(args.item_timeout),
        )
        .stats_interval(args.stats_interval())
        .stats_per_worker(args.stats_per_worker);
    config.workers = args.workers;
    config.memory_limit = args.memory_limit;
    config.cpu_limit = args.cpu_limit;

    let runner = JobRunner::new(spec, config);

    let shutdown = runner.shutdown_flag();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, stopping workers...");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let input = open_input(args)?;
    let mut writer = match &args.output {
        Some(path) => ResultWriter::file(&paths::expand_tilde(path), args.append)
            .with_context(|| format!("Failed to open output file {}", path.display()))?,
        None => ResultWriter::stdout(),
    };

    let ready = runner.setup()?;
    tracing::info!(workers = ready.workers(), "Workers ready");

    let spinner = progress_spinner(cli);
    if let Some(pb) = &spinner {
        pb.set_message(format!("across {} workers", ready.workers()));
    }

    let mut run = ready.run_fallible(runner::json_lines(input))?;
    let mut failure = None;
    for result in &mut run {
        match result {
            Ok(result) => {
                writer.write(&result).context("Failed to write result")?;
                if let Some(pb) = &spinner {
                    pb.inc(1);
                }
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    writer.finish().context("Failed to flush results")?;

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let summary = run.finish();
    if !cli.quiet {
        output::print_summary(&summary, args.stats_format.into());
    }

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
