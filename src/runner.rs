//! Job runner: resolve, spawn, handshake, dispatch and sample stats.
//!
//! ```no_run
//! use multirunner::job::{ExecutionInfo, JobSpec};
//! use multirunner::runner::{JobRunner, RunnerConfig};
//! use serde_json::json;
//!
//! # fn main() -> multirunner::Result<()> {
//! let spec = JobSpec::preset("sh", ExecutionInfo::inline(r#"main() { echo "$1"; }"#));
//! let runner = JobRunner::new(spec, RunnerConfig::default().workers(2));
//! let mut run = runner.setup()?.run(vec![json!(1), json!(2)])?;
//! for result in &mut run {
//!     println!("{}", result?.stdout);
//! }
//! let summary = run.finish();
//! assert_eq!(summary.items_processed, 2);
//! # Ok(())
//! # }
//! ```

use crate::error::{MultirunnerError, Result};
use crate::job::JobSpec;
use crate::memory::{self, MemorySize};
use crate::pool::{self, DispatchOptions, PoolOptions, ResultStream, WorkerPool};
use crate::protocol::TaskResult;
use crate::resolver::{self, Presets, WorkerCommand};
use crate::stats::{AverageStats, DEFAULT_SAMPLE_INTERVAL, StatsCollector};
use serde::Serialize;
use serde_json::Value;
use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Configuration for a [`JobRunner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Fixed worker count; `None` sizes the pool from the spec's estimates.
    pub workers: Option<usize>,
    /// Memory budget for sizing (default: 90% of system memory).
    pub memory_limit: Option<MemorySize>,
    /// CPU budget for sizing (default: available parallelism).
    pub cpu_limit: Option<f64>,
    pub pool: PoolOptions,
    /// Bound on each handshake reply; `None` waits indefinitely.
    pub handshake_timeout: Option<Duration>,
    pub dispatch: DispatchOptions,
    /// Sampling interval; `None` disables the stats collector.
    pub stats_interval: Option<Duration>,
    /// Report stats per worker instead of one pooled mean.
    pub stats_per_worker: bool,
    pub presets: Presets,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            memory_limit: None,
            cpu_limit: None,
            pool: PoolOptions::default(),
            handshake_timeout: None,
            dispatch: DispatchOptions::default(),
            stats_interval: Some(DEFAULT_SAMPLE_INTERVAL),
            stats_per_worker: false,
            presets: Presets::builtin(),
        }
    }
}

impl RunnerConfig {
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = Some(n);
        self
    }

    pub fn memory_limit(mut self, limit: MemorySize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    pub fn cpu_limit(mut self, limit: f64) -> Self {
        self.cpu_limit = Some(limit);
        self
    }

    pub fn pool_options(mut self, options: PoolOptions) -> Self {
        self.pool = options;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn dispatch_options(mut self, options: DispatchOptions) -> Self {
        self.dispatch = options;
        self
    }

    pub fn stats_interval(mut self, interval: Option<Duration>) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn stats_per_worker(mut self, per_worker: bool) -> Self {
        self.stats_per_worker = per_worker;
        self
    }

    pub fn presets(mut self, presets: Presets) -> Self {
        self.presets = presets;
        self
    }
}

/// Runs one job spec against a pool of workers.
pub struct JobRunner {
    spec: JobSpec,
    config: RunnerConfig,
    shutdown: Arc<AtomicBool>,
}

impl JobRunner {
    pub fn new(spec: JobSpec, config: RunnerConfig) -> Self {
        let shutdown = config
            .dispatch
            .cancel
            .clone()
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
        Self {
            spec,
            config,
            shutdown,
        }
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Flag that stops a running dispatch when set, for signal handlers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Request that a running dispatch stop.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Pool size: the configured count, or an estimate from the budgets.
    pub fn worker_count(&self) -> Result<usize> {
        if let Some(n) = self.config.workers {
            if n == 0 {
                return Err(MultirunnerError::InvalidSpec(
                    "worker count must be at least 1".to_string(),
                ));
            }
            return Ok(n);
        }

        let memory_limit = self
            .config
            .memory_limit
            .unwrap_or_else(memory::default_memory_limit);
        let cpu_limit = self.config.cpu_limit.unwrap_or_else(memory::default_cpu_limit);
        let n = memory::estimate_worker_count(
            memory_limit,
            MemorySize::from_bytes(self.spec.memory_estimate()),
            cpu_limit,
            self.spec.cpu_estimate(),
        )?;
        tracing::debug!(
            workers = n,
            memory_limit = %memory_limit,
            cpu_limit,
            "Estimated worker count"
        );
        Ok(n)
    }

    /// The command each worker runs.
    pub fn command(&self) -> Result<WorkerCommand> {
        resolver::resolve(&self.spec.execution_type, &self.config.presets)
    }

    /// Spawn the pool and handshake every worker.
    ///
    /// Fails with [`MultirunnerError::HandshakeFailed`] if any worker did not
    /// load; the pool is terminated before returning.
    #[tracing::instrument(skip_all)]
    pub fn setup(&self) -> Result<ReadyPool> {
        let command = self.command()?;
        let n = self.worker_count()?;
        let mut pool = WorkerPool::spawn(&command, n, self.config.pool.clone())?;

        let outcome = match pool::handshake_cancellable(
            &mut pool,
            &self.spec.execution_info,
            self.config.handshake_timeout,
            &self.shutdown,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                pool.terminate();
                return Err(e);
            }
        };
        if !outcome.valid {
            pool.terminate();
            return Err(MultirunnerError::HandshakeFailed(outcome.diagnostics));
        }

        Ok(ReadyPool {
            pool,
            dispatch: self
                .config
                .dispatch
                .clone()
                .cancel_flag(Arc::clone(&self.shutdown)),
            stats_interval: self.config.stats_interval,
            stats_per_worker: self.config.stats_per_worker,
        })
    }
}

/// A pool whose workers all passed the handshake.
pub struct ReadyPool {
    pool: WorkerPool,
    dispatch: DispatchOptions,
    stats_interval: Option<Duration>,
    stats_per_worker: bool,
}

impl ReadyPool {
    pub fn workers(&self) -> usize {
        self.pool.len()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.pool.pids()
    }

    /// Start dispatching `items`.
    pub fn run<I>(self, items: I) -> Result<Run>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.run_fallible(items.into_iter().map(Ok))
    }

    /// Like [`run`](Self::run) for sources that can fail, such as a parser
    /// over an input file.
    pub fn run_fallible<I>(self, items: I) -> Result<Run>
    where
        I: IntoIterator<Item = Result<Value>>,
        I::IntoIter: Send + 'static,
    {
        let workers = self.pool.len();
        let stats = match self.stats_interval {
            Some(interval) => match StatsCollector::start(self.pool.pids(), interval) {
                Ok(collector) => Some(collector),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not start stats collector");
                    None
                }
            },
            None => None,
        };

        let stream = pool::dispatch_fallible(self.pool, items, self.dispatch)?;
        Ok(Run {
            stream,
            stats,
            stats_per_worker: self.stats_per_worker,
            workers,
            started: Instant::now(),
            items_processed: 0,
            items_failed: 0,
            interrupted: false,
        })
    }
}

/// A dispatch in progress. Iterate it for results, then [`finish`](Run::finish).
pub struct Run {
    stream: ResultStream,
    stats: Option<StatsCollector>,
    stats_per_worker: bool,
    workers: usize,
    started: Instant,
    items_processed: u64,
    items_failed: u64,
    interrupted: bool,
}

impl Run {
    pub fn items_processed(&self) -> u64 {
        self.items_processed
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stats gathered so far, if the collector is running.
    pub fn average_stats(&self, per_pid: bool) -> Option<AverageStats> {
        self.stats.as_ref().map(|s| s.average_stats(per_pid))
    }

    /// Tear the pool down, stop sampling and summarize.
    pub fn finish(mut self) -> RunSummary {
        self.stream.close();
        let stats = self.stats.as_mut().map(|collector| {
            collector.stop();
            collector.average_stats(self.stats_per_worker)
        });

        let summary = RunSummary {
            workers: self.workers,
            items_processed: self.items_processed,
            items_failed: self.items_failed,
            elapsed: self.started.elapsed(),
            stats: stats.filter(AverageStats::is_available),
            was_interrupted: self.interrupted,
        };
        tracing::info!(
            workers = summary.workers,
            items = summary.items_processed,
            failed = summary.items_failed,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Run finished"
        );
        summary
    }
}

impl Iterator for Run {
    type Item = Result<TaskResult>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.stream.next();
        match &next {
            Some(Ok(result)) => {
                self.items_processed += 1;
                if !result.is_success() {
                    self.items_failed += 1;
                }
            }
            Some(Err(MultirunnerError::Cancelled)) => self.interrupted = true,
            _ => {}
        }
        next
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub workers: usize,
    /// Results received.
    pub items_processed: u64,
    /// Results with a non-zero exit.
    pub items_failed: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    /// Resource averages; `None` when disabled or nothing was sampled.
    pub stats: Option<AverageStats>,
    /// Whether the run was cancelled before the input was drained.
    pub was_interrupted: bool,
}

/// Items from a reader holding one JSON value per line.
///
/// Blank lines are skipped. A line that is not JSON yields
/// [`MultirunnerError::InvalidInput`] with its 1-based line number.
pub fn json_lines<R>(reader: R) -> impl Iterator<Item = Result<Value>> + Send + 'static
where
    R: BufRead + Send + 'static,
{
    reader
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| match line {
            Err(e) => Some(Err(MultirunnerError::Io(e))),
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(serde_json::from_str(&line).map_err(|source| {
                MultirunnerError::InvalidInput {
                    line: idx + 1,
                    source,
                }
            })),
        })
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ExecutionInfo, ExecutionType};

    fn spec() -> JobSpec {
        JobSpec::preset("sh", ExecutionInfo::inline("main() { :; }"))
    }

    #[test]
    fn test_explicit_worker_count() {
        let runner = JobRunner::new(spec(), RunnerConfig::default().workers(3));
        assert_eq!(runner.worker_count().unwrap(), 3);

        let runner = JobRunner::new(spec(), RunnerConfig::default().workers(0));
        assert!(matches!(
            runner.worker_count(),
            Err(MultirunnerError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_estimated_worker_count() {
        let mut spec = spec();
        spec.memory_estimate = Some(256 * 1024 * 1024);
        spec.cpu_estimate = Some(0.5);

        let runner = JobRunner::new(
            spec,
            RunnerConfig::default()
                .memory_limit(MemorySize::from_gib(1))
                .cpu_limit(8.0),
        );
        // min(1024/256, 8/0.5) = 4
        assert_eq!(runner.worker_count().unwrap(), 4);
    }

    #[test]
    fn test_unknown_preset_fails_setup() {
        let spec = JobSpec::new(
            ExecutionType::Named("cobol".into()),
            ExecutionInfo::inline("x"),
        );
        let runner = JobRunner::new(spec, RunnerConfig::default().workers(1));
        assert!(matches!(
            runner.setup(),
            Err(MultirunnerError::UnknownPreset { .. })
        ));
    }

    #[test]
    fn test_shutdown_during_handshake_cancels_setup() {
        let presets = Presets::new().insert(
            "hang",
            crate::resolver::Preset::new(["sh", "-c", "read spec; sleep 30"], None),
        );
        let spec = JobSpec::preset("hang", ExecutionInfo::inline("main() { :; }"));
        let runner = JobRunner::new(
            spec,
            RunnerConfig::default()
                .workers(2)
                .presets(presets)
                .pool_options(PoolOptions::default().quiet_workers(true))
                .stats_interval(None),
        );

        let flag = runner.shutdown_flag();
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            flag.store(true, Ordering::SeqCst);
        });
        let started = std::time::Instant::now();
        let result = runner.setup();
        setter.join().unwrap();

        assert!(matches!(result, Err(MultirunnerError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_shutdown_flag_shared_with_dispatch() {
        let flag = Arc::new(AtomicBool::new(false));
        let runner = JobRunner::new(
            spec(),
            RunnerConfig::default().dispatch_options(DispatchOptions::default().cancel_flag(Arc::clone(&flag))),
        );
        runner.request_shutdown();
        assert!(flag.load(Ordering::SeqCst));
        assert!(runner.shutdown_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn test_json_lines_skips_blanks_and_numbers_lines() {
        let input = "{\"a\": 1}\n\n  \n[2]\nnope\n\"s\"\n";
        let items: Vec<Result<Value>> = json_lines(std::io::Cursor::new(input)).collect();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].as_ref().unwrap(), &serde_json::json!({"a": 1}));
        assert_eq!(items[1].as_ref().unwrap(), &serde_json::json!([2]));
        match &items[2] {
            Err(MultirunnerError::InvalidInput { line, .. }) => assert_eq!(*line, 5),
            other => panic!("expected invalid input, got {:?}", other),
        }
        assert_eq!(items[3].as_ref().unwrap(), &serde_json::json!("s"));
    }

    #[test]
    fn test_summary_serializes_elapsed_as_seconds() {
        let summary = RunSummary {
            workers: 2,
            items_processed: 3,
            items_failed: 1,
            elapsed: Duration::from_millis(1500),
            stats: None,
            was_interrupted: false,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["elapsed"], serde_json::json!(1.5));
        assert_eq!(json["items_failed"], serde_json::json!(1));
    }
}
