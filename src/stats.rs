//! Per-worker resource sampling.
//!
//! A background thread reads CPU time and resident memory of each worker
//! from `/proc` at a fixed interval and keeps running means. CPU percent is
//! derived from the change in user+system ticks between two samples, so the
//! first sample of a pid only sets a baseline.
//!
//! On platforms without `/proc` the collector runs but records nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default time between samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Longest the sampler sleeps before rechecking its shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(25);

/// One observation of one process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSample {
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    /// `None` on the first observation of a pid.
    pub cpu_percent: Option<f64>,
    pub memory_bytes: u64,
}

/// Running means over the samples seen so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    /// Mean CPU usage in percent of one core.
    pub cpu_percent: f64,
    /// Mean resident memory in bytes.
    pub memory_bytes: f64,
    /// Number of samples behind the means.
    pub samples: u64,
}

/// Averages returned by [`StatsCollector::average_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AverageStats {
    PerPid(BTreeMap<u32, AggregateStats>),
    /// Mean of per-pid means; `None` when nothing was sampled.
    Pooled(Option<AggregateStats>),
}

impl AverageStats {
    /// Whether any sample was recorded.
    pub fn is_available(&self) -> bool {
        match self {
            Self::PerPid(map) => !map.is_empty(),
            Self::Pooled(agg) => agg.is_some(),
        }
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    cpu_sum: f64,
    cpu_count: u64,
    memory_sum: f64,
    memory_count: u64,
    /// Ticks and time of the previous sample.
    last: Option<(u64, Instant)>,
}

impl Accumulator {
    fn record(&mut self, ticks: u64, memory_bytes: u64, at: Instant, ticks_per_sec: f64) -> Option<f64> {
        let cpu = self.last.and_then(|(prev_ticks, prev_at)| {
            let elapsed = at.duration_since(prev_at).as_secs_f64();
            (elapsed > 0.0).then(|| {
                let cpu_secs = ticks.saturating_sub(prev_ticks) as f64 / ticks_per_sec;
                cpu_secs / elapsed * 100.0
            })
        });
        self.last = Some((ticks, at));

        if let Some(cpu) = cpu {
            self.cpu_sum += cpu;
            self.cpu_count += 1;
        }
        self.memory_sum += memory_bytes as f64;
        self.memory_count += 1;
        cpu
    }

    fn mean(&self) -> AggregateStats {
        AggregateStats {
            cpu_percent: if self.cpu_count > 0 {
                self.cpu_sum / self.cpu_count as f64
            } else {
                0.0
            },
            memory_bytes: if self.memory_count > 0 {
                self.memory_sum / self.memory_count as f64
            } else {
                0.0
            },
            samples: self.memory_count,
        }
    }
}

#[derive(Debug, Default)]
struct StatsState {
    per_pid: BTreeMap<u32, Accumulator>,
    latest: BTreeMap<u32, StatsSample>,
}

/// Background CPU/memory sampler for a set of pids.
pub struct StatsCollector {
    state: Arc<Mutex<StatsState>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StatsCollector {
    /// Whether this platform exposes per-process stats.
    pub fn is_supported() -> bool {
        cfg!(target_os = "linux") && std::path::Path::new("/proc/self/stat").exists()
    }

    /// Start sampling `pids` every `interval`.
    pub fn start(pids: Vec<u32>, interval: Duration) -> std::io::Result<Self> {
        let state = Arc::new(Mutex::new(StatsState::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        if !Self::is_supported() {
            tracing::debug!("Process stats unavailable on this platform");
        }
        tracing::debug!(pids = ?pids, interval_ms = interval.as_millis(), "Starting stats collector");

        let thread = thread::Builder::new().name("multirunner-stats".to_string()).spawn({
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            move || sample_loop(pids, interval, state, shutdown)
        })?;

        Ok(Self {
            state,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Means so far, per pid or collapsed into a single mean of per-pid means.
    pub fn average_stats(&self, per_pid: bool) -> AverageStats {
        let per = {
            let state = lock(&self.state);
            state
                .per_pid
                .iter()
                .map(|(pid, acc)| (*pid, acc.mean()))
                .collect::<BTreeMap<_, _>>()
        };
        if per_pid {
            AverageStats::PerPid(per)
        } else {
            AverageStats::Pooled(collapse(&per))
        }
    }

    /// Most recent sample for each pid.
    pub fn latest(&self) -> Vec<StatsSample> {
        lock(&self.state).latest.values().cloned().collect()
    }

    /// Stop sampling and join the thread. Safe to call more than once.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::debug!("Stats thread panicked");
        }
    }
}

impl Drop for StatsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(state: &Mutex<StatsState>) -> MutexGuard<'_, StatsState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Collapse per-pid means into one mean of means.
fn collapse(per_pid: &BTreeMap<u32, AggregateStats>) -> Option<AggregateStats> {
    if per_pid.is_empty() {
        return None;
    }
    let n = per_pid.len() as f64;
    Some(AggregateStats {
        cpu_percent: per_pid.values().map(|s| s.cpu_percent).sum::<f64>() / n,
        memory_bytes: per_pid.values().map(|s| s.memory_bytes).sum::<f64>() / n,
        samples: per_pid.values().map(|s| s.samples).sum(),
    })
}

fn sample_loop(
    mut pids: Vec<u32>,
    interval: Duration,
    state: Arc<Mutex<StatsState>>,
    shutdown: Arc<AtomicBool>,
) {
    let Some(units) = ProcUnits::detect() else {
        return;
    };

    while !shutdown.load(Ordering::Relaxed) && !pids.is_empty() {
        let at = Instant::now();
        let timestamp = Utc::now();

        pids.retain(|&pid| {
            let Some(proc_stat) = read_proc_stat(pid) else {
                tracing::trace!(pid, "Process gone, no longer sampling");
                return false;
            };
            let Some(resident_pages) = read_resident_pages(pid) else {
                return false;
            };

            let memory_bytes = resident_pages * units.page_size;
            let mut guard = lock(&state);
            let cpu_percent = guard.per_pid.entry(pid).or_default().record(
                proc_stat.ticks,
                memory_bytes,
                at,
                units.ticks_per_sec,
            );
            guard.latest.insert(
                pid,
                StatsSample {
                    pid,
                    timestamp,
                    cpu_percent,
                    memory_bytes,
                },
            );
            true
        });

        let wake = at + interval;
        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= wake {
                break;
            }
            thread::sleep((wake - now).min(SHUTDOWN_POLL));
        }
    }
}

/// Page size and clock tick rate for decoding `/proc` numbers.
struct ProcUnits {
    page_size: u64,
    ticks_per_sec: f64,
}

impl ProcUnits {
    fn detect() -> Option<Self> {
        use nix::unistd::{SysconfVar, sysconf};

        if !StatsCollector::is_supported() {
            return None;
        }
        let page_size = sysconf(SysconfVar::PAGE_SIZE).ok().flatten().unwrap_or(4096);
        let ticks = sysconf(SysconfVar::CLK_TCK).ok().flatten().unwrap_or(100);
        Some(Self {
            page_size: page_size.max(1) as u64,
            ticks_per_sec: ticks.max(1) as f64,
        })
    }
}

struct ProcStat {
    /// utime + stime, in clock ticks.
    ticks: u64,
}

/// Parse `/proc/<pid>/stat`. Zombies count as gone.
fn read_proc_stat(pid: u32) -> Option<ProcStat> {
    let contents = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_proc_stat(&contents)
}

fn parse_proc_stat(contents: &str) -> Option<ProcStat> {
    // The command name may contain spaces and parens; fields resume after the last ')'
    let rest = &contents[contents.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3); utime and stime are fields 14 and 15
    if fields.first() == Some(&"Z") || fields.first() == Some(&"X") {
        return None;
    }
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(ProcStat {
        ticks: utime + stime,
    })
}

/// Resident pages from `/proc/<pid>/statm` (second field).
fn read_resident_pages(pid: u32) -> Option<u64> {
    let contents = fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    contents.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_stat_with_spaces_in_name() {
        let line = "1234 (my (weird) proc) S 1 1234 1234 0 -1 4194304 100 0 0 0 250 50 0 0 20 0 1 0 1000 10000000 500";
        let stat = parse_proc_stat(line).unwrap();
        assert_eq!(stat.ticks, 300);
    }

    #[test]
    fn test_parse_proc_stat_zombie() {
        let line = "1234 (sh) Z 1 1234 1234 0 -1 4194304 100 0 0 0 250 50 0 0 20 0 1 0 1000 0 0";
        assert!(parse_proc_stat(line).is_none());
    }

    #[test]
    fn test_accumulator_first_sample_is_baseline() {
        let mut acc = Accumulator::default();
        let t0 = Instant::now();
        assert_eq!(acc.record(100, 1000, t0, 100.0), None);
        assert_eq!(acc.mean().samples, 1);
        assert_eq!(acc.mean().cpu_percent, 0.0);

        // 50 ticks at 100 Hz over one second is half a core
        let cpu = acc
            .record(150, 3000, t0 + Duration::from_secs(1), 100.0)
            .unwrap();
        assert!((cpu - 50.0).abs() < 1e-9);

        let mean = acc.mean();
        assert!((mean.cpu_percent - 50.0).abs() < 1e-9);
        assert!((mean.memory_bytes - 2000.0).abs() < 1e-9);
        assert_eq!(mean.samples, 2);
    }

    #[test]
    fn test_collapse_is_mean_of_means() {
        let mut per = BTreeMap::new();
        per.insert(
            1,
            AggregateStats {
                cpu_percent: 10.0,
                memory_bytes: 100.0,
                samples: 10,
            },
        );
        per.insert(
            2,
            AggregateStats {
                cpu_percent: 30.0,
                memory_bytes: 300.0,
                samples: 2,
            },
        );
        let pooled = collapse(&per).unwrap();
        assert_eq!(pooled.cpu_percent, 20.0);
        assert_eq!(pooled.memory_bytes, 200.0);
        assert_eq!(pooled.samples, 12);

        assert!(collapse(&BTreeMap::new()).is_none());
    }

    #[test]
    fn test_no_pids_no_stats() {
        let mut collector = StatsCollector::start(Vec::new(), Duration::from_millis(10)).unwrap();
        collector.stop();
        assert!(!collector.average_stats(false).is_available());
        assert_eq!(collector.average_stats(true), AverageStats::PerPid(BTreeMap::new()));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_samples_own_process() {
        let pid = std::process::id();
        let mut collector = StatsCollector::start(vec![pid], Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        collector.stop();

        let AverageStats::PerPid(per) = collector.average_stats(true) else {
            panic!("expected per-pid stats");
        };
        let own = per.get(&pid).expect("own pid sampled");
        assert!(own.samples >= 2);
        assert!(own.memory_bytes > 0.0);

        let latest = collector.latest();
        assert_eq!(latest.len(), 1);
        assert!(latest[0].cpu_percent.is_some());
    }

    #[test]
    fn test_dead_pid_is_dropped() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let mut collector = StatsCollector::start(vec![pid], Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        collector.stop();
        assert!(!collector.average_stats(false).is_available());
    }

    #[test]
    fn test_stop_twice() {
        let mut collector =
            StatsCollector::start(vec![std::process::id()], DEFAULT_SAMPLE_INTERVAL).unwrap();
        collector.stop();
        collector.stop();
    }
}
