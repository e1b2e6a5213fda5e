//! Plain text output for run summaries.

use crate::memory::MemorySize;
use crate::runner::RunSummary;
use crate::stats::{AggregateStats, AverageStats};
use std::io::{self, Write};

fn format_stats(stats: &AggregateStats) -> String {
    format!(
        "cpu {:.1}%, memory {} ({} samples)",
        stats.cpu_percent,
        MemorySize::from_bytes(stats.memory_bytes.round() as u64),
        stats.samples
    )
}

/// Write the summary as indented `key: value` lines.
pub fn write_summary<W: Write>(out: &mut W, summary: &RunSummary) -> io::Result<()> {
    writeln!(out, "Run summary:")?;
    writeln!(out, "  Workers: {}", summary.workers)?;
    writeln!(out, "  Items processed: {}", summary.items_processed)?;
    if summary.items_failed > 0 {
        writeln!(out, "  Items with non-zero exit: {}", summary.items_failed)?;
    }
    writeln!(out, "  Elapsed: {:.2}s", summary.elapsed.as_secs_f64())?;

    match &summary.stats {
        Some(AverageStats::Pooled(Some(stats))) => {
            writeln!(out, "  Average per worker: {}", format_stats(stats))?;
        }
        Some(AverageStats::PerPid(per_pid)) => {
            for (pid, stats) in per_pid {
                writeln!(out, "  Worker pid {}: {}", pid, format_stats(stats))?;
            }
        }
        Some(AverageStats::Pooled(None)) | None => {
            writeln!(out, "  Stats: not available")?;
        }
    }

    if summary.was_interrupted {
        writeln!(out, "  Note: interrupted before all input was processed")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn summary(stats: Option<AverageStats>) -> RunSummary {
        RunSummary {
            workers: 2,
            items_processed: 10,
            items_failed: 1,
            elapsed: Duration::from_millis(1250),
            stats,
            was_interrupted: false,
        }
    }

    fn render(summary: &RunSummary) -> String {
        let mut out = Vec::new();
        write_summary(&mut out, summary).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_plain_pooled() {
        let text = render(&summary(Some(AverageStats::Pooled(Some(AggregateStats {
            cpu_percent: 50.0,
            memory_bytes: (64 * 1024 * 1024) as f64,
            samples: 4,
        })))));
        assert!(text.contains("Items processed: 10"));
        assert!(text.contains("non-zero exit: 1"));
        assert!(text.contains("1.25s"));
        assert!(text.contains("cpu 50.0%, memory 64 MiB"));
    }

    #[test]
    fn test_plain_per_pid() {
        let mut per_pid = BTreeMap::new();
        let stats = AggregateStats {
            cpu_percent: 1.0,
            memory_bytes: 2048.0,
            samples: 1,
        };
        per_pid.insert(100, stats.clone());
        per_pid.insert(200, stats);
        let text = render(&summary(Some(AverageStats::PerPid(per_pid))));
        assert!(text.contains("Worker pid 100"));
        assert!(text.contains("Worker pid 200"));
    }

    #[test]
    fn test_plain_without_stats() {
        let text = render(&summary(None));
        assert!(text.contains("Stats: not available"));
    }
}
