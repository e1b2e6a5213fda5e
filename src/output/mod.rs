//! Output for results and run summaries.
//!
//! Results go to stdout (or a file) as JSON lines; summaries go to stderr.

pub mod json;
pub mod plain;

use crate::protocol::TaskResult;
use crate::runner::RunSummary;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Summary format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable lines (default).
    #[default]
    Plain,
    /// One JSON object.
    Json,
}

/// Writes one JSON line per result.
pub struct ResultWriter {
    out: BufWriter<Box<dyn Write>>,
    written: u64,
}

impl ResultWriter {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            out: BufWriter::new(out),
            written: 0,
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Write to `path`, truncating it unless `append` is set.
    pub fn file(path: &Path, append: bool) -> io::Result<Self> {
        let file: File = if append {
            OpenOptions::new().create(true).append(true).open(path)?
        } else {
            File::create(path)?
        };
        Ok(Self::new(Box::new(file)))
    }

    pub fn write(&mut self, result: &TaskResult) -> io::Result<()> {
        self.out.write_all(result.to_line().as_bytes())?;
        self.written += 1;
        // Keep downstream pipes fed
        self.out.flush()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Print a run summary to stderr.
pub fn print_summary(summary: &RunSummary, format: OutputFormat) {
    let mut err = io::stderr().lock();
    let written = match format {
        OutputFormat::Plain => plain::write_summary(&mut err, summary),
        OutputFormat::Json => json::write_summary(&mut err, summary),
    };
    if let Err(e) = written {
        tracing::debug!(error = %e, "Failed to print summary");
    }
}
