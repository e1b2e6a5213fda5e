//! JSON output for run summaries.

use crate::runner::RunSummary;
use std::io::{self, Write};

/// Write the summary as one JSON object line.
pub fn write_summary<W: Write>(out: &mut W, summary: &RunSummary) -> io::Result<()> {
    let json = serde_json::to_string(summary).map_err(io::Error::from)?;
    writeln!(out, "{}", json)
}
