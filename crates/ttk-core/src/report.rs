//! CSV report generation.
//!
//! One header row, then one row per recorded result. Every row is flushed as
//! soon as it is written so a crash never loses earlier rows.
//!
//! Columns: name, args, platform, iteration, time, version, exitcode, error,
//!          one column per phase, `cpu time`, `total duration` (seconds, 3 decimals)

use crate::types::{ExperimentResult, Phase};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

/// Leading columns before the per-phase durations.
const LEADING_COLUMNS: [&str; 8] = [
    "name",
    "args",
    "platform",
    "iteration",
    "time",
    "version",
    "exitcode",
    "error",
];

/// Trailing columns after the per-phase durations.
const TRAILING_COLUMNS: [&str; 2] = ["cpu time (seconds)", "total duration (seconds)"];

/// Full header, in column order.
pub fn header() -> Vec<&'static str> {
    LEADING_COLUMNS
        .into_iter()
        .chain(Phase::ALL.iter().map(Phase::column))
        .chain(TRAILING_COLUMNS)
        .collect()
}

/// Format a duration as seconds with three decimals.
pub fn format_seconds(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64())
}

/// Quote a field if it contains a separator, quote or line break.
fn escape_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn to_csv_line<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| escape_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// A single data row of the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub fields: Vec<String>,
}

impl ReportRow {
    pub fn from_result(result: &ExperimentResult) -> Self {
        let mut fields = vec![
            result.name.clone(),
            result.args.join(" "),
            result.platform.clone(),
            result.iteration.to_string(),
            result.timestamp.to_rfc3339(),
            result.version.clone(),
            result.exit_code.to_string(),
            result.error.clone(),
        ];
        fields.extend(Phase::ALL.iter().map(|p| format_seconds(result.phases.get(*p))));
        fields.push(format_seconds(result.cpu_time));
        fields.push(format_seconds(result.total));
        Self { fields }
    }

    fn to_csv_line(&self) -> String {
        to_csv_line(&self.fields)
    }
}

/// Writer for the CSV report.
pub struct ReportWriter<W: Write> {
    writer: W,
    rows: usize,
}

impl<W: Write> std::fmt::Debug for ReportWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

impl ReportWriter<BufWriter<File>> {
    /// Create (or truncate) a report file and write the header.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> ReportWriter<W> {
    /// Wrap a writer and emit the header row.
    pub fn new(mut writer: W) -> std::io::Result<Self> {
        writeln!(writer, "{}", to_csv_line(&header()))?;
        writer.flush()?;
        Ok(Self { writer, rows: 0 })
    }

    /// Write one result and flush it.
    pub fn write_result(&mut self, result: &ExperimentResult) -> std::io::Result<()> {
        writeln!(self.writer, "{}", ReportRow::from_result(result).to_csv_line())?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Number of data rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
