//! Append-only audit log of relabel decisions.
//!
//! Every series of a rewritten block gets exactly one line:
//!
//! ```text
//! 2026-10-17T09:12:44.120Z unchanged {app="api", env="prod"}
//! 2026-10-17T09:12:44.120Z dropped {app="api", env="staging"}
//! 2026-10-17T09:12:44.121Z relabeled {app="x", shard="1"} -> {app="x"}
//! ```
//!
//! The log is diagnostic. Losing it never invalidates the block it describes.

use crate::label::Labels;
use crate::{RelabelError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

pub const CHANGE_LOG_FILE_NAME: &str = "change.log";

/// Source of decision timestamps.
pub type Clock = fn() -> DateTime<Utc>;

/// The wall clock.
pub fn system_clock() -> DateTime<Utc> {
    Utc::now()
}

/// Outcome of relabeling one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelabelDecision {
    Unchanged,
    Relabeled { old: Labels, new: Labels },
    Dropped,
}

impl RelabelDecision {
    fn keyword(&self) -> &'static str {
        match self {
            RelabelDecision::Unchanged => "unchanged",
            RelabelDecision::Relabeled { .. } => "relabeled",
            RelabelDecision::Dropped => "dropped",
        }
    }
}

/// One line of the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub timestamp: DateTime<Utc>,
    /// Label set of the series before relabeling.
    pub series: Labels,
    pub decision: RelabelDecision,
}

impl fmt::Display for ChangeLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.decision.keyword(),
            self.series
        )?;
        if let RelabelDecision::Relabeled { new, .. } = &self.decision {
            write!(f, " -> {new}")?;
        }
        Ok(())
    }
}

impl FromStr for ChangeLogEntry {
    type Err = RelabelError;

    fn from_str(line: &str) -> Result<Self> {
        let malformed = |reason: &str| {
            RelabelError::DataCorruption(format!("malformed change log line {line:?}: {reason}"))
        };

        let (ts, rest) = line.split_once(' ').ok_or_else(|| malformed("no timestamp"))?;
        let timestamp = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| malformed(&e.to_string()))?
            .with_timezone(&Utc);
        let (keyword, rest) = rest.split_once(' ').ok_or_else(|| malformed("no decision"))?;
        let (series, rest) = Labels::parse_prefix(rest)?;

        let decision = match keyword {
            "unchanged" => RelabelDecision::Unchanged,
            "dropped" => RelabelDecision::Dropped,
            "relabeled" => {
                let rest = rest
                    .strip_prefix(" -> ")
                    .ok_or_else(|| malformed("missing new label set"))?;
                let (new, tail) = Labels::parse_prefix(rest)?;
                if !tail.trim().is_empty() {
                    return Err(malformed("trailing input"));
                }
                return Ok(Self {
                    timestamp,
                    decision: RelabelDecision::Relabeled {
                        old: series.clone(),
                        new,
                    },
                    series,
                });
            }
            other => return Err(malformed(&format!("unknown decision {other:?}"))),
        };
        if !rest.trim().is_empty() {
            return Err(malformed("trailing input"));
        }

        Ok(Self {
            timestamp,
            series,
            decision,
        })
    }
}

/// Appends decisions to a sink, one line each.
pub struct ChangeLog<W: Write> {
    writer: Option<BufWriter<W>>,
    clock: Clock,
    entries: u64,
}

impl ChangeLog<File> {
    /// Opens `path` for appending, creating it if needed. Existing entries
    /// are never overwritten.
    pub fn create(path: impl AsRef<Path>, clock: Clock) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| RelabelError::io_at(path, e))?;
        Ok(Self::new(file, clock))
    }

    /// Flushes and syncs the log file.
    pub fn close(mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        Ok(())
    }
}

impl<W: Write> ChangeLog<W> {
    pub fn new(writer: W, clock: Clock) -> Self {
        Self {
            writer: Some(BufWriter::new(writer)),
            clock,
            entries: 0,
        }
    }

    /// Appends one decision for the series identified by `series`.
    pub fn record(&mut self, series: &Labels, decision: RelabelDecision) -> Result<()> {
        let entry = ChangeLogEntry {
            timestamp: (self.clock)(),
            series: series.clone(),
            decision,
        };
        debug!(entry = %entry, "relabel decision");

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RelabelError::InvalidConfiguration("change log is closed".to_string()))?;
        writeln!(writer, "{entry}")?;
        self.entries += 1;
        Ok(())
    }

    /// Pushes buffered entries to the underlying sink.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Number of entries recorded through this handle.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Flushes and returns the underlying sink.
    pub fn into_inner(mut self) -> Result<W> {
        let writer = self.writer.take().ok_or_else(|| {
            RelabelError::InvalidConfiguration("change log is closed".to_string())
        })?;
        writer.into_inner().map_err(|e| e.into_error().into())
    }
}

impl<W: Write> Drop for ChangeLog<W> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut()
            && let Err(e) = writer.flush()
        {
            warn!(error = %e, "failed to flush change log");
        }
    }
}

/// Reads every entry of a change log file.
pub fn read_change_log(path: impl AsRef<Path>) -> Result<Vec<ChangeLogEntry>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| RelabelError::io_at(path, e))?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(line.parse()?);
    }
    Ok(entries)
}
