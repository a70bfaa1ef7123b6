//! The series rewrite loop.
//!
//! Every series of the source is evaluated against the rules exactly once and
//! its decision is logged before anything reaches the writer. Relabeling can
//! move a series anywhere in the label order, while the writer only accepts
//! strictly increasing label sets, so surviving series are staged in label
//! order and written once the source is exhausted. A collision is therefore
//! always detected before the first write.

use crate::block::BlockWriter;
use crate::changelog::{ChangeLog, RelabelDecision};
use crate::chunk::{Chunk, merge_chunks};
use crate::label::Labels;
use crate::progress::ProgressReporter;
use crate::relabel::RuleEvaluator;
use crate::series::Series;
use crate::{RelabelError, Result};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::io::Write;
use tracing::{debug, warn};

/// What to do when relabeling maps two series onto the same label set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Abort the rewrite of the block.
    #[default]
    Fail,
    /// Merge the samples of all colliding series, ordered by time.
    Merge,
}

/// Counters of one rewrite pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    /// Series read from the source.
    pub read: u64,
    pub unchanged: u64,
    pub relabeled: u64,
    pub dropped: u64,
    /// Series folded into another series with the same labels.
    pub merged: u64,
    /// Distinct series surviving the rules.
    pub output: u64,
    /// Series handed to the writer; zero in dry-run.
    pub written: u64,
}

struct Staged {
    /// Labels of the first source series that produced this output.
    origin: Labels,
    chunks: Vec<Chunk>,
    merged: bool,
}

/// Applies a rule set to a stream of series.
pub struct SeriesRewriter<'a> {
    evaluator: &'a dyn RuleEvaluator,
    policy: CollisionPolicy,
    source: String,
    destination: String,
}

impl<'a> SeriesRewriter<'a> {
    pub fn new(evaluator: &'a dyn RuleEvaluator, policy: CollisionPolicy) -> Self {
        Self {
            evaluator,
            policy,
            source: "source".to_string(),
            destination: "destination".to_string(),
        }
    }

    /// Names the blocks involved, for error messages.
    pub fn with_context(mut self, source: impl ToString, destination: impl ToString) -> Self {
        self.source = source.to_string();
        self.destination = destination.to_string();
        self
    }

    /// Rewrites `series` into `writer`.
    ///
    /// Passing no writer performs a dry run: decisions are evaluated, logged
    /// and checked for collisions, but no payload is retained or written.
    pub fn rewrite<I, W>(
        &self,
        series: I,
        mut writer: Option<&mut dyn BlockWriter>,
        change_log: &mut ChangeLog<W>,
        progress: &mut ProgressReporter,
    ) -> Result<RewriteSummary>
    where
        I: IntoIterator<Item = Result<Series>>,
        W: Write,
    {
        let dry_run = writer.is_none();
        let mut summary = RewriteSummary::default();
        let mut staged: BTreeMap<Labels, Staged> = BTreeMap::new();

        for item in series {
            let series = item.map_err(|e| RelabelError::source_read(&self.source, e))?;
            summary.read += 1;

            let (target, decision) = match self.evaluator.evaluate(&series.labels) {
                Some(new) if new == series.labels => (Some(new), RelabelDecision::Unchanged),
                Some(new) if !new.is_empty() => (
                    Some(new.clone()),
                    RelabelDecision::Relabeled {
                        old: series.labels.clone(),
                        new,
                    },
                ),
                // A series without labels cannot be addressed; treat it as dropped.
                _ => (None, RelabelDecision::Dropped),
            };
            match decision {
                RelabelDecision::Unchanged => summary.unchanged += 1,
                RelabelDecision::Relabeled { .. } => summary.relabeled += 1,
                RelabelDecision::Dropped => summary.dropped += 1,
            }

            change_log
                .record(&series.labels, decision)
                .map_err(|e| RelabelError::write(&self.destination, e))?;
            progress.advance(1);

            let Some(target) = target else {
                continue;
            };
            let chunks = if dry_run { Vec::new() } else { series.chunks };

            match staged.entry(target) {
                Entry::Vacant(slot) => {
                    slot.insert(Staged {
                        origin: series.labels,
                        chunks,
                        merged: false,
                    });
                }
                Entry::Occupied(mut slot) => match self.policy {
                    CollisionPolicy::Fail => {
                        return Err(RelabelError::SeriesCollision {
                            labels: slot.key().clone(),
                            first: slot.get().origin.clone(),
                            second: series.labels,
                        });
                    }
                    CollisionPolicy::Merge => {
                        warn!(
                            labels = %slot.key(),
                            first = %slot.get().origin,
                            second = %series.labels,
                            "merging colliding series"
                        );
                        let entry = slot.get_mut();
                        entry.chunks.extend(chunks);
                        entry.merged = true;
                        summary.merged += 1;
                    }
                },
            }
        }

        summary.output = staged.len() as u64;
        change_log
            .flush()
            .map_err(|e| RelabelError::write(&self.destination, e))?;

        if let Some(writer) = writer.as_deref_mut() {
            for (labels, entry) in staged {
                let chunks = if entry.merged {
                    merge_chunks(entry.chunks)
                        .map_err(|e| RelabelError::source_read(&self.source, e))?
                } else {
                    entry.chunks
                };
                writer
                    .write_series(Series::new(labels, chunks))
                    .map_err(|e| RelabelError::write(&self.destination, e))?;
                summary.written += 1;
            }
        }

        debug!(
            source = %self.source,
            read = summary.read,
            unchanged = summary.unchanged,
            relabeled = summary.relabeled,
            dropped = summary.dropped,
            merged = summary.merged,
            written = summary.written,
            "rewrite pass finished"
        );
        Ok(summary)
    }
}
