//! Drives the rewrite of whole blocks.
//!
//! Each requested block becomes a job that moves through
//! `Pending → Opened → Rewriting → {Committed | DryRunComplete}`, or to
//! `Failed` from any non-terminal state. A job builds its destination in
//! `<db>/<new id>.tmp-for-creation`, which only becomes `<db>/<new id>` once
//! every series and the change log are on disk. Metadata is published last,
//! and the source is removed only after that, so a crash at any point leaves
//! at least one complete block.

use crate::block::{BlockFormat, BlockStats, BlockWriter, DiskFormat, write_meta_file};
use crate::changelog::{CHANGE_LOG_FILE_NAME, ChangeLog, Clock, system_clock};
use crate::id::BlockId;
use crate::progress::ProgressReporter;
use crate::relabel::RuleEvaluator;
use crate::rewriter::{CollisionPolicy, RewriteSummary, SeriesRewriter};
use crate::{RelabelError, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Suffix of a destination directory that is still being built.
pub const STAGING_DIR_SUFFIX: &str = ".tmp-for-creation";

/// Default database directory, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = "data";

/// Lifecycle of one block rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    /// The source block is open for reading.
    Opened,
    /// Series are being evaluated and written to the staging directory.
    Rewriting,
    /// The new block is published.
    Committed,
    /// Decisions were logged; nothing was published.
    DryRunComplete,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Committed | JobState::DryRunComplete | JobState::Failed
        )
    }

    fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Opened) | (Opened, Rewriting) => true,
            (Rewriting, Committed) | (Rewriting, DryRunComplete) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Opened => "opened",
            JobState::Rewriting => "rewriting",
            JobState::Committed => "committed",
            JobState::DryRunComplete => "dry-run-complete",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of one requested block.
#[derive(Debug)]
pub struct JobReport {
    /// The id as requested, which may not be a valid block id.
    pub source: String,
    pub destination: Option<BlockId>,
    pub state: JobState,
    pub summary: Option<RewriteSummary>,
    /// Statistics of the published block.
    pub stats: Option<BlockStats>,
    pub source_deleted: bool,
    pub error: Option<RelabelError>,
}

impl JobReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: None,
            state: JobState::Pending,
            summary: None,
            stats: None,
            source_deleted: false,
            error: None,
        }
    }

    fn transition(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid job transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.state, JobState::Committed | JobState::DryRunComplete)
    }

    /// Directory of the destination block once published.
    pub fn destination_dir(&self, db_path: &Path) -> Option<PathBuf> {
        self.destination.map(|id| db_path.join(id.to_string()))
    }
}

/// Outcomes of a batch, in request order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub jobs: Vec<JobReport>,
}

impl BatchReport {
    pub fn failed(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|j| j.state == JobState::Failed)
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }

    fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    db_path: PathBuf,
    dry_run: bool,
    delete_source: bool,
    collision_policy: CollisionPolicy,
    clock: Clock,
    format: Box<dyn BlockFormat>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            dry_run: true,
            delete_source: false,
            collision_policy: CollisionPolicy::Fail,
            clock: system_clock,
            format: Box::new(DiskFormat),
        }
    }
}

impl OrchestratorBuilder {
    /// Creates a builder with default settings. Dry-run is on by default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directory holding the blocks.
    pub fn with_db_path(mut self, path: impl AsRef<Path>) -> Self {
        self.db_path = path.as_ref().to_path_buf();
        self
    }

    /// Enables or disables dry-run.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Removes each source block after its replacement is published.
    pub fn with_delete_source(mut self, delete: bool) -> Self {
        self.delete_source = delete;
        self
    }

    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision_policy = policy;
        self
    }

    /// Sets the clock used to timestamp change log entries.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the format used to open sources and create destinations.
    pub fn with_format(mut self, format: impl BlockFormat + 'static) -> Self {
        self.format = Box::new(format);
        self
    }

    /// Builds the orchestrator.
    pub fn build(self) -> Result<Orchestrator> {
        if !self.db_path.is_dir() {
            return Err(RelabelError::InvalidConfiguration(format!(
                "database path {:?} is not a directory",
                self.db_path
            )));
        }
        if self.dry_run && self.delete_source {
            warn!("dry-run is enabled, source blocks will not be deleted");
        }

        Ok(Orchestrator {
            db_path: self.db_path,
            dry_run: self.dry_run,
            delete_source: self.delete_source && !self.dry_run,
            collision_policy: self.collision_policy,
            clock: self.clock,
            format: self.format,
        })
    }
}

/// Rewrites blocks of one database, one at a time.
pub struct Orchestrator {
    db_path: PathBuf,
    dry_run: bool,
    delete_source: bool,
    collision_policy: CollisionPolicy,
    clock: Clock,
    format: Box<dyn BlockFormat>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Rewrites every block in `ids`. A failing block never stops the batch.
    pub fn run<S: AsRef<str>>(&self, ids: &[S], evaluator: &dyn RuleEvaluator) -> BatchReport {
        let mut report = BatchReport::default();
        for id in ids {
            report.jobs.push(self.rewrite_block(id.as_ref(), evaluator));
        }

        info!(
            requested = report.jobs.len(),
            committed = report.count(JobState::Committed),
            dry_run = report.count(JobState::DryRunComplete),
            failed = report.count(JobState::Failed),
            "batch finished"
        );
        report
    }

    /// Rewrites a single block.
    pub fn rewrite_block(&self, id: &str, evaluator: &dyn RuleEvaluator) -> JobReport {
        let mut report = JobReport::new(id);
        if let Err(e) = self.execute(&mut report, evaluator) {
            error!(
                source = %report.source,
                destination = ?report.destination.map(|d| d.to_string()),
                state = %report.state,
                error = %e,
                "block rewrite failed"
            );
            report.transition(JobState::Failed);
            report.error = Some(e);
        }
        report
    }

    fn execute(&self, report: &mut JobReport, evaluator: &dyn RuleEvaluator) -> Result<()> {
        let source_id: BlockId = report.source.parse()?;
        let source_dir = self.db_path.join(source_id.to_string());
        let mut reader = self
            .format
            .open_reader(&source_dir)
            .map_err(|e| RelabelError::source_read(source_id, e))?;
        report.transition(JobState::Opened);

        let new_id = BlockId::new();
        report.destination = Some(new_id);
        let final_dir = self.db_path.join(new_id.to_string());
        let staging_dir = self
            .db_path
            .join(format!("{new_id}{STAGING_DIR_SUFFIX}"));
        let wrap = |e: RelabelError| RelabelError::write(new_id, e);

        fs::create_dir_all(&staging_dir)
            .map_err(|e| wrap(RelabelError::io_at(&staging_dir, e)))?;
        let change_log_path = staging_dir.join(CHANGE_LOG_FILE_NAME);
        let mut change_log = ChangeLog::create(&change_log_path, self.clock).map_err(wrap)?;
        let mut writer = if self.dry_run {
            None
        } else {
            Some(self.format.create_writer(&staging_dir).map_err(wrap)?)
        };

        let source_meta = reader.meta().clone();
        let mut meta = source_meta.derive(new_id);
        let mut progress = ProgressReporter::new(source_meta.stats.num_series);
        report.transition(JobState::Rewriting);
        info!(
            source = %source_id,
            destination = %new_id,
            dry_run = self.dry_run,
            change_log = %change_log_path.display(),
            "rewriting block"
        );

        let summary = SeriesRewriter::new(evaluator, self.collision_policy)
            .with_context(source_id, new_id)
            .rewrite(
                reader.series(),
                writer.as_mut().map(|w| &mut **w as &mut dyn BlockWriter),
                &mut change_log,
                &mut progress,
            )?;
        report.summary = Some(summary);

        let Some(mut writer) = writer else {
            change_log.close().map_err(wrap)?;
            report.transition(JobState::DryRunComplete);
            info!(
                source = %source_id,
                read = summary.read,
                relabeled = summary.relabeled,
                dropped = summary.dropped,
                change_log = %change_log_path.display(),
                "dry run finished, nothing was published"
            );
            return Ok(());
        };

        meta.stats = writer.flush().map_err(wrap)?;
        drop(writer);
        change_log.close().map_err(wrap)?;

        fs::rename(&staging_dir, &final_dir)
            .map_err(|e| wrap(RelabelError::io_at(&final_dir, e)))?;
        write_meta_file(&final_dir, &mut meta)?;
        report.stats = Some(meta.stats);
        info!(
            source = %source_id,
            destination = %new_id,
            series = meta.stats.num_series,
            samples = meta.stats.num_samples,
            "published block"
        );

        if self.delete_source {
            drop(reader);
            fs::remove_dir_all(&source_dir)
                .map_err(|e| RelabelError::io_at(&source_dir, e))?;
            report.source_deleted = true;
            info!(source = %source_id, "deleted source block");
        }

        report.transition(JobState::Committed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataPoint;
    use crate::ErrorKind;
    use crate::block::{BlockMeta, BlockReader, create_block, read_meta_file};
    use crate::chunk::Chunk;
    use crate::label::{Label, Labels};
    use crate::series::Series;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;

    fn fixed_clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn series(pairs: &[(&str, &str)]) -> Series {
        let labels: Labels = pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect();
        let points: Vec<DataPoint> = (0..5).map(|i| DataPoint::new(i * 10, i as f64)).collect();
        Series::new(labels, vec![Chunk::encode(&points).unwrap()])
    }

    fn keep_all(l: &Labels) -> Option<Labels> {
        Some(l.clone())
    }

    fn block_dirs(db: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(db)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_state_transitions() {
        use JobState::*;
        assert!(Pending.can_transition_to(Opened));
        assert!(Rewriting.can_transition_to(DryRunComplete));
        assert!(Opened.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Opened));
    }

    #[test]
    fn test_builder_rejects_missing_db_path() {
        let dir = TempDir::new().unwrap();
        let err = OrchestratorBuilder::new()
            .with_db_path(dir.path().join("missing"))
            .build()
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_dry_run_is_the_default() {
        let db = TempDir::new().unwrap();
        let orchestrator = OrchestratorBuilder::new()
            .with_db_path(db.path())
            .build()
            .unwrap();
        assert!(orchestrator.is_dry_run());
    }

    #[test]
    fn test_commit_publishes_derived_block() {
        let db = TempDir::new().unwrap();
        let source = create_block(db.path(), 0, 1000, vec![series(&[("app", "a")])]).unwrap();
        let orchestrator = OrchestratorBuilder::new()
            .with_db_path(db.path())
            .with_dry_run(false)
            .with_clock(fixed_clock)
            .build()
            .unwrap();

        let report = orchestrator.run(&[source.ulid.to_string()], &keep_all);
        let job = &report.jobs[0];
        assert_eq!(job.state, JobState::Committed, "{:?}", job.error);
        let dest = job.destination_dir(db.path()).unwrap();
        let meta: BlockMeta = read_meta_file(&dest).unwrap();
        assert_eq!(meta.compaction.sources, vec![source.ulid]);
        assert_eq!(meta.min_time, 0);
        assert_eq!(meta.max_time, 1000);
        assert_eq!(meta.stats.num_series, 1);
        assert!(dest.join(CHANGE_LOG_FILE_NAME).exists());
        assert!(!job.source_deleted);
        assert!(block_dirs(db.path()).iter().all(|n| !n.ends_with(STAGING_DIR_SUFFIX)));
    }

    #[test]
    fn test_empty_batch_touches_nothing() {
        let db = TempDir::new().unwrap();
        let orchestrator = OrchestratorBuilder::new()
            .with_db_path(db.path())
            .with_dry_run(false)
            .build()
            .unwrap();

        let report = orchestrator.run::<String>(&[], &keep_all);
        assert!(report.jobs.is_empty());
        assert!(!report.has_failures());
        assert!(block_dirs(db.path()).is_empty());
    }

    #[test]
    fn test_invalid_id_does_not_stop_batch() {
        let db = TempDir::new().unwrap();
        let source = create_block(db.path(), 0, 1000, vec![series(&[("app", "a")])]).unwrap();
        let orchestrator = OrchestratorBuilder::new()
            .with_db_path(db.path())
            .with_clock(fixed_clock)
            .build()
            .unwrap();

        let missing = BlockId::new().to_string();
        let report = orchestrator.run(
            &["not-a-ulid".to_string(), missing, source.ulid.to_string()],
            &keep_all,
        );
        assert_eq!(report.jobs.len(), 3);
        assert_eq!(report.jobs[0].state, JobState::Failed);
        assert_eq!(
            report.jobs[0].error.as_ref().unwrap().kind(),
            ErrorKind::Configuration
        );
        assert_eq!(report.jobs[1].state, JobState::Failed);
        assert_eq!(
            report.jobs[1].error.as_ref().unwrap().kind(),
            ErrorKind::SourceRead
        );
        assert!(report.jobs[1].destination.is_none());
        assert_eq!(report.jobs[2].state, JobState::DryRunComplete);
        assert!(report.has_failures());
    }

    struct FailingFormat;

    struct FailingWriter;

    impl BlockWriter for FailingWriter {
        fn write_series(&mut self, _series: Series) -> Result<()> {
            Err(std::io::Error::other("device gone").into())
        }

        fn flush(&mut self) -> Result<BlockStats> {
            Ok(BlockStats::default())
        }
    }

    impl BlockFormat for FailingFormat {
        fn open_reader(&self, dir: &Path) -> Result<Box<dyn BlockReader>> {
            DiskFormat.open_reader(dir)
        }

        fn create_writer(&self, _dir: &Path) -> Result<Box<dyn BlockWriter>> {
            Ok(Box::new(FailingWriter))
        }
    }

    #[test]
    fn test_write_failure_keeps_staging_and_source() {
        let db = TempDir::new().unwrap();
        let source = create_block(db.path(), 0, 1000, vec![series(&[("app", "a")])]).unwrap();
        let orchestrator = OrchestratorBuilder::new()
            .with_db_path(db.path())
            .with_dry_run(false)
            .with_delete_source(true)
            .with_format(FailingFormat)
            .build()
            .unwrap();

        let report = orchestrator.run(&[source.ulid.to_string()], &keep_all);
        let job = &report.jobs[0];
        assert_eq!(job.state, JobState::Failed);
        let err = job.error.as_ref().unwrap();
        assert_eq!(err.kind(), ErrorKind::Write);
        let dest = job.destination.unwrap();
        assert!(err.to_string().contains(&dest.to_string()));

        let staging = db.path().join(format!("{dest}{STAGING_DIR_SUFFIX}"));
        assert!(staging.join(CHANGE_LOG_FILE_NAME).exists());
        assert!(!db.path().join(dest.to_string()).exists());
        assert!(db.path().join(source.ulid.to_string()).exists());
        assert!(!job.source_deleted);
    }
}
