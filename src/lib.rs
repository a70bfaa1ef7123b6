//! tsrelabel - Rewrites the series labels of immutable time-series blocks.
//!
//! A source block is streamed series by series through a set of relabel rules.
//! Every decision is recorded in a change log, surviving series are written to
//! a new block, and the new block's metadata is published atomically. The
//! source block is left untouched unless its deletion is requested.
//!
//! ```no_run
//! use tsrelabel::{OrchestratorBuilder, RelabelRules};
//!
//! # fn main() -> tsrelabel::Result<()> {
//! let rules = RelabelRules::load("relabel.yml")?;
//! let orchestrator = OrchestratorBuilder::new()
//!     .with_db_path("data")
//!     .with_dry_run(false)
//!     .build()?;
//! let report = orchestrator.run(&["01HZX3J7Q5A1M5G5V3X0R8N9KD"], &rules);
//! assert!(!report.has_failures());
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod changelog;
pub mod chunk;
pub mod error;
pub mod id;
pub mod label;
pub mod mmap;
pub mod orchestrator;
pub mod progress;
pub mod relabel;
pub mod rewriter;
pub mod series;

pub use block::{BlockFormat, BlockMeta, BlockReader, BlockStats, BlockWriter, DiskFormat};
pub use changelog::{ChangeLog, ChangeLogEntry, RelabelDecision, read_change_log};
pub use error::{ErrorKind, RelabelError, Result};
pub use id::BlockId;
pub use label::{Label, Labels, LabelsBuilder};
pub use orchestrator::{BatchReport, JobReport, JobState, Orchestrator, OrchestratorBuilder};
pub use relabel::{RelabelConfig, RelabelRules, RuleEvaluator};
pub use rewriter::{CollisionPolicy, RewriteSummary, SeriesRewriter};
pub use series::Series;

use serde::{Deserialize, Serialize};

/// A single sample of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub value: f64,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl DataPoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}
