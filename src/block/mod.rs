//! Block capabilities.
//!
//! The rewrite engine never looks at how a block lays out its series. It reads
//! through [`BlockReader`], writes through [`BlockWriter`] and obtains both
//! from a [`BlockFormat`], so tests and alternative formats can substitute
//! their own implementations.

pub mod disk;
pub mod meta;

pub use disk::{DiskBlockReader, DiskBlockWriter, DiskFormat, create_block};
pub use meta::{
    BlockCompaction, BlockDesc, BlockMeta, StagedMeta, read_meta_file, stage_meta_file,
    write_meta_file,
};

use crate::Result;
use crate::series::Series;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Statistics of a persisted block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    pub num_series: u64,
    pub num_samples: u64,
    pub num_chunks: u64,
}

/// Read access to an existing block.
pub trait BlockReader {
    /// Returns the metadata of the block.
    fn meta(&self) -> &BlockMeta;

    /// Streams every series of the block in label order.
    ///
    /// The stream is finite and is consumed once.
    fn series(&mut self) -> Box<dyn Iterator<Item = Result<Series>> + '_>;
}

/// Write access to a block under construction.
pub trait BlockWriter {
    /// Appends a series. Series must arrive in strictly increasing label order.
    fn write_series(&mut self, series: Series) -> Result<()>;

    /// Persists everything written so far and returns the final statistics.
    fn flush(&mut self) -> Result<BlockStats>;
}

/// Opens readers and creates writers for block directories.
pub trait BlockFormat {
    fn open_reader(&self, dir: &Path) -> Result<Box<dyn BlockReader>>;

    fn create_writer(&self, dir: &Path) -> Result<Box<dyn BlockWriter>>;
}
