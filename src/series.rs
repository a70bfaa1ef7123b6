//! A series: a label set plus its chunks.

use crate::chunk::Chunk;
use crate::label::Labels;

/// A series as stored in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    /// Identity of the series.
    pub labels: Labels,
    /// Time-ordered chunks; treated as opaque payload by the rewriter.
    pub chunks: Vec<Chunk>,
}

impl Series {
    /// Creates a new Series.
    pub fn new(labels: Labels, chunks: Vec<Chunk>) -> Self {
        Self { labels, chunks }
    }

    /// Returns the total number of samples across all chunks.
    pub fn num_samples(&self) -> u64 {
        self.chunks.iter().map(|c| c.num_samples as u64).sum()
    }
}
