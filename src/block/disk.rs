//! On-disk block format.
//!
//! A block directory holds three files:
//!
//! - `chunks`: chunk payloads, concatenated in series order;
//! - `index`: bincode-encoded list of series, each with its label set and the
//!   location and time bounds of its chunks;
//! - `meta.json`: the [`BlockMeta`], written last.

use bincode::serde::{decode_from_slice, encode_to_vec};
use crate::block::meta::{BlockMeta, read_meta_file, write_meta_file};
use crate::block::{BlockFormat, BlockReader, BlockStats, BlockWriter};
use crate::chunk::Chunk;
use crate::id::BlockId;
use crate::label::Labels;
use crate::mmap::MappedFile;
use crate::series::Series;
use crate::{RelabelError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CHUNKS_FILE_NAME: &str = "chunks";
pub const INDEX_FILE_NAME: &str = "index";

const INDEX_VERSION: u32 = 1;

fn index_config() -> impl bincode::config::Config {
    bincode::config::standard()
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    series: Vec<IndexEntry>,
}

/// A series in the index.
#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    labels: Labels,
    chunks: Vec<ChunkRef>,
}

/// Location of a chunk payload inside the chunks file.
#[derive(Debug, Serialize, Deserialize)]
struct ChunkRef {
    offset: u64,
    len: u64,
    min_time: i64,
    max_time: i64,
    num_samples: u32,
}

/// Reads a block directory.
pub struct DiskBlockReader {
    meta: BlockMeta,
    index: Vec<IndexEntry>,
    chunks: MappedFile,
}

impl DiskBlockReader {
    /// Opens an existing block.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let meta = read_meta_file(dir)?;

        let index_path = dir.join(INDEX_FILE_NAME);
        let bytes = fs::read(&index_path).map_err(|e| RelabelError::io_at(&index_path, e))?;
        let (index, _): (IndexFile, usize) = decode_from_slice(&bytes, index_config())?;
        if index.version != INDEX_VERSION {
            return Err(RelabelError::InvalidBlock {
                path: dir.to_path_buf(),
                reason: format!("unsupported index version {}", index.version),
            });
        }
        if let Some(pair) = index.series.windows(2).find(|w| w[0].labels >= w[1].labels) {
            return Err(RelabelError::DataCorruption(format!(
                "index of {} is not sorted: {} before {}",
                dir.display(),
                pair[0].labels,
                pair[1].labels
            )));
        }
        if meta.stats.num_series != index.series.len() as u64 {
            warn!(
                block = %meta.ulid,
                meta_series = meta.stats.num_series,
                index_series = index.series.len(),
                "series count in meta.json disagrees with index"
            );
        }

        let chunks = MappedFile::open(&dir.join(CHUNKS_FILE_NAME))?;

        Ok(Self {
            meta,
            index: index.series,
            chunks,
        })
    }

    fn load_series(&self, entry: &IndexEntry) -> Result<Series> {
        let mut chunks = Vec::with_capacity(entry.chunks.len());
        for chunk_ref in &entry.chunks {
            let data = self.chunks.slice(chunk_ref.offset, chunk_ref.len)?;
            chunks.push(Chunk {
                min_time: chunk_ref.min_time,
                max_time: chunk_ref.max_time,
                num_samples: chunk_ref.num_samples,
                data: data.to_vec(),
            });
        }
        Ok(Series::new(entry.labels.clone(), chunks))
    }
}

impl BlockReader for DiskBlockReader {
    fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    fn series(&mut self) -> Box<dyn Iterator<Item = Result<Series>> + '_> {
        let this = &*self;
        Box::new(this.index.iter().map(move |entry| this.load_series(entry)))
    }
}

/// Writes a new block directory.
///
/// Nothing written here is visible as a block until `meta.json` is
/// published by the caller.
pub struct DiskBlockWriter {
    dir: PathBuf,
    chunks: BufWriter<File>,
    offset: u64,
    index: Vec<IndexEntry>,
    stats: BlockStats,
}

impl DiskBlockWriter {
    /// Creates `dir` if needed and starts a new chunks file in it.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| RelabelError::io_at(dir, e))?;

        let chunks_path = dir.join(CHUNKS_FILE_NAME);
        let chunks = File::create(&chunks_path).map_err(|e| RelabelError::io_at(&chunks_path, e))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            chunks: BufWriter::new(chunks),
            offset: 0,
            index: Vec::new(),
            stats: BlockStats::default(),
        })
    }

    fn write_index(&self) -> Result<()> {
        let path = self.dir.join(INDEX_FILE_NAME);
        let bytes = encode_to_vec(
            &IndexFileRef {
                version: INDEX_VERSION,
                series: &self.index,
            },
            index_config(),
        )?;
        let mut file = File::create(&path).map_err(|e| RelabelError::io_at(&path, e))?;
        file.write_all(&bytes).map_err(|e| RelabelError::io_at(&path, e))?;
        file.sync_all().map_err(|e| RelabelError::io_at(&path, e))?;
        Ok(())
    }
}

/// Borrowing twin of [`IndexFile`] for serialization.
#[derive(Serialize)]
struct IndexFileRef<'a> {
    version: u32,
    series: &'a [IndexEntry],
}

impl BlockWriter for DiskBlockWriter {
    fn write_series(&mut self, series: Series) -> Result<()> {
        if let Some(last) = self.index.last()
            && series.labels <= last.labels
        {
            return Err(RelabelError::OutOfOrderSeries {
                previous: last.labels.clone(),
                current: series.labels,
            });
        }

        let mut refs = Vec::with_capacity(series.chunks.len());
        for chunk in &series.chunks {
            self.chunks.write_all(&chunk.data)?;
            refs.push(ChunkRef {
                offset: self.offset,
                len: chunk.data.len() as u64,
                min_time: chunk.min_time,
                max_time: chunk.max_time,
                num_samples: chunk.num_samples,
            });
            self.offset += chunk.data.len() as u64;
        }

        self.stats.num_series += 1;
        self.stats.num_chunks += refs.len() as u64;
        self.stats.num_samples += series.num_samples();
        self.index.push(IndexEntry {
            labels: series.labels,
            chunks: refs,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<BlockStats> {
        let chunks_path = self.dir.join(CHUNKS_FILE_NAME);
        self.chunks
            .flush()
            .map_err(|e| RelabelError::io_at(&chunks_path, e))?;
        self.chunks
            .get_ref()
            .sync_all()
            .map_err(|e| RelabelError::io_at(&chunks_path, e))?;
        self.write_index()?;

        debug!(
            dir = %self.dir.display(),
            series = self.stats.num_series,
            chunks = self.stats.num_chunks,
            samples = self.stats.num_samples,
            "flushed block"
        );
        Ok(self.stats)
    }
}

/// The default [`BlockFormat`]: blocks as directories of the layout above.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFormat;

impl BlockFormat for DiskFormat {
    fn open_reader(&self, dir: &Path) -> Result<Box<dyn BlockReader>> {
        Ok(Box::new(DiskBlockReader::open(dir)?))
    }

    fn create_writer(&self, dir: &Path) -> Result<Box<dyn BlockWriter>> {
        Ok(Box::new(DiskBlockWriter::create(dir)?))
    }
}

/// Writes `series` as a new, published block under `db_path` and returns its
/// metadata. Series may be given in any order.
pub fn create_block(
    db_path: impl AsRef<Path>,
    min_time: i64,
    max_time: i64,
    series: impl IntoIterator<Item = Series>,
) -> Result<BlockMeta> {
    let mut series: Vec<Series> = series.into_iter().collect();
    series.sort_by(|a, b| a.labels.cmp(&b.labels));

    let id = BlockId::new();
    let dir = db_path.as_ref().join(id.to_string());
    let mut writer = DiskBlockWriter::create(&dir)?;
    for s in series {
        writer.write_series(s)?;
    }

    let mut meta = BlockMeta::new(id, min_time, max_time);
    meta.stats = writer.flush()?;
    write_meta_file(&dir, &mut meta)?;
    Ok(meta)
}
