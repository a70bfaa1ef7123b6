//! Block metadata and its atomic publication.
//!
//! A block directory only becomes a block once `meta.json` exists in it.
//! The file is therefore never written in place: it is staged next to its
//! final path, synced, and renamed over the canonical name. Readers listing
//! the directory see either no metadata or the complete file.

use crate::block::BlockStats;
use crate::id::BlockId;
use crate::{RelabelError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const META_FILE_NAME: &str = "meta.json";

/// Metadata format version written by this crate.
pub const META_VERSION_1: u32 = 1;

const TMP_SUFFIX: &str = ".tmp";

/// Metadata of a block, stored as `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    /// Unique identifier of the block.
    pub ulid: BlockId,
    /// Start of the block's time range (inclusive).
    pub min_time: i64,
    /// End of the block's time range (exclusive).
    pub max_time: i64,
    #[serde(default)]
    pub stats: BlockStats,
    #[serde(default)]
    pub compaction: BlockCompaction,
    /// Format version of this file.
    pub version: u32,
}

/// Provenance of a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCompaction {
    /// Compaction level; freshly ingested blocks are level 1.
    pub level: u32,
    /// Blocks this block was derived from.
    #[serde(default)]
    pub sources: Vec<BlockId>,
    /// Direct parents with their time ranges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<BlockDesc>,
}

/// Identity and time range of a parent block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDesc {
    pub ulid: BlockId,
    pub min_time: i64,
    pub max_time: i64,
}

impl BlockMeta {
    /// Creates metadata for a freshly ingested block.
    pub fn new(ulid: BlockId, min_time: i64, max_time: i64) -> Self {
        Self {
            ulid,
            min_time,
            max_time,
            stats: BlockStats::default(),
            compaction: BlockCompaction {
                level: 1,
                sources: vec![ulid],
                parents: Vec::new(),
            },
            version: META_VERSION_1,
        }
    }

    /// Derives the metadata of a block rewritten from this one.
    ///
    /// The time range and compaction level carry over; the identity is
    /// replaced and provenance points at this block alone. Statistics are
    /// reset until the writer reports final counts.
    pub fn derive(&self, new_id: BlockId) -> BlockMeta {
        BlockMeta {
            ulid: new_id,
            min_time: self.min_time,
            max_time: self.max_time,
            stats: BlockStats::default(),
            compaction: BlockCompaction {
                level: self.compaction.level,
                sources: vec![self.ulid],
                parents: vec![BlockDesc {
                    ulid: self.ulid,
                    min_time: self.min_time,
                    max_time: self.max_time,
                }],
            },
            version: META_VERSION_1,
        }
    }
}

/// Reads and validates `meta.json` from a block directory.
pub fn read_meta_file(dir: impl AsRef<Path>) -> Result<BlockMeta> {
    let dir = dir.as_ref();
    let path = dir.join(META_FILE_NAME);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RelabelError::InvalidBlock {
                path: dir.to_path_buf(),
                reason: format!("missing {META_FILE_NAME}"),
            });
        }
        Err(e) => return Err(RelabelError::io_at(path, e)),
    };

    let meta: BlockMeta = serde_json::from_reader(file)?;
    if meta.version != META_VERSION_1 {
        return Err(RelabelError::InvalidBlock {
            path: dir.to_path_buf(),
            reason: format!("unsupported metadata version {}", meta.version),
        });
    }
    Ok(meta)
}

/// Atomically writes `meta.json` into `dir` and returns the number of bytes
/// written.
///
/// The version field is always set to [`META_VERSION_1`], whatever the
/// source block carried.
pub fn write_meta_file(dir: impl AsRef<Path>, meta: &mut BlockMeta) -> Result<u64> {
    stage_meta_file(dir, meta)?.commit()
}

/// Writes and syncs the temporary metadata file without publishing it.
///
/// Dropping the returned [`StagedMeta`] without calling
/// [`StagedMeta::commit`] removes the temporary file again.
pub fn stage_meta_file(dir: impl AsRef<Path>, meta: &mut BlockMeta) -> Result<StagedMeta> {
    meta.version = META_VERSION_1;

    let dir = dir.as_ref();
    let path = dir.join(META_FILE_NAME);
    let tmp_path = dir.join(format!("{META_FILE_NAME}{TMP_SUFFIX}"));

    let json = serde_json::to_vec_pretty(meta)?;

    let publication_error = |source| RelabelError::Publication {
        path: tmp_path.clone(),
        source,
    };

    let guard = TempFileGuard::new(tmp_path.clone());
    let mut file = File::create(&tmp_path).map_err(publication_error)?;
    file.write_all(&json).map_err(publication_error)?;
    // Force the kernel to persist the file before it becomes visible.
    file.sync_all().map_err(publication_error)?;
    drop(file);

    Ok(StagedMeta {
        path,
        tmp_path,
        size: json.len() as u64,
        guard,
    })
}

/// A fully written, synced, but not yet visible metadata file.
#[derive(Debug)]
pub struct StagedMeta {
    path: PathBuf,
    tmp_path: PathBuf,
    size: u64,
    guard: TempFileGuard,
}

impl StagedMeta {
    /// Path of the temporary file holding the staged content.
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Renames the staged file over `meta.json`. This is the publication
    /// instant of the block.
    pub fn commit(mut self) -> Result<u64> {
        fs::rename(&self.tmp_path, &self.path).map_err(|source| RelabelError::Publication {
            path: self.path.clone(),
            source,
        })?;
        self.guard.disarm();

        if let Some(dir) = self.path.parent()
            && let Err(e) = sync_dir(dir)
        {
            // The rename already happened; the block is visible either way.
            warn!(dir = %dir.display(), error = %e, "failed to sync block directory");
        }

        debug!(path = %self.path.display(), bytes = self.size, "published block metadata");
        Ok(self.size)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Removes a temporary file on drop unless disarmed.
#[derive(Debug)]
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove temporary file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_meta() -> BlockMeta {
        let mut meta = BlockMeta::new(BlockId::new(), 0, 7_200_000);
        meta.stats = BlockStats {
            num_series: 3,
            num_samples: 360,
            num_chunks: 3,
        };
        meta
    }

    #[test]
    fn test_write_then_read_meta() {
        let dir = TempDir::new().unwrap();
        let mut meta = sample_meta();
        meta.version = 3;

        let written = write_meta_file(dir.path(), &mut meta).unwrap();
        assert!(written > 0);
        assert_eq!(meta.version, META_VERSION_1);

        let read = read_meta_file(dir.path()).unwrap();
        assert_eq!(read, meta);
        assert!(!dir.path().join("meta.json.tmp").exists());
    }

    #[test]
    fn test_meta_json_uses_camel_case_keys() {
        let dir = TempDir::new().unwrap();
        let mut meta = sample_meta();
        write_meta_file(dir.path(), &mut meta).unwrap();

        let text = fs::read_to_string(dir.path().join(META_FILE_NAME)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["minTime"], 0);
        assert_eq!(value["maxTime"], 7_200_000);
        assert_eq!(value["stats"]["numSeries"], 3);
        assert_eq!(value["compaction"]["level"], 1);
        assert_eq!(value["version"], 1);
        // Indented output.
        assert!(text.contains("\n  "));
    }

    #[test]
    fn test_dropping_staged_meta_removes_tmp_file() {
        let dir = TempDir::new().unwrap();
        let mut meta = sample_meta();
        let staged = stage_meta_file(dir.path(), &mut meta).unwrap();
        let tmp = staged.tmp_path().to_path_buf();
        assert!(tmp.exists());
        assert!(!dir.path().join(META_FILE_NAME).exists());

        drop(staged);
        assert!(!tmp.exists());
        assert!(!dir.path().join(META_FILE_NAME).exists());
    }

    #[test]
    fn test_publication_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        let mut meta = sample_meta();
        let err = write_meta_file(&missing, &mut meta).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Publication);
    }

    #[test]
    fn test_read_missing_meta_is_invalid_block() {
        let dir = TempDir::new().unwrap();
        let err = read_meta_file(dir.path()).unwrap_err();
        assert!(matches!(err, RelabelError::InvalidBlock { .. }));
    }

    #[test]
    fn test_derive_links_provenance() {
        let mut source = sample_meta();
        source.compaction.level = 3;
        let new_id = BlockId::new();
        let derived = source.derive(new_id);

        assert_eq!(derived.ulid, new_id);
        assert_eq!(derived.min_time, source.min_time);
        assert_eq!(derived.max_time, source.max_time);
        assert_eq!(derived.compaction.level, 3);
        assert_eq!(derived.compaction.sources, vec![source.ulid]);
        assert_eq!(derived.compaction.parents[0].ulid, source.ulid);
        assert_eq!(derived.stats, BlockStats::default());
    }
}
