//! Read-only memory maps over block data files.

use crate::{RelabelError, Result};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io;
use std::path::Path;

/// Maximum map size for 32-bit targets.
#[cfg(not(target_pointer_width = "64"))]
pub const MAX_MAP_SIZE: usize = 0x7FFFFFFF;

/// No practical limit on 64-bit targets.
#[cfg(target_pointer_width = "64")]
pub const MAX_MAP_SIZE: usize = usize::MAX;

/// A read-only view of a whole file.
///
/// Zero-length files cannot be mapped on every platform, so they are
/// represented without a mapping.
pub struct MappedFile {
    mmap: Option<Mmap>,
}

impl MappedFile {
    /// Maps the file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| RelabelError::io_at(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| RelabelError::io_at(path, e))?
            .len();
        Self::map(file, len as usize).map_err(|e| RelabelError::io_at(path, e))
    }

    fn map(file: File, length: usize) -> io::Result<Self> {
        if length == 0 {
            return Ok(Self { mmap: None });
        }
        if length > MAX_MAP_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Map size {length} exceeds maximum {MAX_MAP_SIZE} for this architecture"),
            ));
        }

        // The file is only ever appended to before the block is published,
        // and never modified afterwards.
        let mmap = unsafe { MmapOptions::new().len(length).map(&file)? };
        Ok(Self { mmap: Some(mmap) })
    }

    /// Returns the mapped data as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `len` bytes starting at `offset`, or a corruption error if the
    /// range falls outside the file.
    pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let data = self.as_slice();
        let start = usize::try_from(offset).ok();
        let end = start.and_then(|s| s.checked_add(usize::try_from(len).ok()?));
        match (start, end) {
            (Some(start), Some(end)) if end <= data.len() => Ok(&data[start..end]),
            _ => Err(RelabelError::DataCorruption(format!(
                "range [{offset}, {offset}+{len}) exceeds mapped file of {} bytes",
                data.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_mapped_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let data = b"Hello, memory-mapped world!";
        temp_file.write_all(data).unwrap();
        temp_file.flush().unwrap();

        let mapped = MappedFile::open(temp_file.path()).unwrap();
        assert_eq!(mapped.len(), data.len());
        assert_eq!(mapped.as_slice(), data);
        assert_eq!(mapped.slice(7, 6).unwrap(), b"memory");
    }

    #[test]
    fn test_empty_file_is_not_mapped() {
        let temp_file = NamedTempFile::new().unwrap();
        let mapped = MappedFile::open(temp_file.path()).unwrap();
        assert!(mapped.is_empty());
        assert!(mapped.slice(0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_out_of_bounds_slice_is_corruption() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(&[0u8; 16]).unwrap();
        temp_file.flush().unwrap();

        let mapped = MappedFile::open(temp_file.path()).unwrap();
        assert!(matches!(
            mapped.slice(10, 10),
            Err(RelabelError::DataCorruption(_))
        ));
        assert!(mapped.slice(u64::MAX, 1).is_err());
    }
}
