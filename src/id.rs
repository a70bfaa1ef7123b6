//! Block identifiers.
//!
//! Blocks are named by ULIDs: 128 bits, the first 48 of which are a
//! millisecond timestamp, rendered as 26 Crockford base32 characters. The
//! textual form sorts in creation order, so a directory listing of a database
//! is also a chronological listing of its blocks.

use crate::{RelabelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique identifier of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Ulid);

impl BlockId {
    /// Creates a fresh identifier stamped with the current time.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlockId {
    type Err = RelabelError;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| RelabelError::InvalidBlockId {
                id: s.to_string(),
                reason: e.to_string(),
            })
    }
}

impl From<Ulid> for BlockId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_block_id_uniqueness() {
        assert_ne!(BlockId::new(), BlockId::new());
    }

    #[test]
    fn test_block_id_roundtrips_through_text() {
        let id = BlockId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 26);
        assert_eq!(text.parse::<BlockId>().unwrap(), id);
    }

    #[test]
    fn test_block_id_chronological() {
        let id1 = BlockId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = BlockId::new();

        assert!(id2 > id1);
        assert!(id2.to_string() > id1.to_string());
    }

    #[test]
    fn test_invalid_block_id_is_configuration_error() {
        let err = "not-a-ulid".parse::<BlockId>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("not-a-ulid"));
    }

    #[test]
    fn test_block_id_serializes_as_string() {
        let id: BlockId = "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"01ARZ3NDEKTSV4RRFFQ69G5FAV\"");
    }
}
