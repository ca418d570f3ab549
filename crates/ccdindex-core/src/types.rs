//! Shared types for the indexing pipeline.

use serde::{Deserialize, Serialize};

// ─── Header ───────────────────────────────────────────────────────────────────

/// The minimal view of a block needed to follow the chain and detect forks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Block height.
    pub height: u64,
    /// Block hash (hex).
    pub hash: String,
    /// Parent block hash (hex).
    pub parent_hash: String,
}

impl Header {
    pub fn new(height: u64, hash: impl Into<String>, parent_hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
            parent_hash: parent_hash.into(),
        }
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Header) -> bool {
        self.height == parent.height + 1 && self.parent_hash == parent.hash
    }
}

// ─── IndexPhase ───────────────────────────────────────────────────────────────

/// The current phase of the fetch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexPhase {
    /// Catching up to the target height.
    Backfill,
    /// Following the chain tip.
    Live,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_extends_parent() {
        let parent = Header::new(100, "aaa", "000");
        let child = Header::new(101, "bbb", "aaa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn header_extends_false_on_gap() {
        let a = Header::new(100, "aaa", "000");
        let b = Header::new(102, "ccc", "aaa");
        assert!(!b.extends(&a));
    }

    #[test]
    fn header_serializes_camel_case() {
        let h = Header::new(7, "h7", "h6");
        let json = serde_json::to_value(&h).unwrap();
        assert_eq!(json["parentHash"], "h6");
    }
}
