//! Core protocol types

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a download group
///
/// Displayed as an aria2-compatible GID (16-char lowercase hex string).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(u64);

impl GroupId {
    /// Allocate the next process-wide group ID
    pub fn next() -> Self {
        Self(NEXT_GID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw numeric ID
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw numeric ID
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Format as a 16-char hex GID
    pub fn to_gid(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse a 16-char hex GID
    pub fn from_gid(gid: &str) -> Option<Self> {
        if gid.len() != 16 {
            return None;
        }
        u64::from_str_radix(gid, 16).ok().map(Self)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_gid())
    }
}
