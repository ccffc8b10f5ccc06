//! Download results and statistics
//!
//! A [`DownloadResult`] is recorded exactly once for every group that
//! leaves the active set, whatever the reason.

use super::GroupId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Final classification of a download group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// Download completed
    Finished,
    /// Unclassified failure
    UnknownError,
    /// Connect or transfer timed out
    TimeOut,
    /// The resource does not exist or the URI is unusable
    ResourceNotFound,
    /// Transfer went below the lowest speed limit
    TooSlowDownloadSpeed,
    /// Socket-level failure
    NetworkProblem,
    /// Group stopped before it finished
    InProgress,
    /// Host name could not be resolved
    NameResolveError,
    /// Every mirror URI was tried and none succeeded
    AllMirrorsFailed,
    /// TLS handshake failed
    TlsHandshakeFailed,
    /// Peer certificate did not verify
    TlsVerificationFailed,
    /// Removed by the user
    Removed,
}

impl ResultCode {
    /// Short status marker used in the result table
    pub fn status_mark(&self) -> &'static str {
        match self {
            Self::Finished => "OK",
            Self::InProgress => "INPR",
            Self::Removed => "RM",
            _ => "ERR",
        }
    }

    /// Whether this code represents a failure
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Finished | Self::InProgress | Self::Removed)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Finished => "finished",
            Self::UnknownError => "unknown error",
            Self::TimeOut => "timeout",
            Self::ResourceNotFound => "resource not found",
            Self::TooSlowDownloadSpeed => "download too slow",
            Self::NetworkProblem => "network problem",
            Self::InProgress => "in progress",
            Self::NameResolveError => "name resolution failed",
            Self::AllMirrorsFailed => "all mirrors failed",
            Self::TlsHandshakeFailed => "TLS handshake failed",
            Self::TlsVerificationFailed => "TLS verification failed",
            Self::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one URI attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriResult {
    pub uri: String,
    pub result: ResultCode,
}

impl UriResult {
    pub fn new(uri: impl Into<String>, result: ResultCode) -> Self {
        Self {
            uri: uri.into(),
            result,
        }
    }
}

/// Aggregated transfer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStat {
    /// Current download speed (bytes/sec)
    pub download_speed: u64,
    /// Current upload speed (bytes/sec)
    pub upload_speed: u64,
    /// Bytes downloaded in this session
    pub session_download_length: u64,
    /// Bytes uploaded in this session
    pub session_upload_length: u64,
}

impl std::ops::AddAssign for TransferStat {
    fn add_assign(&mut self, rhs: Self) {
        self.download_speed += rhs.download_speed;
        self.upload_speed += rhs.upload_speed;
        self.session_download_length += rhs.session_download_length;
        self.session_upload_length += rhs.session_upload_length;
    }
}

/// Final record of a download group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResult {
    /// Group the result belongs to
    pub gid: GroupId,
    /// Final classification
    pub result: ResultCode,
    /// Last error message, if any
    pub error_message: Option<String>,
    /// Output path reported by the protocol driver
    pub file_path: Option<PathBuf>,
    /// URIs the group was created with
    pub uris: Vec<String>,
    /// Per-URI outcomes in attempt order
    pub uri_results: Vec<UriResult>,
    /// Total length if known
    pub total_length: u64,
    /// Completed length
    pub completed_length: u64,
    /// Bytes downloaded while the group was active
    pub session_download_length: u64,
    /// Time the group spent active, in milliseconds
    pub session_time_ms: u64,
    /// Groups created by post-download processing
    pub followed_by: Vec<GroupId>,
}

impl DownloadResult {
    /// Average download speed over the session (bytes/sec)
    pub fn average_speed(&self) -> Option<u64> {
        if self.session_time_ms == 0 {
            return None;
        }
        Some(self.session_download_length * 1000 / self.session_time_ms)
    }

    /// Path shown in the result table
    pub fn display_path(&self) -> String {
        if let Some(path) = &self.file_path {
            return path.display().to_string();
        }
        self.uris
            .first()
            .cloned()
            .unwrap_or_else(|| "n/a".to_string())
    }
}

/// Counts of finished, failed and pending groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStat {
    pub num_finished: usize,
    pub num_error: usize,
    pub num_in_progress: usize,
    pub num_removed: usize,
    pub num_waiting: usize,
    /// Result code of the most recent failure, `Finished` if none
    pub last_error_result: ResultCode,
}

impl DownloadStat {
    /// True when nothing failed and nothing is left to do
    pub fn all_completed(&self) -> bool {
        self.num_error == 0 && self.num_in_progress == 0 && self.num_waiting == 0
    }
}

/// Abbreviate a byte count with binary units ("1.5Mi")
pub(crate) fn abbrev_size(size: u64) -> String {
    const UNITS: [&str; 3] = ["Ki", "Mi", "Gi"];
    if size < 1024 {
        return size.to_string();
    }
    let mut value = size as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", value, UNITS[unit])
}
