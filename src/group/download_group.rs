//! A single download group and its protocol driver

use super::uri_selector::{SelectionContext, UriSelector};
use super::ServerStatMan;
use crate::config::EngineConfig;
use crate::engine::Task;
use crate::error::{EngineError, FailureSignal, Result};
use crate::protocol::{DownloadResult, GroupId, ResultCode, TransferStat, UriResult};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a driver sees when its group is activated
#[derive(Debug, Clone)]
pub struct GroupContext {
    pub gid: GroupId,
    pub options: Arc<EngineConfig>,
}

/// Protocol-specific side of a download group
///
/// The engine only knows groups through this trait: how to start them,
/// whether they finished, and what they leave behind.
pub trait GroupDriver {
    /// False while the group waits on something else, e.g. metadata
    fn is_dependency_resolved(&self) -> bool {
        true
    }

    /// Tasks to schedule when the group becomes active. Tasks that belong
    /// to the group are counted against it.
    fn create_initial_tasks(&mut self, ctx: &GroupContext) -> Result<Vec<Box<dyn Task>>>;

    /// Whether the payload is complete
    fn download_finished(&self) -> bool {
        false
    }

    /// Flush and close output once the group has stopped
    fn close_file(&mut self) -> Result<()> {
        Ok(())
    }

    /// Follow-up groups for a finished download
    fn post_download(&mut self) -> Vec<DownloadGroup> {
        Vec::new()
    }

    fn file_path(&self) -> Option<PathBuf> {
        None
    }

    fn total_length(&self) -> u64 {
        0
    }

    fn completed_length(&self) -> u64 {
        0
    }

    /// Number of pieces, 0 when unknown
    fn num_pieces(&self) -> usize {
        0
    }

    fn transfer_stat(&self) -> TransferStat {
        TransferStat::default()
    }
}

/// Speed observed for one connection of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStat {
    pub hostname: String,
    pub protocol: String,
    pub avg_download_speed: u64,
}

/// Last failure recorded against a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupError {
    pub code: ResultCode,
    pub message: String,
    pub signal: FailureSignal,
}

impl From<&EngineError> for GroupError {
    fn from(err: &EngineError) -> Self {
        Self {
            code: err.result_code(),
            message: err.to_string(),
            signal: err.signal(),
        }
    }
}

pub struct DownloadGroup {
    gid: GroupId,
    options: Arc<EngineConfig>,
    uris: Vec<String>,
    remaining_uris: Vec<String>,
    driver: Box<dyn GroupDriver>,
    selector: Option<Box<dyn UriSelector>>,
    num_command: usize,
    num_connections: usize,
    num_concurrent: usize,
    halt_requested: bool,
    force_halt_requested: bool,
    removed: bool,
    download_finished: bool,
    timeout: Duration,
    peer_stats: Vec<PeerStat>,
    uri_results: Vec<UriResult>,
    used_addresses: Vec<(String, SocketAddr)>,
    last_error: Option<GroupError>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl DownloadGroup {
    pub fn new(options: Arc<EngineConfig>, uris: Vec<String>, driver: Box<dyn GroupDriver>) -> Self {
        let timeout = options.network.timeout();
        Self {
            gid: GroupId::next(),
            options,
            remaining_uris: uris.clone(),
            uris,
            driver,
            selector: None,
            num_command: 0,
            num_connections: 0,
            num_concurrent: 1,
            halt_requested: false,
            force_halt_requested: false,
            removed: false,
            download_finished: false,
            timeout,
            peer_stats: Vec::new(),
            uri_results: Vec::new(),
            used_addresses: Vec::new(),
            last_error: None,
            started_at: None,
            stopped_at: None,
        }
    }

    pub fn gid(&self) -> GroupId {
        self.gid
    }

    pub fn options(&self) -> &Arc<EngineConfig> {
        &self.options
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    /// URIs not yet handed out by the selector
    pub fn remaining_uris(&self) -> &[String] {
        &self.remaining_uris
    }

    pub fn driver(&self) -> &dyn GroupDriver {
        self.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> &mut dyn GroupDriver {
        self.driver.as_mut()
    }

    pub fn set_selector(&mut self, selector: Box<dyn UriSelector>) {
        self.selector = Some(selector);
    }

    pub fn set_num_concurrent(&mut self, n: usize) {
        self.num_concurrent = n.max(1);
    }

    pub fn num_command(&self) -> usize {
        self.num_command
    }

    pub(crate) fn increase_num_command(&mut self) {
        self.num_command += 1;
    }

    pub(crate) fn decrease_num_command(&mut self) {
        self.num_command = self.num_command.saturating_sub(1);
    }

    pub fn num_connections(&self) -> usize {
        self.num_connections
    }

    pub fn increase_num_connections(&mut self) {
        self.num_connections += 1;
    }

    pub fn decrease_num_connections(&mut self) {
        self.num_connections = self.num_connections.saturating_sub(1);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_halt_requested(&self) -> bool {
        self.halt_requested
    }

    pub fn is_force_halt_requested(&self) -> bool {
        self.force_halt_requested
    }

    /// Whether tasks of this group must wind down
    pub fn should_stop(&self) -> bool {
        self.halt_requested || self.force_halt_requested
    }

    pub fn set_halt_requested(&mut self, halt: bool) {
        self.halt_requested = halt;
    }

    pub fn set_force_halt_requested(&mut self, halt: bool) {
        self.force_halt_requested = halt;
    }

    /// Halt and report the group as removed
    pub fn request_remove(&mut self) {
        self.removed = true;
        self.halt_requested = true;
    }

    pub fn mark_download_finished(&mut self) {
        self.download_finished = true;
    }

    pub fn is_download_finished(&self) -> bool {
        self.download_finished || self.driver.download_finished()
    }

    pub fn add_peer_stat(&mut self, stat: PeerStat) {
        self.peer_stats.push(stat);
    }

    /// Fastest observation per (host, protocol)
    pub fn fastest_peer_stats(&self) -> Vec<PeerStat> {
        let mut fastest: Vec<PeerStat> = Vec::new();
        for stat in &self.peer_stats {
            match fastest
                .iter_mut()
                .find(|s| s.hostname == stat.hostname && s.protocol == stat.protocol)
            {
                Some(existing) if existing.avg_download_speed < stat.avg_download_speed => {
                    *existing = stat.clone();
                }
                Some(_) => {}
                None => fastest.push(stat.clone()),
            }
        }
        fastest
    }

    pub fn uri_results(&self) -> &[UriResult] {
        &self.uri_results
    }

    pub fn record_uri_result(&mut self, uri: &str, result: ResultCode) {
        self.uri_results.push(UriResult::new(uri, result));
    }

    /// Address a connection to `uri` actually used
    pub fn record_used_address(&mut self, uri: &str, addr: SocketAddr) {
        self.used_addresses.retain(|(u, _)| u != uri);
        self.used_addresses.push((uri.to_string(), addr));
    }

    pub fn used_address(&self, uri: &str) -> Option<SocketAddr> {
        self.used_addresses
            .iter()
            .find(|(u, _)| u == uri)
            .map(|(_, addr)| *addr)
    }

    pub fn last_error(&self) -> Option<&GroupError> {
        self.last_error.as_ref()
    }

    pub fn set_last_error(&mut self, err: &EngineError) {
        self.last_error = Some(GroupError::from(err));
    }

    pub(crate) fn mark_started(&mut self, now: Instant) {
        self.started_at.get_or_insert(now);
    }

    pub(crate) fn mark_stopped(&mut self, now: Instant) {
        self.stopped_at.get_or_insert(now);
    }

    /// Pick the next URI with the configured selector
    pub fn select_uri(&mut self, stats: &ServerStatMan) -> Option<String> {
        let mut ctx = SelectionContext {
            num_pieces: self.driver.num_pieces(),
            num_concurrent: self.num_concurrent,
            num_connections: self.num_connections,
            timeout: self.timeout,
            timed_out_uris: self
                .uri_results
                .iter()
                .filter(|r| r.result == ResultCode::TimeOut)
                .map(|r| r.uri.clone())
                .collect(),
        };
        let selected = match self.selector.as_mut() {
            Some(selector) => selector.select(&mut self.remaining_uris, &mut ctx, stats),
            None if self.remaining_uris.is_empty() => None,
            None => Some(self.remaining_uris.remove(0)),
        };
        self.timeout = ctx.timeout;
        if let Some(uri) = &selected {
            tracing::debug!("GID#{} selected {}", self.gid, uri);
        }
        selected
    }

    /// Lowest speed limit for this group's connections
    pub fn lowest_speed_limit(&self, stats: &ServerStatMan) -> u64 {
        let current = self.options.lowest_speed_limit;
        match &self.selector {
            Some(selector) => selector.adjust_lowest_speed_limit(&self.remaining_uris, current, stats),
            None => current,
        }
    }

    /// Final classification of a stopped group
    pub fn final_result_code(&self) -> ResultCode {
        if self.is_download_finished() {
            return ResultCode::Finished;
        }
        if self.removed {
            return ResultCode::Removed;
        }
        if let Some(err) = &self.last_error {
            if err.signal == FailureSignal::Abort {
                return err.code;
            }
        }
        if self.remaining_uris.is_empty() && self.uri_results.len() > 1 {
            return ResultCode::AllMirrorsFailed;
        }
        if let Some(err) = &self.last_error {
            return err.code;
        }
        if let Some(last) = self.uri_results.last() {
            return last.result;
        }
        if self.should_stop() {
            return ResultCode::InProgress;
        }
        ResultCode::UnknownError
    }

    pub fn create_download_result(&self, now: Instant) -> DownloadResult {
        let stat = self.driver.transfer_stat();
        let session_time_ms = match self.started_at {
            Some(started) => {
                let stopped = self.stopped_at.unwrap_or(now);
                stopped.saturating_duration_since(started).as_millis() as u64
            }
            None => 0,
        };
        let result = self.final_result_code();
        DownloadResult {
            gid: self.gid,
            result,
            error_message: self
                .last_error
                .as_ref()
                .filter(|_| result.is_error())
                .map(|e| e.message.clone()),
            file_path: self.driver.file_path(),
            uris: self.uris.clone(),
            uri_results: self.uri_results.clone(),
            total_length: self.driver.total_length(),
            completed_length: self.driver.completed_length(),
            session_download_length: stat.session_download_length,
            session_time_ms,
            followed_by: Vec::new(),
        }
    }
}

impl std::fmt::Debug for DownloadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadGroup")
            .field("gid", &self.gid)
            .field("uris", &self.uris)
            .field("num_command", &self.num_command)
            .field("halt_requested", &self.halt_requested)
            .field("force_halt_requested", &self.force_halt_requested)
            .finish()
    }
}
