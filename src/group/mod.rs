//! Download group admission
//!
//! [`GroupManager`] bounds the number of active groups, promotes waiting
//! groups in FIFO order and finalizes groups whose task count has dropped
//! to zero. Stopped groups feed their per-host speeds into the server
//! statistics used by mirror selection.

mod download_group;
mod server_stat;
mod uri_selector;

pub use download_group::{DownloadGroup, GroupContext, GroupDriver, GroupError, PeerStat};
pub use server_stat::{ServerStat, ServerStatMan, ServerStatus};
pub use uri_selector::{
    make_selector, stat_key, AdaptiveUriSelector, FeedbackUriSelector, InOrderUriSelector,
    SelectionContext, UriSelector, MAX_TIMEOUT,
};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::engine::Task;
use crate::error::{EngineError, Result};
use crate::protocol::{abbrev_size, DownloadResult, DownloadStat, GroupId, ResultCode, TransferStat};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Callbacks fired once per finalized group
pub trait DownloadHook {
    fn on_complete(&mut self, _result: &DownloadResult) {}

    fn on_error(&mut self, _result: &DownloadResult) {}

    /// Halted or removed before finishing
    fn on_stop(&mut self, _result: &DownloadResult) {}
}

pub struct GroupManager {
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    active: Vec<DownloadGroup>,
    waiting: VecDeque<DownloadGroup>,
    results: Vec<DownloadResult>,
    server_stats: ServerStatMan,
    hooks: Vec<Box<dyn DownloadHook>>,
    halted: bool,
}

impl GroupManager {
    pub fn new(config: Arc<EngineConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            active: Vec::new(),
            waiting: VecDeque::new(),
            results: Vec::new(),
            server_stats: ServerStatMan::new(),
            hooks: Vec::new(),
            halted: false,
        }
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Queue a group behind the existing waiting groups
    pub fn add_waiting(&mut self, group: DownloadGroup) -> GroupId {
        let gid = group.gid();
        tracing::debug!("GID#{} queued", gid);
        self.waiting.push_back(group);
        gid
    }

    pub fn add_hook(&mut self, hook: Box<dyn DownloadHook>) {
        self.hooks.push(hook);
    }

    /// Activate waiting groups up to the concurrency ceiling. Returns the
    /// initial tasks of the newly active groups.
    pub fn fill_from_waiting_queue(&mut self) -> Vec<Box<dyn Task>> {
        let mut tasks = Vec::new();
        if self.halted {
            return tasks;
        }
        let ceiling = self.config.max_concurrent_downloads;
        let mut blocked = Vec::new();
        let mut added = 0;

        while self.active.len() < ceiling {
            let Some(mut group) = self.waiting.pop_front() else {
                break;
            };
            let gid = group.gid();
            if !group.driver().is_dependency_resolved() {
                tracing::debug!("GID#{} has unresolved dependencies, requeued", gid);
                blocked.push(group);
                continue;
            }

            group.set_selector(make_selector(&self.config));
            group.mark_started(self.clock.now());
            let ctx = GroupContext {
                gid,
                options: Arc::clone(group.options()),
            };
            match group.driver_mut().create_initial_tasks(&ctx) {
                Ok(initial) => {
                    for task in &initial {
                        if task.group() == Some(gid) {
                            group.increase_num_command();
                        }
                    }
                    tasks.extend(initial);
                    self.active.push(group);
                    added += 1;
                }
                Err(err) => {
                    tracing::error!("GID#{} could not be started: {}", gid, err);
                    group.set_last_error(&err);
                    self.finalize(group);
                }
            }
        }
        self.waiting.extend(blocked);

        if added > 0 {
            tracing::debug!("{} download group(s) added", added);
        }
        tasks
    }

    /// Finalize active groups with no tasks left. Returns how many were
    /// removed.
    pub fn remove_stopped_groups(&mut self) -> usize {
        let (stopped, active): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|g| g.num_command() == 0);
        self.active = active;

        let removed = stopped.len();
        for group in stopped {
            self.update_server_stat(&group);
            self.finalize(group);
        }
        if removed > 0 {
            tracing::debug!("{} download group(s) deleted", removed);
        }
        removed
    }

    fn update_server_stat(&mut self, group: &DownloadGroup) {
        let fastest = group.fastest_peer_stats();
        let single = fastest.len() == 1;
        for peer in &fastest {
            if peer.hostname.is_empty() || peer.protocol.is_empty() || peer.avg_download_speed == 0 {
                continue;
            }
            let stat = self.server_stats.get_or_create(&peer.hostname, &peer.protocol);
            stat.increase_counter();
            stat.update_download_speed(peer.avg_download_speed);
            if single {
                stat.update_single_connection_avg_speed(peer.avg_download_speed);
            } else {
                stat.update_multi_connection_avg_speed(peer.avg_download_speed);
            }
        }
    }

    fn finalize(&mut self, mut group: DownloadGroup) {
        let now = self.clock.now();
        let gid = group.gid();
        group.mark_stopped(now);
        if let Err(err) = group.driver_mut().close_file() {
            tracing::warn!("GID#{} closing file failed: {}", gid, err);
            group.set_last_error(&err);
        }

        let mut result = group.create_download_result(now);
        if result.result == ResultCode::Finished {
            let follow_ups = group.driver_mut().post_download();
            result.followed_by = follow_ups.iter().map(|g| g.gid()).collect();
            for follow_up in follow_ups.into_iter().rev() {
                tracing::debug!("GID#{} follows GID#{}", follow_up.gid(), gid);
                self.waiting.push_front(follow_up);
            }
        }

        match result.result {
            ResultCode::Finished => {
                tracing::info!("Download complete: {}", result.display_path());
                for hook in &mut self.hooks {
                    hook.on_complete(&result);
                }
            }
            ResultCode::InProgress | ResultCode::Removed => {
                tracing::info!("Download GID#{} stopped ({})", gid, result.result);
                for hook in &mut self.hooks {
                    hook.on_stop(&result);
                }
            }
            code => {
                tracing::warn!(
                    "Download GID#{} failed: {}{}",
                    gid,
                    code,
                    result
                        .error_message
                        .as_ref()
                        .map(|m| format!(" ({})", m))
                        .unwrap_or_default()
                );
                for hook in &mut self.hooks {
                    hook.on_error(&result);
                }
            }
        }
        self.results.push(result);
    }

    /// Ask every active group to stop; nothing new is activated afterwards
    pub fn halt(&mut self) {
        self.halted = true;
        for group in &mut self.active {
            group.set_halt_requested(true);
        }
    }

    pub fn force_halt(&mut self) {
        self.halted = true;
        for group in &mut self.active {
            group.set_force_halt_requested(true);
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// True when no active group is left and no waiting group can start
    pub fn downloads_finished(&self) -> bool {
        self.active.is_empty() && (self.halted || self.waiting.is_empty())
    }

    pub fn num_active(&self) -> usize {
        self.active.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn active_groups(&self) -> impl Iterator<Item = &DownloadGroup> {
        self.active.iter()
    }

    pub fn waiting_groups(&self) -> impl Iterator<Item = &DownloadGroup> {
        self.waiting.iter()
    }

    pub fn results(&self) -> &[DownloadResult] {
        &self.results
    }

    pub fn is_active(&self, gid: GroupId) -> bool {
        self.active.iter().any(|g| g.gid() == gid)
    }

    /// Active or waiting group by GID
    pub fn find_group(&self, gid: GroupId) -> Option<&DownloadGroup> {
        self.active
            .iter()
            .chain(self.waiting.iter())
            .find(|g| g.gid() == gid)
    }

    pub fn find_group_mut(&mut self, gid: GroupId) -> Option<&mut DownloadGroup> {
        self.active
            .iter_mut()
            .chain(self.waiting.iter_mut())
            .find(|g| g.gid() == gid)
    }

    /// Drop a waiting group, recording it as removed
    pub fn remove_waiting(&mut self, gid: GroupId) -> bool {
        let Some(pos) = self.waiting.iter().position(|g| g.gid() == gid) else {
            return false;
        };
        if let Some(mut group) = self.waiting.remove(pos) {
            group.request_remove();
            self.finalize(group);
        }
        true
    }

    /// Remove a group wherever it is. Active groups are halted and finalized
    /// once their tasks have wound down.
    pub fn remove_group(&mut self, gid: GroupId) -> Result<()> {
        if let Some(group) = self.active.iter_mut().find(|g| g.gid() == gid) {
            group.request_remove();
            return Ok(());
        }
        if self.remove_waiting(gid) {
            return Ok(());
        }
        Err(EngineError::NotFound(gid.to_string()))
    }

    /// Move a waiting group to `position` (clamped); returns the new position
    pub fn move_waiting(&mut self, gid: GroupId, position: usize) -> Result<usize> {
        let pos = self
            .waiting
            .iter()
            .position(|g| g.gid() == gid)
            .ok_or_else(|| EngineError::NotFound(gid.to_string()))?;
        let group = self
            .waiting
            .remove(pos)
            .ok_or_else(|| EngineError::NotFound(gid.to_string()))?;
        let position = position.min(self.waiting.len());
        self.waiting.insert(position, group);
        Ok(position)
    }

    pub fn download_stat(&self) -> DownloadStat {
        let mut stat = DownloadStat {
            num_finished: 0,
            num_error: 0,
            num_in_progress: 0,
            num_removed: 0,
            num_waiting: self.waiting.len(),
            last_error_result: ResultCode::Finished,
        };
        for result in &self.results {
            match result.result {
                ResultCode::Finished => stat.num_finished += 1,
                ResultCode::InProgress => stat.num_in_progress += 1,
                ResultCode::Removed => stat.num_removed += 1,
                code => {
                    stat.num_error += 1;
                    stat.last_error_result = code;
                }
            }
        }
        stat
    }

    /// Print the result table with its status legend
    pub fn format_download_results<W: Write>(&self, mut out: W) -> io::Result<()> {
        writeln!(out)?;
        writeln!(out, "Download Results:")?;
        writeln!(out, "gid|stat|avg speed  |path/URI")?;
        writeln!(
            out,
            "===+====+===========+=========================================================="
        )?;

        let (mut ok, mut err, mut inpr, mut rm) = (0, 0, 0, 0);
        let now = self.clock.now();
        let results = self
            .results
            .iter()
            .cloned()
            .chain(self.active.iter().map(|g| {
                let mut result = g.create_download_result(now);
                if result.result != ResultCode::Finished {
                    result.result = ResultCode::InProgress;
                }
                result
            }));
        for result in results {
            match result.result {
                ResultCode::Finished => ok += 1,
                ResultCode::InProgress => inpr += 1,
                ResultCode::Removed => rm += 1,
                _ => err += 1,
            }
            writeln!(out, "{}", format_result_line(&result))?;
        }

        if ok + err + inpr + rm > 0 {
            writeln!(out)?;
            writeln!(out, "Status Legend:")?;
            let mut legend = String::new();
            if ok > 0 {
                legend.push_str(" (OK):download completed.");
            }
            if err > 0 {
                legend.push_str("(ERR):error occurred.");
            }
            if inpr > 0 {
                legend.push_str("(INPR):download in-progress.");
            }
            if rm > 0 {
                legend.push_str("(RM):download removed.");
            }
            writeln!(out, "{}", legend)?;
        }
        Ok(())
    }

    /// Transfer statistics summed over active groups
    pub fn calculate_stat(&self) -> TransferStat {
        let mut total = TransferStat::default();
        for group in &self.active {
            total += group.driver().transfer_stat();
        }
        total
    }

    pub fn does_overall_download_speed_exceed(&self) -> bool {
        match self.config.max_overall_download_limit {
            Some(limit) if limit > 0 => limit < self.calculate_stat().download_speed,
            _ => false,
        }
    }

    pub fn does_overall_upload_speed_exceed(&self) -> bool {
        match self.config.max_overall_upload_limit {
            Some(limit) if limit > 0 => limit < self.calculate_stat().upload_speed,
            _ => false,
        }
    }

    pub fn server_stats(&self) -> &ServerStatMan {
        &self.server_stats
    }

    pub fn server_stats_mut(&mut self) -> &mut ServerStatMan {
        &mut self.server_stats
    }

    /// Load server stats, dropping entries older than the stat timeout.
    /// Returns how many loaded entries were kept.
    pub fn load_server_stat(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| EngineError::storage(path, e.to_string()))?;
        let added = self
            .server_stats
            .load(BufReader::new(file))
            .map_err(|e| EngineError::storage(path, e.to_string()))?;
        let stale = self.remove_stale_server_stat(self.config.server_stat_timeout());
        tracing::info!(
            "Server stats loaded from {:?} ({} entries, {} stale dropped)",
            path,
            added,
            stale
        );
        Ok(added.saturating_sub(stale))
    }

    /// Write server stats through a temporary file renamed into place
    pub fn save_server_stat(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut temp = path.as_os_str().to_owned();
        temp.push("__temp");
        let temp = PathBuf::from(temp);

        let file = File::create(&temp).map_err(|e| EngineError::storage(&temp, e.to_string()))?;
        self.server_stats
            .save(BufWriter::new(file))
            .map_err(|e| EngineError::storage(&temp, e.to_string()))?;
        fs::rename(&temp, path).map_err(|e| EngineError::storage(path, e.to_string()))?;
        tracing::info!("Server stats saved to {:?}", path);
        Ok(())
    }

    pub fn remove_stale_server_stat(&mut self, timeout: Duration) -> usize {
        self.server_stats.remove_stale(timeout)
    }

    /// Next URI for `gid`, chosen by the group's selector
    pub fn select_uri(&mut self, gid: GroupId) -> Option<String> {
        let stats = &self.server_stats;
        let group = self.active.iter_mut().find(|g| g.gid() == gid)?;
        group.select_uri(stats)
    }

    pub fn record_uri_result(&mut self, gid: GroupId, uri: &str, result: ResultCode) {
        if let Some(group) = self.find_group_mut(gid) {
            group.record_uri_result(uri, result);
        }
    }

    pub fn record_connected_address(&mut self, gid: GroupId, uri: &str, addr: SocketAddr) {
        if let Some(group) = self.find_group_mut(gid) {
            group.record_used_address(uri, addr);
        }
    }

    pub fn on_task_error(&mut self, gid: GroupId, err: &EngineError) {
        if let Some(group) = self.find_group_mut(gid) {
            group.set_last_error(err);
        }
    }

    pub(crate) fn increase_num_command(&mut self, gid: GroupId) {
        if let Some(group) = self.find_group_mut(gid) {
            group.increase_num_command();
        }
    }

    pub(crate) fn decrease_num_command(&mut self, gid: GroupId) {
        if let Some(group) = self.find_group_mut(gid) {
            group.decrease_num_command();
        }
    }

    /// Whether tasks of `gid` must wind down. A missing group counts as
    /// stopped.
    pub fn should_stop(&self, gid: GroupId) -> bool {
        self.find_group(gid).map(|g| g.should_stop()).unwrap_or(true)
    }
}

fn format_result_line(result: &DownloadResult) -> String {
    let speed = match result.average_speed() {
        Some(speed) => format!("{}B/s", abbrev_size(speed)),
        None => "n/a".to_string(),
    };
    let target = if result.result == ResultCode::Finished || result.uris.is_empty() {
        result
            .file_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "n/a".to_string())
    } else if result.uris.len() > 1 {
        format!("{} ({}more)", result.uris[0], result.uris.len() - 1)
    } else {
        result.uris[0].clone()
    };
    format!(
        "{:>3}|{:>4}|{:>11}|{}",
        result.gid.raw(),
        result.result.status_mark(),
        speed,
        target
    )
}
