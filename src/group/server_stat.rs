//! Per-host throughput statistics
//!
//! One [`ServerStat`] per (hostname, protocol). Stats are updated when a
//! group stops, persisted in a line-oriented text format and consulted by
//! the feedback and adaptive URI selectors.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::time::Duration;

/// Health of a server as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Ok,
    Error,
}

impl ServerStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }
}

/// Number of samples folded in as a plain mean before switching to the
/// 4/5-1/5 moving average
const MEAN_SAMPLES: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerStat {
    hostname: String,
    protocol: String,
    download_speed: u64,
    single_connection_avg_speed: u64,
    multi_connection_avg_speed: u64,
    last_updated: DateTime<Utc>,
    counter: u32,
    status: ServerStatus,
}

impl ServerStat {
    pub fn new(hostname: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            protocol: protocol.into(),
            download_speed: 0,
            single_connection_avg_speed: 0,
            multi_connection_avg_speed: 0,
            last_updated: Utc::now(),
            counter: 0,
            status: ServerStatus::Ok,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn download_speed(&self) -> u64 {
        self.download_speed
    }

    pub fn single_connection_avg_speed(&self) -> u64 {
        self.single_connection_avg_speed
    }

    pub fn multi_connection_avg_speed(&self) -> u64 {
        self.multi_connection_avg_speed
    }

    /// Best of the two running averages
    pub fn max_avg_speed(&self) -> u64 {
        self.single_connection_avg_speed
            .max(self.multi_connection_avg_speed)
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn set_last_updated(&mut self, at: DateTime<Utc>) {
        self.last_updated = at;
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn increase_counter(&mut self) {
        self.counter += 1;
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == ServerStatus::Ok
    }

    pub fn is_error(&self) -> bool {
        self.status == ServerStatus::Error
    }

    pub fn set_ok(&mut self) {
        self.status = ServerStatus::Ok;
        self.last_updated = Utc::now();
    }

    pub fn set_error(&mut self) {
        self.status = ServerStatus::Error;
        self.last_updated = Utc::now();
    }

    /// Record the latest observed speed. Any non-zero speed means the
    /// server is working again.
    pub fn update_download_speed(&mut self, speed: u64) {
        self.download_speed = speed;
        if speed > 0 {
            self.status = ServerStatus::Ok;
        }
        self.last_updated = Utc::now();
    }

    pub fn update_single_connection_avg_speed(&mut self, speed: u64) {
        let Some(avg) = self.fold(self.single_connection_avg_speed, speed) else {
            return;
        };
        if avg < (self.single_connection_avg_speed as f64 * 0.8).floor() {
            tracing::debug!(
                "ServerStat {}: resetting counter since single connection speed dropped",
                self.hostname
            );
            self.counter = 0;
        }
        tracing::debug!(
            "ServerStat {}: single connection avg speed {} -> {} (last {})",
            self.hostname,
            self.single_connection_avg_speed,
            avg as u64,
            speed
        );
        self.single_connection_avg_speed = avg as u64;
    }

    pub fn update_multi_connection_avg_speed(&mut self, speed: u64) {
        let Some(avg) = self.fold(self.multi_connection_avg_speed, speed) else {
            return;
        };
        tracing::debug!(
            "ServerStat {}: multi connection avg speed {} -> {} (last {})",
            self.hostname,
            self.multi_connection_avg_speed,
            avg as u64,
            speed
        );
        self.multi_connection_avg_speed = avg as u64;
    }

    fn fold(&self, current: u64, speed: u64) -> Option<f64> {
        if self.counter == 0 {
            return None;
        }
        let current = current as f64;
        let speed = speed as f64;
        let avg = if self.counter < MEAN_SAMPLES {
            let n = self.counter as f64;
            ((n - 1.0) / n) * current + (1.0 / n) * speed
        } else {
            0.8 * current + 0.2 * speed
        };
        Some(avg)
    }

    /// Parse one persisted line. Returns `None` for malformed lines.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = BTreeMap::new();
        for part in line.trim().split(", ") {
            let (key, value) = part.split_once('=')?;
            fields.insert(key.trim(), value.trim());
        }
        let hostname = fields.get("host").filter(|h| !h.is_empty())?;
        let protocol = fields.get("protocol").filter(|p| !p.is_empty())?;
        let mut stat = Self::new(*hostname, *protocol);
        stat.download_speed = fields.get("dl_speed")?.parse().ok()?;
        // older files carry no split averages
        stat.single_connection_avg_speed = match fields.get("sc_avg_speed") {
            Some(v) => v.parse().ok()?,
            None => 0,
        };
        stat.multi_connection_avg_speed = match fields.get("mc_avg_speed") {
            Some(v) => v.parse().ok()?,
            None => 0,
        };
        stat.counter = match fields.get("counter") {
            Some(v) => v.parse().ok()?,
            None => 0,
        };
        let secs: i64 = fields.get("last_updated")?.parse().ok()?;
        stat.last_updated = DateTime::from_timestamp(secs, 0)?;
        stat.status = match *fields.get("status")? {
            "OK" => ServerStatus::Ok,
            "ERROR" => ServerStatus::Error,
            _ => return None,
        };
        Some(stat)
    }
}

impl std::fmt::Display for ServerStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "host={}, protocol={}, dl_speed={}, sc_avg_speed={}, mc_avg_speed={}, last_updated={}, counter={}, status={}",
            self.hostname,
            self.protocol,
            self.download_speed,
            self.single_connection_avg_speed,
            self.multi_connection_avg_speed,
            self.last_updated.timestamp(),
            self.counter,
            self.status.as_str()
        )
    }
}

/// Registry of server statistics keyed by (hostname, protocol)
#[derive(Debug, Default, Clone)]
pub struct ServerStatMan {
    stats: BTreeMap<(String, String), ServerStat>,
}

impl ServerStatMan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, hostname: &str, protocol: &str) -> Option<&ServerStat> {
        self.stats.get(&(hostname.to_string(), protocol.to_string()))
    }

    pub fn find_mut(&mut self, hostname: &str, protocol: &str) -> Option<&mut ServerStat> {
        self.stats
            .get_mut(&(hostname.to_string(), protocol.to_string()))
    }

    pub fn get_or_create(&mut self, hostname: &str, protocol: &str) -> &mut ServerStat {
        self.stats
            .entry((hostname.to_string(), protocol.to_string()))
            .or_insert_with(|| ServerStat::new(hostname, protocol))
    }

    /// Add a stat unless one already exists for its key
    pub fn add(&mut self, stat: ServerStat) -> bool {
        let key = (stat.hostname.clone(), stat.protocol.clone());
        if self.stats.contains_key(&key) {
            return false;
        }
        self.stats.insert(key, stat);
        true
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerStat> {
        self.stats.values()
    }

    /// Read stats in the persisted line format. Malformed lines are
    /// skipped; returns how many stats were added.
    pub fn load<R: BufRead>(&mut self, reader: R) -> io::Result<usize> {
        let mut added = 0;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match ServerStat::parse_line(&line) {
                Some(stat) => {
                    if self.add(stat) {
                        added += 1;
                    }
                }
                None => tracing::debug!("Skipping malformed server stat line: {}", line),
            }
        }
        Ok(added)
    }

    pub fn save<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for stat in self.stats.values() {
            writeln!(writer, "{}", stat)?;
        }
        writer.flush()
    }

    /// Drop stats not updated within `timeout`
    pub fn remove_stale(&mut self, timeout: Duration) -> usize {
        self.remove_stale_at(Utc::now(), timeout)
    }

    pub fn remove_stale_at(&mut self, now: DateTime<Utc>, timeout: Duration) -> usize {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return 0;
        };
        let before = self.stats.len();
        self.stats
            .retain(|_, stat| now.signed_duration_since(stat.last_updated) <= timeout);
        before - self.stats.len()
    }
}
