//! Mirror selection strategies
//!
//! A selector picks (and removes) the next URI to try from a group's
//! remaining URIs. The feedback and adaptive strategies consult the server
//! statistics collected by earlier downloads.

use super::server_stat::{ServerStat, ServerStatMan};
use crate::config::{EngineConfig, UriSelectorKind};
use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use url::Url;

/// Upper bound the adaptive selector raises the group timeout to
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum number of mirrors the adaptive selector tests before trusting
/// statistics
const MIN_TESTED_SERVERS: usize = 3;

/// Group state a selector may read or adjust
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    /// Pieces of the download, 0 when unknown
    pub num_pieces: usize,
    /// Concurrent connections the group may open
    pub num_concurrent: usize,
    /// Connections currently open for the group
    pub num_connections: usize,
    /// Group timeout, may be raised by the selector
    pub timeout: Duration,
    /// URIs whose last attempt timed out
    pub timed_out_uris: Vec<String>,
}

pub trait UriSelector: Send {
    /// Choose the next URI and remove it from `uris`
    fn select(
        &mut self,
        uris: &mut Vec<String>,
        ctx: &mut SelectionContext,
        stats: &ServerStatMan,
    ) -> Option<String>;

    /// Lowest speed limit to apply to a download from `uris`
    fn adjust_lowest_speed_limit(&self, _uris: &[String], current: u64, _stats: &ServerStatMan) -> u64 {
        current
    }

    fn reset_counters(&mut self) {}
}

/// Selector configured by `uri_selector`
pub fn make_selector(config: &EngineConfig) -> Box<dyn UriSelector> {
    match config.uri_selector {
        UriSelectorKind::InOrder => Box::new(InOrderUriSelector),
        UriSelectorKind::Feedback => Box::new(FeedbackUriSelector),
        UriSelectorKind::Adaptive => Box::new(AdaptiveUriSelector::new(config.metalink_servers)),
    }
}

/// (hostname, protocol) of a URI, the server statistics key
pub fn stat_key(uri: &str) -> Option<(String, String)> {
    let url = Url::parse(uri).ok()?;
    let host = url.host_str()?.trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), url.scheme().to_string()))
}

fn stat_for<'a>(stats: &'a ServerStatMan, uri: &str) -> Option<&'a ServerStat> {
    let (host, protocol) = stat_key(uri)?;
    stats.find(&host, &protocol)
}

fn take(uris: &mut Vec<String>, uri: &str) -> Option<String> {
    let pos = uris.iter().position(|u| u == uri)?;
    Some(uris.remove(pos))
}

/// Always the first remaining URI
#[derive(Debug, Default, Clone, Copy)]
pub struct InOrderUriSelector;

impl UriSelector for InOrderUriSelector {
    fn select(&mut self, uris: &mut Vec<String>, _ctx: &mut SelectionContext, _stats: &ServerStatMan) -> Option<String> {
        if uris.is_empty() {
            None
        } else {
            Some(uris.remove(0))
        }
    }
}

/// Fastest known healthy server, then the first untested one, then the
/// first URI
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedbackUriSelector;

impl UriSelector for FeedbackUriSelector {
    fn select(&mut self, uris: &mut Vec<String>, _ctx: &mut SelectionContext, stats: &ServerStatMan) -> Option<String> {
        if uris.is_empty() {
            return None;
        }
        let mut fastest: Option<(&String, u64)> = None;
        let mut untested: Option<&String> = None;
        for uri in uris.iter() {
            match stat_for(stats, uri) {
                Some(stat) if stat.is_ok() => {
                    let speed = stat.download_speed();
                    if fastest.map(|(_, s)| speed > s).unwrap_or(true) {
                        fastest = Some((uri, speed));
                    }
                }
                Some(_) => {}
                None => {
                    if untested.is_none() {
                        untested = Some(uri);
                    }
                }
            }
        }
        let chosen = fastest
            .map(|(uri, _)| uri.clone())
            .or_else(|| untested.cloned())
            .unwrap_or_else(|| uris[0].clone());
        tracing::debug!("Feedback selector chose {}", chosen);
        take(uris, &chosen)
    }
}

/// Spreads connections over tested mirrors while probing untested ones
#[derive(Debug, Clone)]
pub struct AdaptiveUriSelector {
    metalink_servers: usize,
    servers_to_evaluate: i64,
    num_connections: usize,
}

impl AdaptiveUriSelector {
    pub fn new(metalink_servers: usize) -> Self {
        Self {
            metalink_servers,
            servers_to_evaluate: metalink_servers as i64 - 1,
            num_connections: 1,
        }
    }

    /// Put timed-out URIs back with a doubled timeout, as long as the
    /// doubled value stays below [`MAX_TIMEOUT`]
    fn may_retry_with_increased_timeout(&self, uris: &mut Vec<String>, ctx: &mut SelectionContext) {
        let doubled = ctx.timeout * 2;
        if doubled >= MAX_TIMEOUT {
            return;
        }
        ctx.timeout = doubled;
        for uri in &ctx.timed_out_uris {
            tracing::debug!(
                "Adaptive selector will retry {} with increased timeout ({}s)",
                uri,
                ctx.timeout.as_secs()
            );
            uris.push(uri.clone());
        }
        uris.sort();
        uris.dedup();
    }

    fn select_one(&mut self, uris: &[String], ctx: &SelectionContext, stats: &ServerStatMan) -> Option<String> {
        if uris.is_empty() {
            return None;
        }
        let reserved_context = ctx.num_pieces > 0
            && self.num_connections > ctx.num_pieces.min(ctx.num_concurrent);
        let select_best = ctx.num_pieces == 0 || reserved_context;
        if ctx.num_pieces > 0 {
            self.num_connections += 1;
        }

        if tested_count(uris, stats) < MIN_TESTED_SERVERS {
            if let Some(uri) = first_not_tested(uris, stats) {
                tracing::debug!("Adaptive selector choosing the first untested mirror: {}", uri);
                self.servers_to_evaluate -= 1;
                return Some(uri);
            }
        }

        if !select_best && self.num_connections > 1 && self.servers_to_evaluate > 0 {
            self.servers_to_evaluate -= 1;
            if let Some(uri) = first_not_tested(uris, stats) {
                tracing::debug!(
                    "Adaptive selector choosing untested mirror {} for connection #{}",
                    uri,
                    self.num_connections
                );
                return Some(uri);
            }
            if let Some(uri) = first_to_retest(uris, stats) {
                tracing::debug!(
                    "Adaptive selector choosing mirror {} not tested recently for connection #{}",
                    uri,
                    self.num_connections
                );
                return Some(uri);
            }
        }

        let max = max_speed(uris, stats);
        let min = max - max / 4;
        let bests: Vec<&String> = uris
            .iter()
            .filter(|uri| {
                stat_for(stats, uri)
                    .map(|s| s.single_connection_avg_speed() > min || s.multi_connection_avg_speed() > min)
                    .unwrap_or(false)
            })
            .collect();
        if bests.len() < 2 {
            let uri = max_speed_uri(uris, stats).unwrap_or(&uris[0]).clone();
            tracing::debug!(
                "Adaptive selector choosing the best mirror: {} B/s {} (others are at least 25% slower)",
                max,
                uri
            );
            Some(uri)
        } else {
            let uri = bests[rand::thread_rng().gen_range(0..bests.len())].clone();
            tracing::debug!(
                "Adaptive selector choosing randomly among the best mirrors ({}..{} B/s): {}",
                min,
                max,
                uri
            );
            Some(uri)
        }
    }
}

impl UriSelector for AdaptiveUriSelector {
    fn select(&mut self, uris: &mut Vec<String>, ctx: &mut SelectionContext, stats: &ServerStatMan) -> Option<String> {
        if uris.is_empty() && ctx.num_connections <= 1 {
            // about to fail: give timed-out mirrors another chance
            self.may_retry_with_increased_timeout(uris, ctx);
        }
        let selected = self.select_one(uris, ctx, stats)?;
        take(uris, &selected)
    }

    fn adjust_lowest_speed_limit(&self, uris: &[String], current: u64, stats: &ServerStatMan) -> u64 {
        const LOW_LOWEST: u64 = 4 * 1024;
        if current == 0 {
            return current;
        }
        let max = max_speed(uris, stats);
        if max > 0 && current > max / 4 {
            tracing::info!(
                "Lowering lowest-speed-limit since known max speed is too near (new:{} was:{} max:{})",
                max / 4,
                current,
                max
            );
            max / 4
        } else if max == 0 && current > LOW_LOWEST {
            tracing::info!(
                "Lowering lowest-speed-limit since there is no clue about available speed (now:{} was:{})",
                LOW_LOWEST,
                current
            );
            LOW_LOWEST
        } else {
            current
        }
    }

    fn reset_counters(&mut self) {
        self.num_connections = 1;
        self.servers_to_evaluate = self.metalink_servers as i64 - 1;
    }
}

fn tested_count(uris: &[String], stats: &ServerStatMan) -> usize {
    uris.iter().filter(|u| stat_for(stats, u).is_some()).count()
}

fn first_not_tested(uris: &[String], stats: &ServerStatMan) -> Option<String> {
    uris.iter().find(|u| stat_for(stats, u).is_none()).cloned()
}

/// First mirror not tested for 2^counter days
fn first_to_retest(uris: &[String], stats: &ServerStatMan) -> Option<String> {
    let now = Utc::now();
    uris.iter()
        .find(|uri| {
            let Some(stat) = stat_for(stats, uri) else {
                return false;
            };
            if stat.counter() > 8 {
                return false;
            }
            let days = 1i64 << stat.counter();
            now.signed_duration_since(stat.last_updated()) > chrono::Duration::days(days)
        })
        .cloned()
}

fn max_speed_uri<'a>(uris: &'a [String], stats: &ServerStatMan) -> Option<&'a String> {
    let mut best: Option<(&String, u64)> = None;
    for uri in uris {
        let Some(stat) = stat_for(stats, uri) else {
            continue;
        };
        let speed = stat.max_avg_speed();
        if best.map(|(_, s)| speed > s).unwrap_or(true) {
            best = Some((uri, speed));
        }
    }
    best.map(|(uri, _)| uri)
}

fn max_speed(uris: &[String], stats: &ServerStatMan) -> u64 {
    max_speed_uri(uris, stats)
        .and_then(|uri| stat_for(stats, uri))
        .map(|s| s.max_avg_speed())
        .unwrap_or(0)
}
