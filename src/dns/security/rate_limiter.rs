//! Per-client query rate limiter with sliding windows

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{SecurityAction, SecurityCheckResult, SecurityEvent, ThreatLevel};
use crate::dns::metrics::RATE_LIMIT_EVENTS;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub queries_per_second: u32,
    pub queries_per_minute: u32,
    /// Queries tolerated above `queries_per_second` before the client is
    /// blocked
    pub burst_allowance: u32,
    pub block_duration_seconds: u64,
    /// Seconds without traffic after which a client's state is discarded
    pub client_idle_timeout: u64,
    /// Source ranges that bypass every limit
    pub whitelist: Vec<IpNetwork>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            enabled: true,
            queries_per_second: 50,
            queries_per_minute: 1000,
            burst_allowance: 20,
            block_duration_seconds: 60,
            client_idle_timeout: 300,
            whitelist: Vec::new(),
        }
    }
}

/// State kept for every source address seen recently
struct ClientState {
    second_window: VecDeque<Instant>,
    minute_window: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    last_seen: Instant,
    total_queries: u64,
    denied_queries: u64,
}

impl ClientState {
    fn new(now: Instant) -> ClientState {
        ClientState {
            second_window: VecDeque::new(),
            minute_window: VecDeque::new(),
            blocked_until: None,
            last_seen: now,
            total_queries: 0,
            denied_queries: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        prune_window(&mut self.second_window, now, SECOND);
        prune_window(&mut self.minute_window, now, MINUTE);
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.map(|until| now < until).unwrap_or(false)
    }
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant, size: Duration) {
    while let Some(&front) = window.front() {
        if now.saturating_duration_since(front) >= size {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Tracks query rates per source address
///
/// All client state lives behind one lock so that counters stay consistent
/// across the UDP and TCP listeners.
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: Mutex<HashMap<IpAddr, ClientState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_whitelisted(&self, client_ip: IpAddr) -> bool {
        self.config
            .whitelist
            .iter()
            .any(|network| network.contains(client_ip))
    }

    pub fn check(&self, client_ip: IpAddr) -> SecurityCheckResult {
        self.check_at(client_ip, Instant::now())
    }

    /// Counts one query from `client_ip` and decides whether it may proceed.
    ///
    /// Only admitted queries enter the windows. Filling the one second
    /// window blocks the client for `block_duration_seconds`; filling the
    /// minute window only denies the query at hand.
    pub fn check_at(&self, client_ip: IpAddr, now: Instant) -> SecurityCheckResult {
        if !self.config.enabled || self.is_whitelisted(client_ip) {
            return SecurityCheckResult::allow();
        }

        let mut clients = self.clients.lock();
        let state = clients
            .entry(client_ip)
            .or_insert_with(|| ClientState::new(now));

        state.last_seen = now;
        state.total_queries += 1;

        if state.is_blocked(now) {
            state.denied_queries += 1;
            RATE_LIMIT_EVENTS
                .with_label_values(&["dropped", "client"])
                .inc();
            return SecurityCheckResult::deny(
                SecurityAction::Drop,
                format!("client {} is blocked", client_ip),
                ThreatLevel::Medium,
                Vec::new(),
            );
        }
        state.blocked_until = None;
        state.prune(now);

        let second_cap = self
            .config
            .queries_per_second
            .saturating_add(self.config.burst_allowance) as usize;
        if state.second_window.len() >= second_cap {
            let block_duration = Duration::from_secs(self.config.block_duration_seconds);
            state.blocked_until = Some(now + block_duration);
            state.denied_queries += 1;

            log::warn!(
                "Blocking {} for {}s after {} queries in one second",
                client_ip,
                self.config.block_duration_seconds,
                state.second_window.len()
            );
            RATE_LIMIT_EVENTS
                .with_label_values(&["blocked", "client"])
                .inc();

            return SecurityCheckResult::deny(
                SecurityAction::Drop,
                format!("client {} exceeded {} queries per second", client_ip, second_cap),
                ThreatLevel::High,
                vec![SecurityEvent::ClientBlocked {
                    client_ip,
                    blocked_for_secs: self.config.block_duration_seconds,
                }],
            );
        }

        if state.minute_window.len() >= self.config.queries_per_minute as usize {
            state.denied_queries += 1;
            RATE_LIMIT_EVENTS
                .with_label_values(&["limited", "client"])
                .inc();

            return SecurityCheckResult::deny(
                SecurityAction::Drop,
                format!(
                    "client {} exceeded {} queries per minute",
                    client_ip, self.config.queries_per_minute
                ),
                ThreatLevel::Medium,
                vec![SecurityEvent::ClientRateLimited {
                    client_ip,
                    queries: state.minute_window.len(),
                }],
            );
        }

        state.second_window.push_back(now);
        state.minute_window.push_back(now);

        SecurityCheckResult::allow()
    }

    pub fn is_blocked(&self, client_ip: IpAddr) -> bool {
        self.clients
            .lock()
            .get(&client_ip)
            .map(|state| state.is_blocked(Instant::now()))
            .unwrap_or(false)
    }

    /// Number of queries denied for `client_ip` so far.
    pub fn denied_count(&self, client_ip: IpAddr) -> u64 {
        self.clients
            .lock()
            .get(&client_ip)
            .map(|state| state.denied_queries)
            .unwrap_or(0)
    }

    pub fn total_count(&self, client_ip: IpAddr) -> u64 {
        self.clients
            .lock()
            .get(&client_ip)
            .map(|state| state.total_queries)
            .unwrap_or(0)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn blocked_client_count(&self) -> usize {
        let now = Instant::now();
        self.clients
            .lock()
            .values()
            .filter(|state| state.is_blocked(now))
            .count()
    }

    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    /// Drops clients that have been idle for longer than the idle timeout
    /// and are not currently blocked. Returns the number removed.
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let idle = Duration::from_secs(self.config.client_idle_timeout);

        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, state| {
            state.is_blocked(now) || now.saturating_duration_since(state.last_seen) < idle
        });

        let removed = before - clients.len();
        if removed > 0 {
            log::debug!("Removed {} idle rate limiter entries", removed);
        }

        removed
    }
}
