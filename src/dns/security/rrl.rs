//! Response Rate Limiting (RRL)
//!
//! Limits how many identical responses a single client network receives,
//! which takes the value out of using the server as a reflector. Responses
//! over the limit are dropped, except every `slip`-th one which goes out
//! truncated so that legitimate clients can retry over TCP.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::dns::metrics::RATE_LIMIT_EVENTS;
use crate::dns::protocol::{normalize_name, DnsPacket, QueryType, ResultCode};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RrlConfig {
    pub enabled: bool,
    /// Identical responses allowed per client network and second
    pub responses_per_second: u32,
    pub window_seconds: u64,
    /// Every n-th limited response is sent truncated instead of dropped,
    /// 0 disables slipping
    pub slip: u32,
    pub ipv4_prefix: u8,
    pub ipv6_prefix: u8,
    pub max_entries: usize,
}

impl Default for RrlConfig {
    fn default() -> Self {
        RrlConfig {
            enabled: true,
            responses_per_second: 5,
            window_seconds: 1,
            slip: 2,
            ipv4_prefix: 24,
            ipv6_prefix: 56,
            max_entries: 100_000,
        }
    }
}

/// RRL action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrlAction {
    /// Send the response normally
    Allow,
    /// Send nothing
    Drop,
    /// Send an empty response with the TC bit set
    Slip,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RrlKey {
    /// Network address of the client's prefix
    prefix: IpAddr,
    response_hash: u64,
}

struct RrlEntry {
    count: u32,
    window_start: Instant,
    slip_counter: u32,
}

/// Hash identifying a class of identical responses.
pub fn compute_response_hash(qname: &str, qtype: QueryType, rcode: ResultCode) -> u64 {
    let mut hasher = DefaultHasher::new();
    normalize_name(qname).hash(&mut hasher);
    qtype.to_num().hash(&mut hasher);
    (rcode as u8).hash(&mut hasher);
    hasher.finish()
}

pub struct ResponseRateLimiter {
    config: RrlConfig,
    table: Mutex<HashMap<RrlKey, RrlEntry>>,
}

impl ResponseRateLimiter {
    pub fn new(config: RrlConfig) -> Self {
        ResponseRateLimiter {
            config,
            table: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_seconds.max(1))
    }

    fn threshold(&self) -> u32 {
        let secs = self.config.window_seconds.max(1) as u32;
        self.config.responses_per_second.saturating_mul(secs)
    }

    /// Decides what to do with `response` on its way to `client`.
    pub fn check_response(&self, client: IpAddr, response: &DnsPacket) -> RrlAction {
        let (qname, qtype) = match response.questions.first() {
            Some(q) => (q.name.as_str(), q.qtype),
            None => return RrlAction::Allow,
        };

        let hash = compute_response_hash(qname, qtype, response.header.rescode);
        self.check_at(client, hash, Instant::now())
    }

    pub fn check(&self, client: IpAddr, response_hash: u64) -> RrlAction {
        self.check_at(client, response_hash, Instant::now())
    }

    pub fn check_at(&self, client: IpAddr, response_hash: u64, now: Instant) -> RrlAction {
        if !self.config.enabled {
            return RrlAction::Allow;
        }

        let key = RrlKey {
            prefix: self.ip_to_prefix(client),
            response_hash,
        };

        let window = self.window();
        let mut table = self.table.lock();

        if !table.contains_key(&key) && table.len() >= self.config.max_entries {
            table.retain(|_, entry| now.saturating_duration_since(entry.window_start) < window);
            if table.len() >= self.config.max_entries {
                log::debug!("RRL table full, not tracking {}", client);
                return RrlAction::Allow;
            }
        }

        let entry = table.entry(key).or_insert_with(|| RrlEntry {
            count: 0,
            window_start: now,
            slip_counter: 0,
        });

        if now.saturating_duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.slip_counter = 0;
            entry.window_start = now;
        }

        entry.count = entry.count.saturating_add(1);
        if entry.count <= self.threshold() {
            return RrlAction::Allow;
        }

        if self.config.slip > 0 {
            entry.slip_counter += 1;
            if entry.slip_counter % self.config.slip == 0 {
                RATE_LIMIT_EVENTS.with_label_values(&["slip", "rrl"]).inc();
                return RrlAction::Slip;
            }
        }

        RATE_LIMIT_EVENTS.with_label_values(&["drop", "rrl"]).inc();
        RrlAction::Drop
    }

    fn ip_to_prefix(&self, ip: IpAddr) -> IpAddr {
        let prefix = match ip {
            IpAddr::V4(_) => self.config.ipv4_prefix.min(32),
            IpAddr::V6(_) => self.config.ipv6_prefix.min(128),
        };

        IpNetwork::new(ip, prefix)
            .map(|network| network.network())
            .unwrap_or(ip)
    }

    /// Removes entries whose window ended some time ago.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let window = self.window();

        let mut table = self.table.lock();
        let before = table.len();
        table.retain(|_, entry| now.saturating_duration_since(entry.window_start) < window * 2);

        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}
