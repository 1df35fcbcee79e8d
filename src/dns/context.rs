//! The `ServerContext` holds the common state shared by every listener task
//!
//! Nothing in the server lives in module level statics apart from metrics:
//! zones, cache, security state, the transfer journal and the upstream
//! client are all owned here and handed to the tasks through an `Arc`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::dns::authority::Authority;
use crate::dns::cache::{SynchronizedCache, DEFAULT_MAX_ENTRIES};
use crate::dns::client::{DnsClient, DnsNetworkClient};
use crate::dns::resolve::Resolver;
use crate::dns::security::{SecurityConfig, SecurityManager};
use crate::dns::zone_transfer::{ZoneTransferConfig, ZoneTransferHandler};

#[derive(Debug, Display, From, Error)]
pub enum ContextError {
    Authority(crate::dns::authority::AuthorityError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ContextError>;

#[derive(Default)]
pub struct ServerStatistics {
    pub tcp_query_count: AtomicUsize,
    pub udp_query_count: AtomicUsize,
    pub dropped_count: AtomicUsize,
    pub transfer_count: AtomicUsize,
}

impl ServerStatistics {
    pub fn get_tcp_query_count(&self) -> usize {
        self.tcp_query_count.load(Ordering::Acquire)
    }

    pub fn get_udp_query_count(&self) -> usize {
        self.udp_query_count.load(Ordering::Acquire)
    }

    pub fn get_dropped_count(&self) -> usize {
        self.dropped_count.load(Ordering::Acquire)
    }

    pub fn get_transfer_count(&self) -> usize {
        self.transfer_count.load(Ordering::Acquire)
    }
}

/// Order in which configured upstream servers are tried
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamOrder {
    /// Exactly as listed
    AsConfigured,
    /// All IPv4 servers, then all IPv6 servers, each in listed order
    Ipv4First,
    /// Alternating between families, starting with IPv4
    Interleaved,
}

impl Default for UpstreamOrder {
    fn default() -> Self {
        UpstreamOrder::Ipv4First
    }
}

/// Startup parameters for the listeners and the resolver
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: IpAddr,
    pub dns_port: u16,
    /// Dedicated port for zone transfers, if any
    pub transfer_port: Option<u16>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub upstreams: Vec<SocketAddr>,
    pub upstream_order: UpstreamOrder,
    pub upstream_timeout_ms: u64,
    /// TCP connections with no complete query for this long are closed
    pub tcp_idle_timeout_ms: u64,
    pub allow_recursive: bool,
    pub max_cname_depth: usize,
    pub cache_max_entries: usize,
    /// Directory holding binary zone snapshots to load at startup
    pub zones_dir: Option<PathBuf>,
    pub cleanup_interval_secs: u64,
    pub security: SecurityConfig,
    pub transfer: ZoneTransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dns_port: 53,
            transfer_port: None,
            enable_udp: true,
            enable_tcp: true,
            upstreams: Vec::new(),
            upstream_order: UpstreamOrder::default(),
            upstream_timeout_ms: 2000,
            tcp_idle_timeout_ms: 30_000,
            allow_recursive: true,
            max_cname_depth: 8,
            cache_max_entries: DEFAULT_MAX_ENTRIES,
            zones_dir: None,
            cleanup_interval_secs: 60,
            security: SecurityConfig::default(),
            transfer: ZoneTransferConfig::default(),
        }
    }
}

/// Main server context containing configuration and shared state
pub struct ServerContext {
    pub authority: Authority,
    pub cache: SynchronizedCache,
    pub client: Box<dyn DnsClient + Sync + Send>,
    pub security: SecurityManager,
    pub transfer: ZoneTransferHandler,
    pub config: ServerConfig,
    pub statistics: ServerStatistics,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> ServerContext {
        ServerContext::with_client(config, Box::new(DnsNetworkClient::new()))
    }

    pub fn with_client(config: ServerConfig, client: Box<dyn DnsClient + Sync + Send>) -> ServerContext {
        ServerContext {
            authority: Authority::new(),
            cache: SynchronizedCache::new(config.cache_max_entries),
            client,
            security: SecurityManager::new(config.security.clone()),
            transfer: ZoneTransferHandler::new(config.transfer.clone()),
            config,
            statistics: ServerStatistics::default(),
        }
    }

    /// Loads zone snapshots from the configured directory, if any.
    pub fn initialize(&self) -> Result<()> {
        if let Some(ref zones_dir) = self.config.zones_dir {
            std::fs::create_dir_all(zones_dir)?;
            self.authority.load(zones_dir)?;
            log::info!(
                "Loaded {} zones from {:?}",
                self.authority.zones().len(),
                zones_dir
            );
        }

        Ok(())
    }

    pub fn resolver(self: &Arc<Self>) -> Resolver {
        Resolver::new(self.clone())
    }
}

#[cfg(test)]
pub mod tests {

    use std::sync::Arc;

    use crate::dns::client::tests::{DnsStubClient, StubCallback};

    use super::*;

    /// Context with a single upstream at 127.0.0.1:53 answering through
    /// `callback`.
    pub fn create_test_context(callback: Box<StubCallback>) -> Arc<ServerContext> {
        let config = ServerConfig {
            upstreams: vec!["127.0.0.1:53".parse().unwrap()],
            ..ServerConfig::default()
        };

        create_test_context_with(config, callback)
    }

    pub fn create_test_context_with(
        config: ServerConfig,
        callback: Box<StubCallback>,
    ) -> Arc<ServerContext> {
        Arc::new(ServerContext::with_client(
            config,
            Box::new(DnsStubClient::new(callback)),
        ))
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(53, config.dns_port);
        assert_eq!(2000, config.upstream_timeout_ms);
        assert_eq!(8, config.max_cname_depth);
        assert_eq!(UpstreamOrder::Ipv4First, config.upstream_order);
        assert!(config.transfer_port.is_none());
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"dns_port": 5353, "upstreams": ["192.0.2.1:53"], "allow_recursive": false}"#,
        )
        .unwrap();

        assert_eq!(5353, config.dns_port);
        assert_eq!(1, config.upstreams.len());
        assert!(!config.allow_recursive);
        assert_eq!(8, config.max_cname_depth);
    }

    #[test]
    fn test_initialize_without_zones_dir() {
        let context = ServerContext::new(ServerConfig::default());
        context.initialize().unwrap();
        assert!(context.authority.zones().is_empty());
    }
}
