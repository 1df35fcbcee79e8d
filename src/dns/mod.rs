//! DNS Protocol Implementation
//!
//! # Module Structure
//!
//! * `protocol` - DNS protocol definitions and packet handling
//! * `buffer` - Low-level packet buffer operations
//! * `authority` - Authoritative zone management
//! * `cache` - DNS response caching with TTL support
//! * `client` - DNS client for outgoing queries
//! * `resolve` - Resolution through zones, cache and upstreams
//! * `security` - Rate limiting, query validation and RRL
//! * `zone_transfer` - AXFR/IXFR for primaries and secondaries
//! * `server` - UDP, TCP and zone transfer listeners
//! * `context` - Server configuration and shared state

/// Authoritative DNS zone management
pub mod authority;

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// DNS response caching with TTL support
pub mod cache;

/// DNS client for making outgoing queries
pub mod client;

/// Server configuration and shared context
pub mod context;

/// Prometheus metrics collection and export
pub mod metrics;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// Query resolution
pub mod resolve;

/// DNS security module (rate limiting, validation, RRL)
pub mod security;

/// UDP and TCP DNS server implementations
pub mod server;

/// Zone Transfer (AXFR/IXFR) implementation for primary and secondary servers
pub mod zone_transfer;

/// Internal network utilities
mod netutil;
