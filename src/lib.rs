//! Warden DNS Server
//!
//! A DNS protocol engine in Rust: authoritative zones, a caching forwarder
//! and zone transfers, behind per-client security gates.
//!
//! # Features
//!
//! * DNS wire format with name compression (UDP and TCP)
//! * Authoritative zones with wildcard and CNAME handling
//! * Forwarding to upstream servers with failover and caching
//! * Rate limiting, query validation and response rate limiting
//! * AXFR and IXFR zone transfers, as primary and as secondary

/// DNS server implementation and protocol handling
pub mod dns;
