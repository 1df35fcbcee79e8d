//! resolver answering queries from local zones, the cache and upstreams

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};

use crate::dns::context::{ServerContext, UpstreamOrder};
use crate::dns::metrics::record_upstream;
use crate::dns::protocol::{normalize_name, DnsPacket, QueryType, ResultCode};

#[derive(Debug, Display, From, Error)]
pub enum ResolveError {
    Cache(crate::dns::cache::CacheError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ResolveError>;

/// Arranges upstream servers according to the configured policy.
pub fn order_upstreams(upstreams: &[SocketAddr], order: UpstreamOrder) -> Vec<SocketAddr> {
    let (v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
        upstreams.iter().copied().partition(|addr| addr.is_ipv4());

    match order {
        UpstreamOrder::AsConfigured => upstreams.to_vec(),
        UpstreamOrder::Ipv4First => v4.into_iter().chain(v6).collect(),
        UpstreamOrder::Interleaved => {
            let mut ordered = Vec::with_capacity(upstreams.len());
            let mut v4 = v4.into_iter();
            let mut v6 = v6.into_iter();
            loop {
                match (v4.next(), v6.next()) {
                    (None, None) => break,
                    (a, b) => {
                        ordered.extend(a);
                        ordered.extend(b);
                    }
                }
            }
            ordered
        }
    }
}

/// Resolves a single question
///
/// Local zones are consulted first, then the cache, and finally the
/// configured upstream servers when the client asked for recursion and the
/// server allows it. Alias chains that leave a local zone are followed
/// through the same steps, sharing one hop budget.
pub struct Resolver {
    context: Arc<ServerContext>,
}

impl Resolver {
    pub fn new(context: Arc<ServerContext>) -> Resolver {
        Resolver { context }
    }

    pub async fn resolve(&self, qname: &str, qtype: QueryType, recursive: bool) -> Result<DnsPacket> {
        let max_depth = self.context.config.max_cname_depth;

        let mut response = self.resolve_once(qname, qtype, recursive).await?;

        let mut visited = HashSet::new();
        visited.insert(normalize_name(qname));

        while response.header.rescode == ResultCode::NOERROR {
            let target = match response.get_unresolved_cname(qname, qtype) {
                Some(target) => target,
                None => break,
            };

            let hops = response
                .answers
                .iter()
                .filter(|rec| rec.get_querytype() == QueryType::Cname)
                .count();

            if hops > max_depth || !visited.insert(normalize_name(&target)) {
                log::debug!("Giving up on CNAME chain for {} at {}", qname, target);
                response.header.rescode = ResultCode::NXDOMAIN;
                break;
            }

            let next = self.resolve_once(&target, qtype, recursive).await?;

            response.header.authoritative_answer &= next.header.authoritative_answer;
            response.header.rescode = next.header.rescode;
            response.authorities = next.authorities;

            if next.answers.is_empty() {
                break;
            }

            response.answers.extend(next.answers);
        }

        Ok(response)
    }

    async fn resolve_once(&self, qname: &str, qtype: QueryType, recursive: bool) -> Result<DnsPacket> {
        let config = &self.context.config;

        if let Some(packet) = self
            .context
            .authority
            .query(qname, qtype, config.max_cname_depth)
        {
            return Ok(packet);
        }

        if let Some(packet) = self.context.cache.lookup(qname, qtype) {
            return Ok(packet);
        }

        if qtype == QueryType::A || qtype == QueryType::Aaaa {
            if let Some(packet) = self.context.cache.lookup(qname, QueryType::Cname) {
                if !packet.answers.is_empty() {
                    return Ok(packet);
                }
            }
        }

        if recursive && config.allow_recursive && !config.upstreams.is_empty() {
            return self.forward(qname, qtype).await;
        }

        let mut packet = DnsPacket::new();
        packet.header.rescode = ResultCode::NXDOMAIN;
        Ok(packet)
    }

    async fn forward(&self, qname: &str, qtype: QueryType) -> Result<DnsPacket> {
        let config = &self.context.config;
        let timeout = Duration::from_millis(config.upstream_timeout_ms);

        let mut last_response: Option<DnsPacket> = None;

        for server in order_upstreams(&config.upstreams, config.upstream_order) {
            let upstream = server.to_string();
            let start = Instant::now();

            let query = self.context.client.send_query(qname, qtype, server, true);
            match tokio::time::timeout(timeout, query).await {
                Ok(Ok(packet)) => {
                    record_upstream(&upstream, "success", start.elapsed());

                    if packet.header.rescode == ResultCode::NOERROR && !packet.answers.is_empty() {
                        self.context.cache.store(&packet.answers)?;
                        return Ok(packet);
                    }

                    last_response = Some(packet);
                }
                Ok(Err(err)) => {
                    record_upstream(&upstream, "error", start.elapsed());
                    log::info!("Upstream {} failed for {}: {}", upstream, qname, err);
                }
                Err(_) => {
                    record_upstream(&upstream, "timeout", start.elapsed());
                    log::info!("Upstream {} timed out for {}", upstream, qname);
                }
            }
        }

        match last_response {
            Some(packet) => {
                if packet.header.rescode == ResultCode::NXDOMAIN {
                    if let Some(ttl) = packet.get_ttl_from_soa() {
                        self.context.cache.store_nxdomain(qname, qtype, ttl)?;
                    }
                }
                Ok(packet)
            }
            None => {
                log::warn!("No upstream answered for {} {:?}", qname, qtype);
                let mut packet = DnsPacket::new();
                packet.header.rescode = ResultCode::SERVFAIL;
                Ok(packet)
            }
        }
    }
}
