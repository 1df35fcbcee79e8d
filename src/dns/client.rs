//! client for sending DNS queries to other servers

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use derive_more::{Display, Error, From};
use futures::future::BoxFuture;
use tokio::net::{TcpStream, UdpSocket};

use crate::dns::netutil::{read_packet, write_packet};
use crate::dns::protocol::{normalize_name, DnsPacket, DnsQuestion, QueryType, UDP_PAYLOAD_SIZE};

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(crate::dns::protocol::ProtocolError),
    Io(std::io::Error),
    LookupFailed,
    TimeOut,
}

type Result<T> = std::result::Result<T, ClientError>;

/// Receive buffer size for upstream replies, large enough for any EDNS
/// payload an upstream might send back.
const RECV_BUFFER_SIZE: usize = 4096;

/// Sends a single question to an upstream server.
///
/// The returned future is boxed so that the resolver can hold any
/// implementation behind a trait object.
pub trait DnsClient {
    fn get_sent_count(&self) -> usize;
    fn get_failed_count(&self) -> usize;

    fn send_query<'a>(
        &'a self,
        qname: &'a str,
        qtype: QueryType,
        server: SocketAddr,
        recursive: bool,
    ) -> BoxFuture<'a, Result<DnsPacket>>;
}

/// The network client
///
/// Every query gets its own ephemeral UDP socket connected to the upstream,
/// so replies from other hosts never reach it. Replies whose id or question
/// do not match the query are discarded. Truncated replies are retried over
/// TCP.
#[derive(Clone, Default)]
pub struct DnsNetworkClient {
    total_sent: Arc<AtomicUsize>,
    total_failed: Arc<AtomicUsize>,
}

fn build_query(qname: &str, qtype: QueryType, recursive: bool) -> DnsPacket {
    let mut packet = DnsPacket::new();

    packet.header.id = rand::random::<u16>();
    packet.header.recursion_desired = recursive;

    packet
        .questions
        .push(DnsQuestion::new(qname.to_string(), qtype));

    packet
}

/// True if `response` answers `query`.
fn matches_query(query: &DnsPacket, response: &DnsPacket) -> bool {
    if response.header.id != query.header.id || !response.header.response {
        return false;
    }

    match (query.questions.first(), response.questions.first()) {
        (Some(q), Some(r)) => {
            q.qtype == r.qtype && normalize_name(&q.name) == normalize_name(&r.name)
        }
        // Some servers omit the question on errors
        (Some(_), None) => true,
        _ => false,
    }
}

impl DnsNetworkClient {
    pub fn new() -> DnsNetworkClient {
        DnsNetworkClient::default()
    }

    /// Send a DNS query using TCP transport
    pub async fn send_tcp_query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: SocketAddr,
        recursive: bool,
    ) -> Result<DnsPacket> {
        let _ = self.total_sent.fetch_add(1, Ordering::Release);

        let query = build_query(qname, qtype, recursive);
        let req = query.to_bytes()?;

        let mut stream = TcpStream::connect(server).await?;
        write_packet(&mut stream, &req).await?;

        let data = read_packet(&mut stream).await?;
        let response = DnsPacket::from_bytes(&data)?;

        if !matches_query(&query, &response) {
            let _ = self.total_failed.fetch_add(1, Ordering::Release);
            return Err(ClientError::LookupFailed);
        }

        Ok(response)
    }

    /// Send a DNS query using UDP transport
    pub async fn send_udp_query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: SocketAddr,
        recursive: bool,
    ) -> Result<DnsPacket> {
        let _ = self.total_sent.fetch_add(1, Ordering::Release);

        let query = build_query(qname, qtype, recursive);
        let req = query.to_bytes()?;
        if req.len() > UDP_PAYLOAD_SIZE {
            return Err(ClientError::LookupFailed);
        }

        let bind_addr: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;
        socket.send(&req).await?;

        let mut res_buffer = vec![0; RECV_BUFFER_SIZE];
        loop {
            let len = socket.recv(&mut res_buffer).await?;

            let packet = match DnsPacket::from_bytes(&res_buffer[..len]) {
                Ok(packet) => packet,
                Err(err) => {
                    log::info!(
                        "DnsNetworkClient failed to parse packet from {} with error: {}",
                        server,
                        err
                    );
                    continue;
                }
            };

            if matches_query(&query, &packet) {
                return Ok(packet);
            }

            log::info!(
                "Discarding mismatched response {} from {}",
                packet.header.id,
                server
            );
        }
    }

    async fn query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: SocketAddr,
        recursive: bool,
    ) -> Result<DnsPacket> {
        let packet = self.send_udp_query(qname, qtype, server, recursive).await?;
        if !packet.header.truncated_message {
            return Ok(packet);
        }

        log::info!("Truncated response - resending as TCP");
        self.send_tcp_query(qname, qtype, server, recursive).await
    }
}

impl DnsClient for DnsNetworkClient {
    fn get_sent_count(&self) -> usize {
        self.total_sent.load(Ordering::Acquire)
    }

    fn get_failed_count(&self) -> usize {
        self.total_failed.load(Ordering::Acquire)
    }

    fn send_query<'a>(
        &'a self,
        qname: &'a str,
        qtype: QueryType,
        server: SocketAddr,
        recursive: bool,
    ) -> BoxFuture<'a, Result<DnsPacket>> {
        Box::pin(async move {
            let result = self.query(qname, qtype, server, recursive).await;
            if result.is_err() {
                let _ = self.total_failed.fetch_add(1, Ordering::Release);
            }
            result
        })
    }
}
