//! UDP, TCP and zone transfer listeners

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use crate::dns::buffer::VectorPacketBuffer;
use crate::dns::context::ServerContext;
use crate::dns::metrics::{QueryTimer, DNS_QUERIES_TOTAL, DNS_RESPONSES_TOTAL};
use crate::dns::netutil::{read_packet, write_packet};
use crate::dns::protocol::{DnsPacket, ResultCode, TCP_PAYLOAD_SIZE, UDP_PAYLOAD_SIZE};
use crate::dns::security::{RrlAction, SecurityAction};

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
    Protocol(crate::dns::protocol::ProtocolError),
}

type Result<T> = std::result::Result<T, ServerError>;

/// Largest datagram accepted from a client
const UDP_RECV_SIZE: usize = 4096;

/// Transport a query arrived on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }

    /// Largest response the transport carries for `request`.
    fn max_size(&self, request: &DnsPacket) -> usize {
        match *self {
            Protocol::Udp => request
                .edns_payload_size()
                .map(|size| (size as usize).max(UDP_PAYLOAD_SIZE))
                .unwrap_or(UDP_PAYLOAD_SIZE),
            Protocol::Tcp => TCP_PAYLOAD_SIZE,
        }
    }
}

/// Common trait for DNS servers
pub trait DnsServer {
    /// Bind the listening socket and start serving, returning the bound
    /// address.
    ///
    /// This method should _NOT_ block. Servers spawn their accept loop on the
    /// current tokio runtime and return immediately.
    fn run_server(self) -> Result<SocketAddr>;
}

fn build_response_packet(context: &ServerContext, request: &DnsPacket) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = request.header.id;
    packet.header.opcode = request.header.opcode;
    packet.header.recursion_desired = request.header.recursion_desired;
    packet.header.recursion_available = context.config.allow_recursive;
    packet.header.response = true;
    packet.questions = request.questions.clone();
    packet
}

fn error_packet(context: &ServerContext, request: &DnsPacket, rescode: ResultCode) -> DnsPacket {
    let mut packet = build_response_packet(context, request);
    packet.header.rescode = rescode;
    packet
}

/// Runs the checks every request passes before it is answered. `Err(None)`
/// means the request is dropped without a reply.
fn screen_request(
    context: &ServerContext,
    request: &DnsPacket,
    peer: SocketAddr,
) -> std::result::Result<(), Option<DnsPacket>> {
    let check = context.security.check_request(request, peer.ip());
    if !check.allowed {
        log::debug!(
            "Request {} from {} denied: {}",
            request.header.id,
            peer,
            check.reason.as_deref().unwrap_or("no reason")
        );

        return match check.action {
            SecurityAction::FormErr => Err(Some(error_packet(context, request, ResultCode::FORMERR))),
            _ => Err(None),
        };
    }

    if request.header.opcode != 0 {
        log::info!("Unsupported opcode {} from {}", request.header.opcode, peer);
        return Err(Some(error_packet(context, request, ResultCode::NOTIMP)));
    }

    if request.questions.is_empty() {
        log::info!("Request {} from {} has no question", request.header.id, peer);
        return Err(Some(error_packet(context, request, ResultCode::FORMERR)));
    }

    Ok(())
}

/// Perform the actual work for a query
///
/// The request goes through the security gates, the resolver and finally
/// response rate limiting. `None` means nothing should be sent back. Zone
/// transfer questions are answered with NOTIMP here; transfers are only
/// served on streams, see `DnsTcpServer`.
pub async fn execute_query(
    context: Arc<ServerContext>,
    request: &DnsPacket,
    peer: SocketAddr,
    protocol: Protocol,
) -> Option<DnsPacket> {
    if let Err(reply) = screen_request(&context, request, peer) {
        return reply;
    }

    let question = &request.questions[0];
    DNS_QUERIES_TOTAL
        .with_label_values(&[protocol.as_str(), &format!("{:?}", question.qtype)])
        .inc();

    if question.qtype.is_transfer() {
        return Some(error_packet(&context, request, ResultCode::NOTIMP));
    }

    let timer = QueryTimer::start(protocol.as_str());
    let mut packet = build_response_packet(&context, request);

    let resolver = context.resolver();
    match resolver
        .resolve(&question.name, question.qtype, request.header.recursion_desired)
        .await
    {
        Ok(result) => {
            packet.header.rescode = result.header.rescode;
            packet.header.authoritative_answer = result.header.authoritative_answer;
            packet.answers = result.answers;
            packet.authorities = result.authorities;
            packet.resources = result.resources;

            timer.finish(if packet.header.authoritative_answer {
                "authority"
            } else {
                "resolver"
            });
        }
        Err(err) => {
            log::info!(
                "Failed to resolve {:?} {}: {}",
                question.qtype,
                question.name,
                err
            );
            packet.header.rescode = ResultCode::SERVFAIL;
            timer.finish("error");
        }
    }

    if protocol == Protocol::Udp {
        match context.security.check_response(&packet, peer.ip()) {
            RrlAction::Allow => {}
            RrlAction::Drop => return None,
            RrlAction::Slip => {
                packet.header.truncated_message = true;
                packet.answers.clear();
                packet.authorities.clear();
                packet.resources.clear();
            }
        }
    }

    Some(packet)
}

/// Encodes `packet` for the wire, truncating it to what the transport
/// allows for `request`.
fn encode_response(mut packet: DnsPacket, request: &DnsPacket, protocol: Protocol) -> Result<Vec<u8>> {
    let mut buffer = VectorPacketBuffer::new();
    packet.write(&mut buffer, protocol.max_size(request))?;

    DNS_RESPONSES_TOTAL
        .with_label_values(&[&format!("{:?}", packet.header.rescode), protocol.as_str()])
        .inc();

    Ok(buffer.into_inner())
}

/// The UDP server
///
/// Datagrams are read on a single task and each request is serviced in a
/// task of its own.
pub struct DnsUdpServer {
    context: Arc<ServerContext>,
}

impl DnsUdpServer {
    pub fn new(context: Arc<ServerContext>) -> DnsUdpServer {
        DnsUdpServer { context }
    }

    async fn process_request(
        context: Arc<ServerContext>,
        socket: Arc<UdpSocket>,
        src: SocketAddr,
        data: Vec<u8>,
    ) {
        let request = match DnsPacket::from_bytes(&data) {
            Ok(x) => x,
            Err(e) => {
                log::debug!("Failed to parse UDP query packet from {}: {}", src, e);
                return;
            }
        };

        let packet = match execute_query(context.clone(), &request, src, Protocol::Udp).await {
            Some(packet) => packet,
            None => {
                let _ = context.statistics.dropped_count.fetch_add(1, Ordering::Release);
                return;
            }
        };

        let data = match encode_response(packet, &request, Protocol::Udp) {
            Ok(data) => data,
            Err(e) => {
                log::info!("Failed to encode response for {}: {}", src, e);
                return;
            }
        };

        if let Err(e) = socket.send_to(&data, src).await {
            log::info!("Failed to send response packet to {}: {}", src, e);
        }
    }
}

impl DnsServer for DnsUdpServer {
    fn run_server(self) -> Result<SocketAddr> {
        let config = &self.context.config;
        let std_socket = std::net::UdpSocket::bind((config.listen_addr, config.dns_port))?;
        std_socket.set_nonblocking(true)?;

        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local_addr = socket.local_addr()?;
        log::info!("Listening for UDP queries on {}", local_addr);

        tokio::spawn(async move {
            let mut buffer = vec![0; UDP_RECV_SIZE];
            loop {
                let (len, src) = match socket.recv_from(&mut buffer).await {
                    Ok(x) => x,
                    Err(e) => {
                        log::info!("Failed to read from UDP socket: {}", e);
                        continue;
                    }
                };

                let _ = self
                    .context
                    .statistics
                    .udp_query_count
                    .fetch_add(1, Ordering::Release);

                tokio::spawn(Self::process_request(
                    self.context.clone(),
                    socket.clone(),
                    src,
                    buffer[..len].to_vec(),
                ));
            }
        });

        Ok(local_addr)
    }
}

/// TCP DNS server
///
/// Every connection is served by its own task and may carry any number of
/// length prefixed queries, including zone transfer requests.
pub struct DnsTcpServer {
    context: Arc<ServerContext>,
}

impl DnsTcpServer {
    pub fn new(context: Arc<ServerContext>) -> DnsTcpServer {
        DnsTcpServer { context }
    }

    async fn handle_connection(
        context: Arc<ServerContext>,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let idle = Duration::from_millis(context.config.tcp_idle_timeout_ms);

        loop {
            let data = match tokio::time::timeout(idle, read_packet(&mut stream)).await {
                Ok(Ok(data)) => data,
                Ok(Err(ref e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    log::debug!("Closing idle TCP connection from {}", peer);
                    return Ok(());
                }
            };

            let _ = context
                .statistics
                .tcp_query_count
                .fetch_add(1, Ordering::Release);

            let request = match DnsPacket::from_bytes(&data) {
                Ok(x) => x,
                Err(e) => {
                    log::debug!("Failed to parse TCP query packet from {}: {}", peer, e);
                    continue;
                }
            };

            let is_transfer = request
                .questions
                .first()
                .map(|q| q.qtype.is_transfer())
                .unwrap_or(false);

            let packet = if is_transfer {
                match screen_request(&context, &request, peer) {
                    Ok(()) => {
                        let _ = context
                            .statistics
                            .transfer_count
                            .fetch_add(1, Ordering::Release);
                        if let Err(e) = context
                            .transfer
                            .respond(&context.authority, &request, peer.ip(), &mut stream)
                            .await
                        {
                            log::info!("Zone transfer to {} failed: {}", peer, e);
                            return Ok(());
                        }
                        continue;
                    }
                    Err(reply) => reply,
                }
            } else {
                execute_query(context.clone(), &request, peer, Protocol::Tcp).await
            };

            match packet {
                Some(packet) => {
                    let data = encode_response(packet, &request, Protocol::Tcp)?;
                    write_packet(&mut stream, &data).await?;
                }
                None => {
                    let _ = context.statistics.dropped_count.fetch_add(1, Ordering::Release);
                }
            }
        }
    }
}

impl DnsServer for DnsTcpServer {
    fn run_server(self) -> Result<SocketAddr> {
        let config = &self.context.config;
        let std_listener = std::net::TcpListener::bind((config.listen_addr, config.dns_port))?;
        std_listener.set_nonblocking(true)?;

        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        log::info!("Listening for TCP queries on {}", local_addr);

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(x) => x,
                    Err(e) => {
                        log::info!("Failed to accept TCP connection: {}", e);
                        continue;
                    }
                };

                let context = self.context.clone();
                tokio::spawn(async move {
                    if let Err(e) = Self::handle_connection(context, stream, peer).await {
                        log::info!("TCP connection from {} failed: {}", peer, e);
                    }
                });
            }
        });

        Ok(local_addr)
    }
}

/// Dedicated zone transfer listener
///
/// Peers outside the transfer ACL are disconnected right after accept.
pub struct DnsTransferServer {
    context: Arc<ServerContext>,
    port: u16,
}

impl DnsTransferServer {
    pub fn new(context: Arc<ServerContext>, port: u16) -> DnsTransferServer {
        DnsTransferServer { context, port }
    }
}

impl DnsServer for DnsTransferServer {
    fn run_server(self) -> Result<SocketAddr> {
        let std_listener =
            std::net::TcpListener::bind((self.context.config.listen_addr, self.port))?;
        std_listener.set_nonblocking(true)?;

        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        log::info!("Listening for zone transfers on {}", local_addr);

        tokio::spawn(async move {
            loop {
                let (mut stream, peer) = match listener.accept().await {
                    Ok(x) => x,
                    Err(e) => {
                        log::info!("Failed to accept transfer connection: {}", e);
                        continue;
                    }
                };

                let context = self.context.clone();
                tokio::spawn(async move {
                    let _ = context
                        .statistics
                        .transfer_count
                        .fetch_add(1, Ordering::Release);
                    if let Err(e) = context
                        .transfer
                        .serve_connection(&context.authority, &mut stream, peer)
                        .await
                    {
                        log::info!("Transfer connection from {} ended: {}", peer, e);
                    }
                });
            }
        });

        Ok(local_addr)
    }
}

/// Periodically discards idle security state and expired cache entries.
pub fn spawn_cleanup(context: Arc<ServerContext>) -> JoinHandle<()> {
    let period = Duration::from_secs(context.config.cleanup_interval_secs.max(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let security = context.security.cleanup();
            match context.cache.purge_expired() {
                Ok(purged) => log::debug!(
                    "Cleanup removed {} security entries and {} cache entries",
                    security,
                    purged
                ),
                Err(e) => log::warn!("Failed to purge cache: {}", e),
            }
        }
    })
}

/// Starts every listener enabled in the configuration together with the
/// cleanup task.
pub fn start_servers(context: Arc<ServerContext>) -> Result<Vec<SocketAddr>> {
    let mut addrs = Vec::new();

    if context.config.enable_udp {
        addrs.push(DnsUdpServer::new(context.clone()).run_server()?);
    }

    if context.config.enable_tcp {
        addrs.push(DnsTcpServer::new(context.clone()).run_server()?);
    }

    if let Some(port) = context.config.transfer_port {
        addrs.push(DnsTransferServer::new(context.clone(), port).run_server()?);
    }

    spawn_cleanup(context);

    Ok(addrs)
}

#[cfg(test)]
mod tests {

    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    use crate::dns::authority::Zone;
    use crate::dns::context::tests::{create_test_context, create_test_context_with};
    use crate::dns::context::ServerConfig;
    use crate::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode, TransientTtl};
    use crate::dns::security::{RateLimitConfig, RrlConfig, SecurityConfig, ValidatorConfig};
    use crate::dns::zone_transfer::TransferClient;

    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn build_query(qname: &str, qtype: QueryType) -> DnsPacket {
        let mut query_packet = DnsPacket::new();
        query_packet.header.id = 1234;
        query_packet.header.recursion_desired = true;

        query_packet
            .questions
            .push(DnsQuestion::new(qname.into(), qtype));

        query_packet
    }

    fn a_record(domain: &str, addr: &str) -> DnsRecord {
        DnsRecord::A {
            domain: domain.to_string(),
            addr: addr.parse::<Ipv4Addr>().unwrap(),
            ttl: TransientTtl(3600),
        }
    }

    fn example_zone() -> Zone {
        let mut zone = Zone::new(
            "example.local".to_string(),
            "ns1.example.local".to_string(),
            "hostmaster.example.local".to_string(),
        );
        zone.serial = 2024010101;
        zone.minimum = 300;
        zone.add_record(&a_record("www.example.local", "192.168.1.10"));
        zone.add_record(&a_record("mail.example.local", "192.168.1.20"));
        zone
    }

    fn upstream_context() -> Arc<ServerContext> {
        create_test_context(Box::new(|qname, qtype, _, _| {
            let mut packet = DnsPacket::new();

            if qname == "google.com" {
                packet.answers.push(a_record("google.com", "127.0.0.1"));
            } else if qname == "www.microsoft.com" && qtype == QueryType::A {
                packet.answers.push(DnsRecord::Cname {
                    domain: "www.microsoft.com".to_string(),
                    host: "cdn.microsoft.com".to_string(),
                    ttl: TransientTtl(3600),
                });
            } else if qname == "cdn.microsoft.com" && qtype == QueryType::A {
                packet.answers.push(a_record("cdn.microsoft.com", "127.0.0.2"));
            } else {
                packet.header.rescode = ResultCode::NXDOMAIN;
            }

            Ok(packet)
        }))
    }

    #[tokio::test]
    async fn test_execute_query() {
        let context = upstream_context();

        // A successful resolve
        {
            let query = build_query("google.com", QueryType::A);
            let res = execute_query(context.clone(), &query, peer(), Protocol::Udp)
                .await
                .unwrap();
            assert_eq!(1234, res.header.id);
            assert!(res.header.response);
            assert_eq!(1, res.answers.len());
            assert_eq!(query.questions, res.questions);

            match res.answers[0] {
                DnsRecord::A { ref domain, .. } => {
                    assert_eq!("google.com", domain);
                }
                _ => panic!(),
            }
        };

        // The alias is chased through a second upstream query
        {
            let res = execute_query(
                context.clone(),
                &build_query("www.microsoft.com", QueryType::A),
                peer(),
                Protocol::Udp,
            )
            .await
            .unwrap();
            assert_eq!(2, res.answers.len());
            assert_eq!(QueryType::Cname, res.answers[0].get_querytype());

            match res.answers[1] {
                DnsRecord::A { ref domain, .. } => {
                    assert_eq!("cdn.microsoft.com", domain);
                }
                _ => panic!(),
            }
        };

        // An unsuccessful resolve, but without any error
        {
            let res = execute_query(
                context.clone(),
                &build_query("yahoo.com", QueryType::A),
                peer(),
                Protocol::Udp,
            )
            .await
            .unwrap();
            assert_eq!(ResultCode::NXDOMAIN, res.header.rescode);
            assert_eq!(0, res.answers.len());
        };

        // Send a query without a question, which should fail with an error code
        {
            let query_packet = DnsPacket::new();
            let res = execute_query(context.clone(), &query_packet, peer(), Protocol::Udp)
                .await
                .unwrap();
            assert_eq!(ResultCode::FORMERR, res.header.rescode);
            assert_eq!(0, res.answers.len());
        };

        // Only standard queries are implemented
        {
            let mut query = build_query("google.com", QueryType::A);
            query.header.opcode = 5;
            let res = execute_query(context.clone(), &query, peer(), Protocol::Udp)
                .await
                .unwrap();
            assert_eq!(ResultCode::NOTIMP, res.header.rescode);
        };

        // Transfers are never served over datagrams
        {
            let res = execute_query(
                context,
                &build_query("example.local", QueryType::Axfr),
                peer(),
                Protocol::Udp,
            )
            .await
            .unwrap();
            assert_eq!(ResultCode::NOTIMP, res.header.rescode);
        };
    }

    #[tokio::test]
    async fn test_upstream_failure_is_servfail() {
        let context = create_test_context(Box::new(|_, _, _, _| {
            Err(crate::dns::client::ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Fail",
            )))
        }));

        let res = execute_query(
            context,
            &build_query("yahoo.com", QueryType::A),
            peer(),
            Protocol::Udp,
        )
        .await
        .unwrap();
        assert_eq!(ResultCode::SERVFAIL, res.header.rescode);
        assert_eq!(0, res.answers.len());
    }

    #[tokio::test]
    async fn test_authoritative_answer_is_case_insensitive() {
        let context = upstream_context();
        context.authority.add_zone(example_zone()).unwrap();

        let res = execute_query(
            context,
            &build_query("WWW.EXAMPLE.LOCAL", QueryType::A),
            peer(),
            Protocol::Tcp,
        )
        .await
        .unwrap();

        assert_eq!(ResultCode::NOERROR, res.header.rescode);
        assert!(res.header.authoritative_answer);
        assert_eq!(vec![a_record("www.example.local", "192.168.1.10")], res.answers);
    }

    #[tokio::test]
    async fn test_policy_rejections_are_silent() {
        let config = ServerConfig {
            upstreams: vec!["127.0.0.1:53".parse().unwrap()],
            security: SecurityConfig {
                rate_limiting: RateLimitConfig {
                    queries_per_second: 2,
                    burst_allowance: 0,
                    ..RateLimitConfig::default()
                },
                validation: ValidatorConfig {
                    blocklist: vec!["*.blocked.test".to_string()],
                    ..ValidatorConfig::default()
                },
                ..SecurityConfig::default()
            },
            ..ServerConfig::default()
        };
        let context = create_test_context_with(
            config,
            Box::new(|_, _, _, _| Ok(DnsPacket::new())),
        );

        assert!(execute_query(
            context.clone(),
            &build_query("ads.blocked.test", QueryType::A),
            peer(),
            Protocol::Udp
        )
        .await
        .is_none());

        // The blocklisted query above counts against the client as well
        assert!(execute_query(
            context.clone(),
            &build_query("fine.test", QueryType::A),
            peer(),
            Protocol::Udp
        )
        .await
        .is_some());
        assert!(execute_query(
            context.clone(),
            &build_query("fine.test", QueryType::A),
            peer(),
            Protocol::Udp
        )
        .await
        .is_none());
        assert!(context.security.rate_limiter().is_blocked(peer().ip()));

        // A long name is a format error rather than a silent drop
        let other: SocketAddr = "127.0.0.2:40000".parse().unwrap();
        let long_name = vec!["a".repeat(60); 5].join(".");
        let res = execute_query(
            context,
            &build_query(&long_name, QueryType::A),
            other,
            Protocol::Udp,
        )
        .await
        .unwrap();
        assert_eq!(ResultCode::FORMERR, res.header.rescode);
    }

    #[tokio::test]
    async fn test_response_rate_limiting_slips() {
        let config = ServerConfig {
            security: SecurityConfig {
                rrl: RrlConfig {
                    responses_per_second: 1,
                    slip: 2,
                    ..RrlConfig::default()
                },
                ..SecurityConfig::default()
            },
            ..ServerConfig::default()
        };
        let context = create_test_context_with(config, Box::new(|_, _, _, _| Ok(DnsPacket::new())));
        context.authority.add_zone(example_zone()).unwrap();

        let query = build_query("www.example.local", QueryType::A);

        let first = execute_query(context.clone(), &query, peer(), Protocol::Udp)
            .await
            .unwrap();
        assert_eq!(1, first.answers.len());
        assert!(!first.header.truncated_message);

        // Second identical response is dropped, the third slips through
        // truncated
        assert!(execute_query(context.clone(), &query, peer(), Protocol::Udp)
            .await
            .is_none());
        let slipped = execute_query(context.clone(), &query, peer(), Protocol::Udp)
            .await
            .unwrap();
        assert!(slipped.header.truncated_message);
        assert!(slipped.answers.is_empty());

        // Streams are not subject to RRL
        let res = execute_query(context, &query, peer(), Protocol::Tcp)
            .await
            .unwrap();
        assert_eq!(1, res.answers.len());
    }

    #[test]
    fn test_udp_responses_are_truncated() {
        let mut packet = DnsPacket::new();
        packet.header.response = true;
        packet
            .questions
            .push(DnsQuestion::new("big.example.local".to_string(), QueryType::Txt));
        for i in 0..20 {
            packet.answers.push(DnsRecord::Txt {
                domain: "big.example.local".to_string(),
                data: format!("{:060}", i),
                ttl: TransientTtl(60),
            });
        }

        let request = build_query("big.example.local", QueryType::Txt);
        let data = encode_response(packet.clone(), &request, Protocol::Udp).unwrap();
        assert!(data.len() <= UDP_PAYLOAD_SIZE);
        let decoded = DnsPacket::from_bytes(&data).unwrap();
        assert!(decoded.header.truncated_message);
        assert!(decoded.answers.len() < 20);

        let data = encode_response(packet, &request, Protocol::Tcp).unwrap();
        let decoded = DnsPacket::from_bytes(&data).unwrap();
        assert!(!decoded.header.truncated_message);
        assert_eq!(20, decoded.answers.len());
    }

    fn listener_context() -> Arc<ServerContext> {
        let config = ServerConfig {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dns_port: 0,
            allow_recursive: false,
            ..ServerConfig::default()
        };
        let context = create_test_context_with(config, Box::new(|_, _, _, _| Ok(DnsPacket::new())));
        context.authority.add_zone(example_zone()).unwrap();
        context
    }

    #[tokio::test]
    async fn test_udp_server() {
        let context = listener_context();
        let addr = DnsUdpServer::new(context.clone()).run_server().unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = build_query("www.example.local", QueryType::A);
        socket
            .send_to(&query.to_bytes().unwrap(), addr)
            .await
            .unwrap();

        let mut buffer = vec![0; 512];
        let (len, _) = socket.recv_from(&mut buffer).await.unwrap();
        let res = DnsPacket::from_bytes(&buffer[..len]).unwrap();

        assert_eq!(1234, res.header.id);
        assert_eq!(vec![a_record("www.example.local", "192.168.1.10")], res.answers);
        assert_eq!(1, context.statistics.get_udp_query_count());
    }

    #[tokio::test]
    async fn test_tcp_server_queries_and_transfers() {
        let context = listener_context();
        let addr = DnsTcpServer::new(context.clone()).run_server().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();

        // Two queries on one connection
        for name in &["www.example.local", "missing.example.local"] {
            let query = build_query(name, QueryType::A);
            write_packet(&mut stream, &query.to_bytes().unwrap())
                .await
                .unwrap();
            let res = DnsPacket::from_bytes(&read_packet(&mut stream).await.unwrap()).unwrap();
            assert_eq!(1234, res.header.id);
        }

        // Then a full transfer over the same connection
        let zone = TransferClient::default()
            .axfr(&mut stream, "example.local")
            .await
            .unwrap();
        assert_eq!(example_zone(), zone);
        assert_eq!(1, context.statistics.get_transfer_count());
    }

    #[tokio::test]
    async fn test_idle_tcp_connections_are_closed() {
        let config = ServerConfig {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dns_port: 0,
            tcp_idle_timeout_ms: 100,
            ..ServerConfig::default()
        };
        let context = create_test_context_with(config, Box::new(|_, _, _, _| Ok(DnsPacket::new())));
        context.authority.add_zone(example_zone()).unwrap();

        let addr = DnsTcpServer::new(context).run_server().unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let query = build_query("www.example.local", QueryType::A);
        write_packet(&mut stream, &query.to_bytes().unwrap())
            .await
            .unwrap();
        assert!(read_packet(&mut stream).await.is_ok());

        // Silence after the answer gets the connection closed
        let closed = tokio::time::timeout(Duration::from_secs(5), read_packet(&mut stream))
            .await
            .unwrap();
        assert_eq!(ErrorKind::UnexpectedEof, closed.unwrap_err().kind());
    }

    #[tokio::test]
    async fn test_tcp_transfer_refused_outside_acl() {
        let mut config = ServerConfig {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dns_port: 0,
            ..ServerConfig::default()
        };
        config.transfer.allowed_networks = vec!["10.0.0.0/8".parse().unwrap()];
        let context = create_test_context_with(config, Box::new(|_, _, _, _| Ok(DnsPacket::new())));
        context.authority.add_zone(example_zone()).unwrap();

        let addr = DnsTcpServer::new(context).run_server().unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let query = build_query("example.local", QueryType::Axfr);
        write_packet(&mut stream, &query.to_bytes().unwrap())
            .await
            .unwrap();
        let res = DnsPacket::from_bytes(&read_packet(&mut stream).await.unwrap()).unwrap();

        assert_eq!(ResultCode::REFUSED, res.header.rescode);
        assert!(res.answers.is_empty());
    }

    #[tokio::test]
    async fn test_transfer_server_drops_unknown_peers() {
        let mut config = ServerConfig {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        };
        config.transfer.allowed_networks = vec!["10.0.0.0/8".parse().unwrap()];
        let context = create_test_context_with(config, Box::new(|_, _, _, _| Ok(DnsPacket::new())));

        let addr = DnsTransferServer::new(context, 0).run_server().unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();

        // The server hangs up without reading anything
        assert!(read_packet(&mut stream).await.is_err());
    }
}
