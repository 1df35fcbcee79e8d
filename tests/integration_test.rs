//! Integration tests for the Warden DNS server
//!
//! These tests verify the interaction between the listeners, the resolver,
//! the security gates and zone transfers through the public API.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;

use warden::dns::authority::Zone;
use warden::dns::cache::SynchronizedCache;
use warden::dns::context::{ServerConfig, ServerContext};
use warden::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode, TransientTtl};
use warden::dns::server::{execute_query, start_servers, Protocol};
use warden::dns::zone_transfer::{TransferClient, TransferResult};

fn example_zone(serial: u32) -> Zone {
    let mut zone = Zone::new(
        "example.local".to_string(),
        "ns1.example.local".to_string(),
        "hostmaster.example.local".to_string(),
    );
    zone.serial = serial;
    zone.refresh = 3600;
    zone.retry = 600;
    zone.expire = 604800;
    zone.minimum = 300;

    zone.add_record(&DnsRecord::A {
        domain: "www.example.local".to_string(),
        addr: Ipv4Addr::new(192, 168, 1, 10),
        ttl: TransientTtl(3600),
    });
    zone.add_record(&DnsRecord::Ns {
        domain: "example.local".to_string(),
        host: "ns1.example.local".to_string(),
        ttl: TransientTtl(86400),
    });
    zone.add_record(&DnsRecord::Cname {
        domain: "web.example.local".to_string(),
        host: "www.example.local".to_string(),
        ttl: TransientTtl(3600),
    });

    zone
}

fn local_config() -> ServerConfig {
    ServerConfig {
        listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        dns_port: 0,
        ..ServerConfig::default()
    }
}

fn query(name: &str, qtype: QueryType) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = 7;
    packet.header.recursion_desired = true;
    packet
        .questions
        .push(DnsQuestion::new(name.to_string(), qtype));
    packet
}

fn client() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

/// Test the authoritative answer for a mixed case name
#[tokio::test]
async fn test_authoritative_lookup() {
    let context = Arc::new(ServerContext::new(local_config()));
    context.authority.add_zone(example_zone(1)).unwrap();

    let res = execute_query(
        context.clone(),
        &query("WWW.EXAMPLE.LOCAL", QueryType::A),
        client(),
        Protocol::Udp,
    )
    .await
    .unwrap();

    assert_eq!(ResultCode::NOERROR, res.header.rescode);
    assert_eq!(1, res.answers.len());
    match res.answers[0] {
        DnsRecord::A { addr, .. } => assert_eq!(Ipv4Addr::new(192, 168, 1, 10), addr),
        _ => panic!("Expected A record"),
    }

    // In-zone aliases are followed
    let res = execute_query(
        context.clone(),
        &query("web.example.local", QueryType::A),
        client(),
        Protocol::Udp,
    )
    .await
    .unwrap();
    assert_eq!(2, res.answers.len());

    // Without upstreams a name outside every zone does not exist
    let res = execute_query(
        context,
        &query("unknown.test", QueryType::A),
        client(),
        Protocol::Udp,
    )
    .await
    .unwrap();
    assert_eq!(ResultCode::NXDOMAIN, res.header.rescode);
}

/// Test cache integration with DNS records
#[test]
fn test_cache_integration() {
    let cache = SynchronizedCache::new(100);

    let records = vec![
        DnsRecord::A {
            domain: "test.example.com".to_string(),
            addr: Ipv4Addr::new(192, 168, 1, 1),
            ttl: TransientTtl(3600),
        },
        DnsRecord::Ns {
            domain: "example.com".to_string(),
            host: "ns1.example.com".to_string(),
            ttl: TransientTtl(86400),
        },
    ];

    assert!(cache.store(&records).is_ok());

    let packet = cache.lookup("test.example.com", QueryType::A).unwrap();
    assert_eq!(1, packet.answers.len());

    if let DnsRecord::A { domain, addr, ttl } = &packet.answers[0] {
        assert_eq!(domain, "test.example.com");
        assert_eq!(addr, &Ipv4Addr::new(192, 168, 1, 1));
        assert!(ttl.0 <= 3600);
    } else {
        panic!("Expected A record");
    }

    assert!(cache.lookup("test.example.com", QueryType::Aaaa).is_none());
}

/// Queries sent over a real socket
#[tokio::test]
async fn test_udp_listener_end_to_end() {
    let context = Arc::new(ServerContext::new(ServerConfig {
        enable_tcp: false,
        ..local_config()
    }));
    context.authority.add_zone(example_zone(1)).unwrap();

    let addrs = start_servers(context.clone()).unwrap();
    assert_eq!(1, addrs.len());

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&query("www.example.local", QueryType::A).to_bytes().unwrap(), addrs[0])
        .await
        .unwrap();

    let mut buffer = vec![0; 512];
    let (len, _) = socket.recv_from(&mut buffer).await.unwrap();
    let res = DnsPacket::from_bytes(&buffer[..len]).unwrap();

    assert_eq!(7, res.header.id);
    assert!(res.header.authoritative_answer);
    assert_eq!(ResultCode::NOERROR, res.header.rescode);
    assert_eq!(1, res.answers.len());

    // Garbage is dropped without a reply and without taking the server down
    socket.send_to(&[1, 2, 3], addrs[0]).await.unwrap();
    socket
        .send_to(&query("missing.example.local", QueryType::A).to_bytes().unwrap(), addrs[0])
        .await
        .unwrap();
    let (len, _) = socket.recv_from(&mut buffer).await.unwrap();
    let res = DnsPacket::from_bytes(&buffer[..len]).unwrap();
    assert_eq!(ResultCode::NXDOMAIN, res.header.rescode);
}

/// A secondary pulling a zone from a primary's dedicated transfer port
#[tokio::test]
async fn test_secondary_follows_primary() {
    let primary = Arc::new(ServerContext::new(ServerConfig {
        enable_udp: false,
        enable_tcp: false,
        transfer_port: Some(0),
        ..local_config()
    }));
    primary.authority.add_zone(example_zone(1)).unwrap();

    let addrs = start_servers(primary.clone()).unwrap();
    let transfer_addr = addrs[0];

    let secondary = ServerContext::new(local_config());
    let client = TransferClient::default();

    // First contact is a full transfer
    let result = client
        .refresh(transfer_addr, "example.local", &secondary.authority, &secondary.transfer)
        .await
        .unwrap();
    assert!(matches!(result, TransferResult::Full(_)));
    assert_eq!(
        *primary.authority.get_zone("example.local").unwrap(),
        *secondary.authority.get_zone("example.local").unwrap()
    );

    // The primary changes and the secondary catches up incrementally
    let mut next = example_zone(2);
    next.add_record(&DnsRecord::A {
        domain: "mail.example.local".to_string(),
        addr: Ipv4Addr::new(192, 168, 1, 20),
        ttl: TransientTtl(3600),
    });
    primary
        .transfer
        .replace_zone(&primary.authority, next)
        .unwrap();

    let result = client
        .refresh(transfer_addr, "example.local", &secondary.authority, &secondary.transfer)
        .await
        .unwrap();
    match result {
        TransferResult::Incremental(ref changes) => {
            assert_eq!(1, changes.len());
            assert_eq!(1, changes[0].added.len());
            assert!(changes[0].deleted.is_empty());
        }
        ref other => panic!("Expected incremental transfer, got {:?}", other),
    }

    let zone = secondary.authority.get_zone("example.local").unwrap();
    assert_eq!(2, zone.serial);
    assert_eq!(*primary.authority.get_zone("example.local").unwrap(), *zone);

    // Nothing left to fetch
    let result = client
        .refresh(transfer_addr, "example.local", &secondary.authority, &secondary.transfer)
        .await
        .unwrap();
    assert_eq!(TransferResult::UpToDate(2), result);
}
