//! Zone Transfer Implementation (AXFR/IXFR)
//!
//! Serves full and incremental zone transfers over length prefixed stream
//! connections, and pulls them from other servers.
//!
//! * **AXFR** - the SOA on its own, every other record in batches, then the
//!   SOA again
//! * **IXFR** - the change sets recorded since the requester's serial,
//!   falling back to AXFR when the journal does not reach back that far
//! * **Transfer ACLs** - source network based access control
//!
//! Every zone has a bounded journal of change sets, filled whenever a zone is
//! changed through `apply_change` or replaced through `replace_zone`. Once
//! the journal is full the oldest change set is discarded.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use derive_more::{Display, Error, From};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::dns::authority::{Authority, Zone};
use crate::dns::metrics::ZONE_TRANSFERS;
use crate::dns::netutil::{read_packet, write_packet};
use crate::dns::protocol::{normalize_name, DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode};

/// Largest message a two byte length prefix can frame
const MAX_MESSAGE_SIZE: usize = 0xFFFF;

#[derive(Debug, Display, From, Error)]
pub enum TransferError {
    Authority(crate::dns::authority::AuthorityError),
    Protocol(crate::dns::protocol::ProtocolError),
    Io(std::io::Error),
    NoSuchZone,
    NotAuthorized,
    Unsupported,
    Malformed,
    OutOfSync,
    Rejected,
    TimeOut,
}

type Result<T> = std::result::Result<T, TransferError>;

/// Zone transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneTransferConfig {
    /// Allow AXFR transfers
    pub allow_axfr: bool,
    /// Allow IXFR transfers
    pub allow_ixfr: bool,
    /// Networks allowed to request transfers
    pub allowed_networks: Vec<IpNetwork>,
    /// Records per transfer message
    pub max_records_per_message: usize,
    /// Change sets kept per zone for IXFR
    pub journal_size: usize,
    /// Upper bound for a whole inbound transfer
    pub transfer_timeout_secs: u64,
}

impl Default for ZoneTransferConfig {
    fn default() -> Self {
        ZoneTransferConfig {
            allow_axfr: true,
            allow_ixfr: true,
            allowed_networks: vec![
                IpNetwork::V4(Ipv4Network::from(Ipv4Addr::LOCALHOST)),
                IpNetwork::V6(Ipv6Network::from(Ipv6Addr::LOCALHOST)),
            ],
            max_records_per_message: 50,
            journal_size: 32,
            transfer_timeout_secs: 120,
        }
    }
}

/// Zone transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// Full zone transfer
    Axfr,
    /// Incremental zone transfer from the given serial
    Ixfr(u32),
}

/// One step in a zone's history
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneChange {
    /// SOA before the change
    pub old_soa: DnsRecord,
    /// SOA after the change
    pub new_soa: DnsRecord,
    pub deleted: Vec<DnsRecord>,
    pub added: Vec<DnsRecord>,
}

impl ZoneChange {
    pub fn old_serial(&self) -> u32 {
        self.old_soa.get_serial().unwrap_or(0)
    }

    pub fn new_serial(&self) -> u32 {
        self.new_soa.get_serial().unwrap_or(0)
    }
}

/// Outcome of pulling a zone from another server
#[derive(Debug, Clone, PartialEq)]
pub enum TransferResult {
    Full(Zone),
    Incremental(Vec<ZoneChange>),
    UpToDate(u32),
}

/// Transfer statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferStats {
    pub axfr_count: u64,
    pub ixfr_count: u64,
    pub up_to_date_count: u64,
    pub failed_transfers: u64,
    pub total_records: u64,
    pub total_messages: u64,
}

/// True if serial `a` precedes serial `b` in RFC 1982 sequence space.
pub fn serial_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000_0000
}

/// The records added and removed between two versions of a zone. Record
/// equality ignores TTLs, so they are compared separately: a TTL change
/// shows up as a deletion plus an addition.
pub fn calculate_changes(old: &Zone, new: &Zone) -> ZoneChange {
    let old_records: HashSet<(&DnsRecord, u32)> =
        old.records().map(|rec| (rec, rec.get_ttl())).collect();
    let new_records: HashSet<(&DnsRecord, u32)> =
        new.records().map(|rec| (rec, rec.get_ttl())).collect();

    ZoneChange {
        old_soa: old.soa_record(),
        new_soa: new.soa_record(),
        deleted: old
            .records()
            .filter(|rec| !new_records.contains(&(*rec, rec.get_ttl())))
            .cloned()
            .collect(),
        added: new
            .records()
            .filter(|rec| !old_records.contains(&(*rec, rec.get_ttl())))
            .cloned()
            .collect(),
    }
}

/// Zone transfer handler
pub struct ZoneTransferHandler {
    config: ZoneTransferConfig,
    journals: RwLock<HashMap<String, VecDeque<ZoneChange>>>,
    stats: RwLock<TransferStats>,
}

impl ZoneTransferHandler {
    pub fn new(config: ZoneTransferConfig) -> Self {
        ZoneTransferHandler {
            config,
            journals: RwLock::new(HashMap::new()),
            stats: RwLock::new(TransferStats::default()),
        }
    }

    pub fn check_acl(&self, client_ip: IpAddr) -> bool {
        self.config
            .allowed_networks
            .iter()
            .any(|network| network.contains(client_ip))
    }

    pub fn get_stats(&self) -> TransferStats {
        self.stats.read().clone()
    }

    /// The journal of `zone`, oldest change first.
    pub fn journal(&self, zone: &str) -> Vec<ZoneChange> {
        self.journals
            .read()
            .get(&normalize_name(zone))
            .map(|changes| changes.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record_change(&self, zone: &str, change: ZoneChange) {
        if self.config.journal_size == 0 {
            return;
        }

        let mut journals = self.journals.write();
        let journal = journals
            .entry(normalize_name(zone))
            .or_insert_with(VecDeque::new);

        journal.push_back(change);
        while journal.len() > self.config.journal_size {
            journal.pop_front();
        }
    }

    /// Applies a change set to a loaded zone and journals it. The zone must
    /// currently be at the change's old serial.
    pub fn apply_change(&self, authority: &Authority, zone: &str, change: ZoneChange) -> Result<()> {
        let applied = change.clone();

        authority.update_zone(zone, move |zone| {
            if zone.serial != change.old_serial() {
                log::warn!(
                    "Change {} -> {} does not apply to {} at serial {}",
                    change.old_serial(),
                    change.new_serial(),
                    zone.domain,
                    zone.serial
                );
                return Err(TransferError::OutOfSync);
            }

            for rec in &change.deleted {
                zone.delete_record(rec);
            }
            for rec in &change.added {
                zone.add_record(rec);
            }
            zone.add_record(&change.new_soa);

            Ok(())
        })??;

        log::info!(
            "Applied change to {}: serial {} -> {} (-{} +{})",
            zone,
            applied.old_serial(),
            applied.new_serial(),
            applied.deleted.len(),
            applied.added.len()
        );
        self.record_change(zone, applied);

        Ok(())
    }

    /// Installs a new version of a zone. Moving to a newer serial journals
    /// the difference; anything else invalidates the journal.
    pub fn replace_zone(&self, authority: &Authority, zone: Zone) -> Result<()> {
        let domain = zone.domain.clone();

        match authority.get_zone(&domain) {
            Some(ref current) if serial_lt(current.serial, zone.serial) => {
                self.record_change(&domain, calculate_changes(current, &zone));
            }
            Some(ref current) => {
                log::info!(
                    "Zone {} replaced at serial {} (was {}), dropping journal",
                    domain,
                    zone.serial,
                    current.serial
                );
                self.journals.write().remove(&domain);
            }
            None => {}
        }

        authority.add_zone(zone)?;

        Ok(())
    }

    /// Applies the outcome of an inbound transfer to the local zones.
    pub fn apply_result(&self, authority: &Authority, zone: &str, result: TransferResult) -> Result<()> {
        match result {
            TransferResult::Full(zone) => self.replace_zone(authority, zone),
            TransferResult::Incremental(changes) => {
                for change in changes {
                    self.apply_change(authority, zone, change)?;
                }
                Ok(())
            }
            TransferResult::UpToDate(_) => Ok(()),
        }
    }

    fn transfer_type(&self, request: &DnsPacket) -> Result<(String, TransferType)> {
        let question = request.questions.first().ok_or(TransferError::Malformed)?;

        match question.qtype {
            QueryType::Axfr if self.config.allow_axfr => Ok((question.name.clone(), TransferType::Axfr)),
            QueryType::Ixfr if self.config.allow_ixfr => {
                let serial = request
                    .authorities
                    .iter()
                    .find_map(|rec| match *rec {
                        DnsRecord::Soa { serial, .. } => Some(serial),
                        _ => None,
                    })
                    .ok_or(TransferError::Malformed)?;
                Ok((question.name.clone(), TransferType::Ixfr(serial)))
            }
            _ => Err(TransferError::Unsupported),
        }
    }

    /// Builds every message answering a transfer request from `client_ip`.
    pub fn handle_request(
        &self,
        authority: &Authority,
        request: &DnsPacket,
        client_ip: IpAddr,
    ) -> Result<Vec<DnsPacket>> {
        if !self.check_acl(client_ip) {
            return Err(TransferError::NotAuthorized);
        }

        let (qname, transfer_type) = self.transfer_type(request)?;
        let zone = authority
            .get_zone(&qname)
            .ok_or(TransferError::NoSuchZone)?;

        let records = match transfer_type {
            TransferType::Axfr => {
                return self.axfr_messages(request, &zone);
            }
            TransferType::Ixfr(serial) => {
                if serial == zone.serial || serial_lt(zone.serial, serial) {
                    self.stats.write().up_to_date_count += 1;
                    vec![zone.soa_record()]
                } else {
                    match self.changes_since(&zone, serial) {
                        Some(changes) => ixfr_records(&zone, &changes),
                        None => {
                            log::info!(
                                "No journal for {} from serial {}, sending AXFR",
                                zone.domain,
                                serial
                            );
                            return self.axfr_messages(request, &zone);
                        }
                    }
                }
            }
        };

        let mut stats = self.stats.write();
        stats.ixfr_count += 1;
        stats.total_records += records.len() as u64;

        self.batch(request, &records)
    }

    fn axfr_messages(&self, request: &DnsPacket, zone: &Zone) -> Result<Vec<DnsPacket>> {
        let soa = zone.soa_record();
        let records: Vec<DnsRecord> = zone.records().cloned().collect();

        let mut stats = self.stats.write();
        stats.axfr_count += 1;
        stats.total_records += records.len() as u64 + 2;

        let mut messages = vec![transfer_message(request, vec![soa.clone()])];
        messages.extend(self.batch(request, &records)?);
        messages.push(transfer_message(request, vec![soa]));

        Ok(messages)
    }

    /// Splits `records` into messages holding at most
    /// `max_records_per_message` records each and small enough for a
    /// stream frame once packed.
    fn batch(&self, request: &DnsPacket, records: &[DnsRecord]) -> Result<Vec<DnsPacket>> {
        let size = self.config.max_records_per_message.max(1);

        let mut messages = Vec::new();
        let mut rest = records;
        while !rest.is_empty() {
            let mut message = transfer_message(request, rest[..size.min(rest.len())].to_vec());

            // A record too large for any frame still goes out on its own
            // and fails when written.
            let fits = message.records_within(MAX_MESSAGE_SIZE)?.max(1);
            message.answers.truncate(fits);

            rest = &rest[fits..];
            messages.push(message);
        }

        Ok(messages)
    }

    /// The contiguous run of journaled changes leading from `serial` to the
    /// zone's current serial.
    fn changes_since(&self, zone: &Zone, serial: u32) -> Option<Vec<ZoneChange>> {
        let journals = self.journals.read();
        let journal = journals.get(&zone.domain)?;

        let start = journal.iter().position(|c| c.old_serial() == serial)?;
        let changes: Vec<ZoneChange> = journal.iter().skip(start).cloned().collect();

        let contiguous = changes
            .windows(2)
            .all(|w| w[0].new_serial() == w[1].old_serial());
        let current = changes.last().map(|c| c.new_serial()) == Some(zone.serial);

        if contiguous && current {
            Some(changes)
        } else {
            None
        }
    }

    /// Writes the answer to a transfer request to `stream`. Failures are
    /// answered with a single message carrying the matching rcode.
    pub async fn respond<S>(
        &self,
        authority: &Authority,
        request: &DnsPacket,
        client_ip: IpAddr,
        stream: &mut S,
    ) -> Result<usize>
    where
        S: AsyncWrite + Unpin,
    {
        let messages = match self.handle_request(authority, request, client_ip) {
            Ok(messages) => messages,
            Err(err) => {
                log::info!("Transfer request from {} failed: {}", client_ip, err);
                self.stats.write().failed_transfers += 1;
                ZONE_TRANSFERS
                    .with_label_values(&[transfer_label(request), "failed"])
                    .inc();
                vec![error_response(request, &err)]
            }
        };

        for message in &messages {
            write_packet(stream, &message.to_bytes()?).await?;
        }

        ZONE_TRANSFERS
            .with_label_values(&[transfer_label(request), "messages"])
            .inc_by(messages.len() as u64);
        self.stats.write().total_messages += messages.len() as u64;

        Ok(messages.len())
    }

    /// Serves a dedicated transfer connection until the peer closes it.
    pub async fn serve_connection<S>(
        &self,
        authority: &Authority,
        stream: &mut S,
        peer: SocketAddr,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.check_acl(peer.ip()) {
            log::warn!("Rejecting transfer connection from {}", peer);
            return Err(TransferError::NotAuthorized);
        }

        let idle = Duration::from_secs(self.config.transfer_timeout_secs);

        loop {
            let data = match tokio::time::timeout(idle, read_packet(stream)).await {
                Ok(Ok(data)) => data,
                Ok(Err(ref err)) if err.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    log::debug!("Closing idle transfer connection from {}", peer);
                    return Ok(());
                }
            };

            let request = match DnsPacket::from_bytes(&data) {
                Ok(request) => request,
                Err(err) => {
                    log::info!("Dropping malformed transfer request from {}: {}", peer, err);
                    continue;
                }
            };

            self.respond(authority, &request, peer.ip(), stream).await?;
        }
    }
}

fn transfer_label(request: &DnsPacket) -> &'static str {
    match request.questions.first().map(|q| q.qtype) {
        Some(QueryType::Axfr) => "axfr",
        Some(QueryType::Ixfr) => "ixfr",
        _ => "other",
    }
}

fn ixfr_records(zone: &Zone, changes: &[ZoneChange]) -> Vec<DnsRecord> {
    let current = zone.soa_record();

    let mut records = vec![current.clone()];
    for change in changes {
        records.push(change.old_soa.clone());
        records.extend(change.deleted.iter().cloned());
        records.push(change.new_soa.clone());
        records.extend(change.added.iter().cloned());
    }
    records.push(current);

    records
}

fn transfer_message(request: &DnsPacket, answers: Vec<DnsRecord>) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = request.header.id;
    packet.header.response = true;
    packet.header.authoritative_answer = true;
    packet.questions = request.questions.clone();
    packet.answers = answers;
    packet
}

/// The single message sent back when a transfer cannot be served.
pub fn error_response(request: &DnsPacket, err: &TransferError) -> DnsPacket {
    let mut packet = transfer_message(request, Vec::new());
    packet.header.authoritative_answer = false;
    packet.header.rescode = match *err {
        TransferError::NoSuchZone
        | TransferError::Authority(crate::dns::authority::AuthorityError::NoSuchZone) => {
            ResultCode::NXDOMAIN
        }
        TransferError::Unsupported => ResultCode::NOTIMP,
        TransferError::NotAuthorized => ResultCode::REFUSED,
        TransferError::Malformed => ResultCode::FORMERR,
        _ => ResultCode::SERVFAIL,
    };
    packet
}

enum Phase {
    Start,
    AfterFirst,
    Full,
    Deleting,
    Adding,
    Done,
}

/// Accumulates the records of an inbound transfer, one at a time.
struct TransferReader {
    phase: Phase,
    first_soa: Option<DnsRecord>,
    records: Vec<DnsRecord>,
    changes: Vec<ZoneChange>,
}

impl TransferReader {
    fn new() -> TransferReader {
        TransferReader {
            phase: Phase::Start,
            first_soa: None,
            records: Vec::new(),
            changes: Vec::new(),
        }
    }

    fn first_serial(&self) -> u32 {
        self.first_soa
            .as_ref()
            .and_then(|soa| soa.get_serial())
            .unwrap_or(0)
    }

    fn push(&mut self, rec: DnsRecord) -> Result<()> {
        let is_soa = rec.get_querytype() == QueryType::Soa;

        match self.phase {
            Phase::Start => {
                if !is_soa {
                    return Err(TransferError::Malformed);
                }
                self.first_soa = Some(rec);
                self.phase = Phase::AfterFirst;
            }
            Phase::AfterFirst => {
                if is_soa && rec.get_serial() == Some(self.first_serial()) {
                    // An empty zone
                    self.phase = Phase::Done;
                } else if is_soa {
                    self.changes.push(ZoneChange {
                        old_soa: rec.clone(),
                        new_soa: rec,
                        deleted: Vec::new(),
                        added: Vec::new(),
                    });
                    self.phase = Phase::Deleting;
                } else {
                    self.records.push(rec);
                    self.phase = Phase::Full;
                }
            }
            Phase::Full => {
                if is_soa {
                    self.phase = Phase::Done;
                } else {
                    self.records.push(rec);
                }
            }
            Phase::Deleting => {
                let change = self.changes.last_mut().ok_or(TransferError::Malformed)?;
                if is_soa {
                    change.new_soa = rec;
                    self.phase = Phase::Adding;
                } else {
                    change.deleted.push(rec);
                }
            }
            Phase::Adding => {
                if is_soa && rec.get_serial() == Some(self.first_serial()) {
                    self.phase = Phase::Done;
                } else if is_soa {
                    self.changes.push(ZoneChange {
                        old_soa: rec.clone(),
                        new_soa: rec,
                        deleted: Vec::new(),
                        added: Vec::new(),
                    });
                    self.phase = Phase::Deleting;
                } else {
                    let change = self.changes.last_mut().ok_or(TransferError::Malformed)?;
                    change.added.push(rec);
                }
            }
            Phase::Done => {
                log::debug!("Ignoring record after end of transfer");
            }
        }

        Ok(())
    }

    /// Called after every message; a lone SOA answering an IXFR means the
    /// requester is current.
    fn end_of_message(&mut self, ixfr_serial: Option<u32>) {
        if let Some(serial) = ixfr_serial {
            let first = self.first_serial();
            if matches!(self.phase, Phase::AfterFirst) && (first == serial || serial_lt(first, serial)) {
                self.phase = Phase::Done;
            }
        }
    }

    fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    fn finish(self, ixfr_serial: Option<u32>) -> Result<TransferResult> {
        let soa = self.first_soa.ok_or(TransferError::Malformed)?;

        if !self.changes.is_empty() {
            return Ok(TransferResult::Incremental(self.changes));
        }

        let serial = soa.get_serial().unwrap_or(0);
        if let Some(requested) = ixfr_serial {
            if self.records.is_empty() && (serial == requested || serial_lt(serial, requested)) {
                return Ok(TransferResult::UpToDate(serial));
            }
        }

        let domain = soa.get_domain().ok_or(TransferError::Malformed)?;
        let mut zone = Zone::new(domain, String::new(), String::new());
        zone.add_record(&soa);
        for rec in &self.records {
            zone.add_record(rec);
        }

        Ok(TransferResult::Full(zone))
    }
}

/// Pulls zones from another server over a length prefixed stream
pub struct TransferClient {
    timeout: Duration,
}

impl Default for TransferClient {
    fn default() -> Self {
        TransferClient::new(Duration::from_secs(120))
    }
}

impl TransferClient {
    pub fn new(timeout: Duration) -> TransferClient {
        TransferClient { timeout }
    }

    /// Requests a full copy of `zone`.
    pub async fn axfr<S>(&self, stream: &mut S, zone: &str) -> Result<Zone>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = DnsPacket::new();
        request.header.id = rand::random::<u16>();
        request
            .questions
            .push(DnsQuestion::new(zone.to_string(), QueryType::Axfr));

        match self.transfer(stream, &request, None).await? {
            TransferResult::Full(zone) => Ok(zone),
            _ => Err(TransferError::Malformed),
        }
    }

    /// Requests the changes since `local`'s serial.
    pub async fn ixfr<S>(&self, stream: &mut S, local: &Zone) -> Result<TransferResult>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = DnsPacket::new();
        request.header.id = rand::random::<u16>();
        request
            .questions
            .push(DnsQuestion::new(local.domain.clone(), QueryType::Ixfr));
        request.authorities.push(local.soa_record());

        self.transfer(stream, &request, Some(local.serial)).await
    }

    /// Connects to `server` and brings `authority`'s copy of `zone` up to
    /// date, incrementally when a copy exists.
    pub async fn refresh(
        &self,
        server: SocketAddr,
        zone: &str,
        authority: &Authority,
        handler: &ZoneTransferHandler,
    ) -> Result<TransferResult> {
        let mut stream = TcpStream::connect(server).await?;

        let result = match authority.get_zone(zone) {
            Some(local) => self.ixfr(&mut stream, &local).await?,
            None => TransferResult::Full(self.axfr(&mut stream, zone).await?),
        };

        handler.apply_result(authority, zone, result.clone())?;

        Ok(result)
    }

    async fn transfer<S>(
        &self,
        stream: &mut S,
        request: &DnsPacket,
        ixfr_serial: Option<u32>,
    ) -> Result<TransferResult>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(self.timeout, self.exchange(stream, request, ixfr_serial)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::TimeOut),
        }
    }

    async fn exchange<S>(
        &self,
        stream: &mut S,
        request: &DnsPacket,
        ixfr_serial: Option<u32>,
    ) -> Result<TransferResult>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_packet(stream, &request.to_bytes()?).await?;

        let mut reader = TransferReader::new();
        while !reader.is_done() {
            let data = read_packet(stream).await?;
            let message = DnsPacket::from_bytes(&data)?;

            if message.header.id != request.header.id {
                log::info!("Ignoring transfer message with id {}", message.header.id);
                continue;
            }
            if message.header.rescode != ResultCode::NOERROR {
                log::warn!(
                    "Transfer of {:?} rejected with {:?}",
                    request.questions.first().map(|q| &q.name),
                    message.header.rescode
                );
                return Err(TransferError::Rejected);
            }

            for rec in message.answers {
                reader.push(rec)?;
                if reader.is_done() {
                    break;
                }
            }
            reader.end_of_message(ixfr_serial);
        }

        reader.finish(ixfr_serial)
    }
}
