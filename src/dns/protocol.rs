//! implements the DNS protocol in a transport agnostic fashion

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
    MalformedMessage,
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// Class IN, the only class records are stored for
pub const CLASS_IN: u16 = 1;

/// Largest message a UDP client can receive without EDNS
pub const UDP_PAYLOAD_SIZE: usize = 512;

/// Largest message that fits in a length prefixed stream frame
pub const TCP_PAYLOAD_SIZE: usize = 0xFFFF;

/// Lowercases a name and strips the trailing dot, the form names are
/// compared and stored in.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// `QueryType` represents the requested Record Type of a query
///
/// The specific type Unknown that an integer parameter in order to retain the
/// id of an unknown query when compiling the reply. An integer can be converted
/// to a querytype using the `from_num` function, and back to an integer using
/// the `to_num` method.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum QueryType {
    Unknown(u16),
    A,     // 1
    Ns,    // 2
    Cname, // 5
    Soa,   // 6
    Ptr,   // 12
    Mx,    // 15
    Txt,   // 16
    Aaaa,  // 28
    Srv,   // 33
    Opt,   // 41
    Ixfr,  // 251
    Axfr,  // 252
    Any,   // 255
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Ptr => 12,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
            QueryType::Opt => 41,
            QueryType::Ixfr => 251,
            QueryType::Axfr => 252,
            QueryType::Any => 255,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            12 => QueryType::Ptr,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            41 => QueryType::Opt,
            251 => QueryType::Ixfr,
            252 => QueryType::Axfr,
            255 => QueryType::Any,
            _ => QueryType::Unknown(num),
        }
    }

    /// Zone transfer types are only served over streams.
    pub fn is_transfer(&self) -> bool {
        matches!(*self, QueryType::Axfr | QueryType::Ixfr)
    }
}

#[derive(Copy, Clone, Debug, Eq, Serialize, Deserialize)]
pub struct TransientTtl(pub u32);

impl PartialEq<TransientTtl> for TransientTtl {
    fn eq(&self, _: &TransientTtl) -> bool {
        true
    }
}

impl PartialOrd<TransientTtl> for TransientTtl {
    fn partial_cmp(&self, other: &TransientTtl) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransientTtl {
    fn cmp(&self, _: &TransientTtl) -> Ordering {
        Ordering::Equal
    }
}

impl Hash for TransientTtl {
    fn hash<H>(&self, _: &mut H)
    where
        H: Hasher,
    {
        // purposely left empty
    }
}

/// `DnsRecord` is the primary representation of a DNS record
///
/// This enumeration is used for reading as well as writing records, from network
/// and from disk (for storage of authority data). Types without a dedicated
/// variant keep their rdata as opaque bytes so they survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DnsRecord {
    Unknown {
        domain: String,
        qtype: u16,
        data: Vec<u8>,
        ttl: TransientTtl,
    }, // 0
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: TransientTtl,
    }, // 1
    Ns {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 2
    Cname {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 5
    Soa {
        domain: String,
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: TransientTtl,
    }, // 6
    Ptr {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 12
    Mx {
        domain: String,
        priority: u16,
        host: String,
        ttl: TransientTtl,
    }, // 15
    Txt {
        domain: String,
        data: String,
        ttl: TransientTtl,
    }, // 16
    Aaaa {
        domain: String,
        addr: Ipv6Addr,
        ttl: TransientTtl,
    }, // 28
    Srv {
        domain: String,
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
        ttl: TransientTtl,
    }, // 33
    Opt {
        packet_len: u16,
        flags: u32,
        data: Vec<u8>,
    }, // 41
}

impl DnsRecord {
    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()? as usize;

        let rdata_start = buffer.pos();
        let rdata_end = rdata_start + data_len;

        // Reject a length field pointing past the end before decoding anything
        buffer.get_range(rdata_start, data_len)?;

        let record = match qtype {
            QueryType::A => {
                let raw_addr = buffer.read_u32()?;
                let addr = Ipv4Addr::from(raw_addr);

                DnsRecord::A {
                    domain,
                    addr,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Aaaa => {
                let mut octets = [0u8; 16];
                for octet in octets.iter_mut() {
                    *octet = buffer.read()?;
                }

                DnsRecord::Aaaa {
                    domain,
                    addr: Ipv6Addr::from(octets),
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Ns => {
                let mut ns = String::new();
                buffer.read_qname(&mut ns)?;

                DnsRecord::Ns {
                    domain,
                    host: ns,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Cname => {
                let mut cname = String::new();
                buffer.read_qname(&mut cname)?;

                DnsRecord::Cname {
                    domain,
                    host: cname,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Ptr => {
                let mut ptr = String::new();
                buffer.read_qname(&mut ptr)?;

                DnsRecord::Ptr {
                    domain,
                    host: ptr,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Srv => {
                let priority = buffer.read_u16()?;
                let weight = buffer.read_u16()?;
                let port = buffer.read_u16()?;

                let mut srv = String::new();
                buffer.read_qname(&mut srv)?;

                DnsRecord::Srv {
                    domain,
                    priority,
                    weight,
                    port,
                    host: srv,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Mx => {
                let priority = buffer.read_u16()?;
                let mut mx = String::new();
                buffer.read_qname(&mut mx)?;

                DnsRecord::Mx {
                    domain,
                    priority,
                    host: mx,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Soa => {
                let mut m_name = String::new();
                buffer.read_qname(&mut m_name)?;

                let mut r_name = String::new();
                buffer.read_qname(&mut r_name)?;

                let serial = buffer.read_u32()?;
                let refresh = buffer.read_u32()?;
                let retry = buffer.read_u32()?;
                let expire = buffer.read_u32()?;
                let minimum = buffer.read_u32()?;

                DnsRecord::Soa {
                    domain,
                    m_name,
                    r_name,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Txt => {
                // One or more length prefixed character strings
                let mut raw = Vec::with_capacity(data_len);
                while buffer.pos() < rdata_end {
                    let chunk_len = buffer.read()? as usize;
                    let cur_pos = buffer.pos();
                    raw.extend_from_slice(buffer.get_range(cur_pos, chunk_len)?);
                    buffer.step(chunk_len)?;
                }

                DnsRecord::Txt {
                    domain,
                    data: String::from_utf8_lossy(&raw).into_owned(),
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Opt => {
                let data = buffer.get_range(rdata_start, data_len)?.to_vec();
                buffer.step(data_len)?;

                DnsRecord::Opt {
                    packet_len: class,
                    flags: ttl,
                    data,
                }
            }
            QueryType::Ixfr | QueryType::Axfr | QueryType::Any | QueryType::Unknown(_) => {
                let data = buffer.get_range(rdata_start, data_len)?.to_vec();
                buffer.step(data_len)?;

                DnsRecord::Unknown {
                    domain,
                    qtype: qtype_num,
                    data,
                    ttl: TransientTtl(ttl),
                }
            }
        };

        if buffer.pos() != rdata_end {
            log::debug!(
                "rdata length mismatch for {:?}: declared {}, parsed {}",
                qtype,
                data_len,
                buffer.pos() - rdata_start
            );
            return Err(ProtocolError::MalformedMessage);
        }

        Ok(record)
    }

    fn write_preamble<T: PacketBuffer>(
        buffer: &mut T,
        domain: &str,
        qtype: QueryType,
        ttl: u32,
    ) -> Result<usize> {
        buffer.write_qname(domain)?;
        buffer.write_u16(qtype.to_num())?;
        buffer.write_u16(CLASS_IN)?;
        buffer.write_u32(ttl)?;

        let pos = buffer.pos();
        buffer.write_u16(0)?;

        Ok(pos)
    }

    fn finish_rdata<T: PacketBuffer>(buffer: &mut T, len_pos: usize) -> Result<()> {
        let size = buffer.pos() - (len_pos + 2);
        if size > 0xFFFF {
            return Err(ProtocolError::MalformedMessage);
        }
        buffer.set_u16(len_pos, size as u16)?;

        Ok(())
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        match *self {
            DnsRecord::A {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                let pos = Self::write_preamble(buffer, domain, QueryType::A, ttl)?;
                buffer.write_bytes(&addr.octets())?;
                Self::finish_rdata(buffer, pos)?;
            }
            DnsRecord::Aaaa {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                let pos = Self::write_preamble(buffer, domain, QueryType::Aaaa, ttl)?;
                for segment in &addr.segments() {
                    buffer.write_u16(*segment)?;
                }
                Self::finish_rdata(buffer, pos)?;
            }
            DnsRecord::Ns {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                let pos = Self::write_preamble(buffer, domain, QueryType::Ns, ttl)?;
                buffer.write_qname(host)?;
                Self::finish_rdata(buffer, pos)?;
            }
            DnsRecord::Cname {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                let pos = Self::write_preamble(buffer, domain, QueryType::Cname, ttl)?;
                buffer.write_qname(host)?;
                Self::finish_rdata(buffer, pos)?;
            }
            DnsRecord::Ptr {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                let pos = Self::write_preamble(buffer, domain, QueryType::Ptr, ttl)?;
                buffer.write_qname(host)?;
                Self::finish_rdata(buffer, pos)?;
            }
            DnsRecord::Srv {
                ref domain,
                priority,
                weight,
                port,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                let pos = Self::write_preamble(buffer, domain, QueryType::Srv, ttl)?;
                buffer.write_u16(priority)?;
                buffer.write_u16(weight)?;
                buffer.write_u16(port)?;
                buffer.write_qname(host)?;
                Self::finish_rdata(buffer, pos)?;
            }
            DnsRecord::Mx {
                ref domain,
                priority,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                let pos = Self::write_preamble(buffer, domain, QueryType::Mx, ttl)?;
                buffer.write_u16(priority)?;
                buffer.write_qname(host)?;
                Self::finish_rdata(buffer, pos)?;
            }
            DnsRecord::Soa {
                ref domain,
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ttl: TransientTtl(ttl),
            } => {
                let pos = Self::write_preamble(buffer, domain, QueryType::Soa, ttl)?;
                buffer.write_qname(m_name)?;
                buffer.write_qname(r_name)?;
                buffer.write_u32(serial)?;
                buffer.write_u32(refresh)?;
                buffer.write_u32(retry)?;
                buffer.write_u32(expire)?;
                buffer.write_u32(minimum)?;
                Self::finish_rdata(buffer, pos)?;
            }
            DnsRecord::Txt {
                ref domain,
                ref data,
                ttl: TransientTtl(ttl),
            } => {
                let pos = Self::write_preamble(buffer, domain, QueryType::Txt, ttl)?;
                if data.is_empty() {
                    buffer.write_u8(0)?;
                }
                for chunk in data.as_bytes().chunks(255) {
                    buffer.write_u8(chunk.len() as u8)?;
                    buffer.write_bytes(chunk)?;
                }
                Self::finish_rdata(buffer, pos)?;
            }
            DnsRecord::Opt {
                packet_len,
                flags,
                ref data,
            } => {
                buffer.write_u8(0)?;
                buffer.write_u16(QueryType::Opt.to_num())?;
                buffer.write_u16(packet_len)?;
                buffer.write_u32(flags)?;
                buffer.write_u16(data.len() as u16)?;
                buffer.write_bytes(data)?;
            }
            DnsRecord::Unknown {
                ref domain,
                qtype,
                ref data,
                ttl: TransientTtl(ttl),
            } => {
                let pos = Self::write_preamble(buffer, domain, QueryType::Unknown(qtype), ttl)?;
                buffer.write_bytes(data)?;
                Self::finish_rdata(buffer, pos)?;
            }
        }

        Ok(buffer.pos() - start_pos)
    }

    pub fn get_querytype(&self) -> QueryType {
        match *self {
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::Aaaa { .. } => QueryType::Aaaa,
            DnsRecord::Ns { .. } => QueryType::Ns,
            DnsRecord::Cname { .. } => QueryType::Cname,
            DnsRecord::Ptr { .. } => QueryType::Ptr,
            DnsRecord::Srv { .. } => QueryType::Srv,
            DnsRecord::Mx { .. } => QueryType::Mx,
            DnsRecord::Unknown { qtype, .. } => QueryType::from_num(qtype),
            DnsRecord::Soa { .. } => QueryType::Soa,
            DnsRecord::Txt { .. } => QueryType::Txt,
            DnsRecord::Opt { .. } => QueryType::Opt,
        }
    }

    pub fn get_domain(&self) -> Option<String> {
        match *self {
            DnsRecord::A { ref domain, .. }
            | DnsRecord::Aaaa { ref domain, .. }
            | DnsRecord::Ns { ref domain, .. }
            | DnsRecord::Cname { ref domain, .. }
            | DnsRecord::Ptr { ref domain, .. }
            | DnsRecord::Srv { ref domain, .. }
            | DnsRecord::Mx { ref domain, .. }
            | DnsRecord::Unknown { ref domain, .. }
            | DnsRecord::Soa { ref domain, .. }
            | DnsRecord::Txt { ref domain, .. } => Some(domain.clone()),
            DnsRecord::Opt { .. } => None,
        }
    }

    /// Replaces the owner name, used when answering from a wildcard.
    pub fn set_domain(&mut self, name: &str) {
        match *self {
            DnsRecord::A { ref mut domain, .. }
            | DnsRecord::Aaaa { ref mut domain, .. }
            | DnsRecord::Ns { ref mut domain, .. }
            | DnsRecord::Cname { ref mut domain, .. }
            | DnsRecord::Ptr { ref mut domain, .. }
            | DnsRecord::Srv { ref mut domain, .. }
            | DnsRecord::Mx { ref mut domain, .. }
            | DnsRecord::Unknown { ref mut domain, .. }
            | DnsRecord::Soa { ref mut domain, .. }
            | DnsRecord::Txt { ref mut domain, .. } => *domain = name.to_string(),
            DnsRecord::Opt { .. } => {}
        }
    }

    pub fn get_ttl(&self) -> u32 {
        match *self {
            DnsRecord::A {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Aaaa {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Ns {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Cname {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Ptr {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Srv {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Mx {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Unknown {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Soa {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Txt {
                ttl: TransientTtl(ttl),
                ..
            } => ttl,
            DnsRecord::Opt { .. } => 0,
        }
    }

    pub fn set_ttl(&mut self, new_ttl: u32) {
        match *self {
            DnsRecord::A { ref mut ttl, .. }
            | DnsRecord::Aaaa { ref mut ttl, .. }
            | DnsRecord::Ns { ref mut ttl, .. }
            | DnsRecord::Cname { ref mut ttl, .. }
            | DnsRecord::Ptr { ref mut ttl, .. }
            | DnsRecord::Srv { ref mut ttl, .. }
            | DnsRecord::Mx { ref mut ttl, .. }
            | DnsRecord::Unknown { ref mut ttl, .. }
            | DnsRecord::Soa { ref mut ttl, .. }
            | DnsRecord::Txt { ref mut ttl, .. } => *ttl = TransientTtl(new_ttl),
            DnsRecord::Opt { .. } => {}
        }
    }

    /// The SOA serial, if this is an SOA record.
    pub fn get_serial(&self) -> Option<u32> {
        match *self {
            DnsRecord::Soa { serial, .. } => Some(serial),
            _ => None,
        }
    }
}

/// The result code for a DNS query (RFC 1035 section 4.1.1)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl ResultCode {
    /// Codes without a variant (YXDOMAIN and up) read as SERVFAIL so they
    /// are never mistaken for success.
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            0 => ResultCode::NOERROR,
            1 => ResultCode::FORMERR,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::SERVFAIL,
        }
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn binary_len(&self) -> usize {
        12
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | ((self.opcode & 0x0F) << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            ((self.rescode as u8) & 0x0F)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} qr={} opcode={} aa={} tc={} rd={} ra={} rcode={:?} qd={} an={} ns={} ar={}",
            self.id,
            self.response,
            self.opcode,
            self.authoritative_answer,
            self.truncated_message,
            self.recursion_desired,
            self.recursion_available,
            self.rescode,
            self.questions,
            self.answers,
            self.authoritative_entries,
            self.resource_entries
        )
    }
}

/// Representation of a DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion {
            name,
            qtype,
            qclass: CLASS_IN,
        }
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;

        let typenum = self.qtype.to_num();
        buffer.write_u16(typenum)?;
        buffer.write_u16(self.qclass)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        self.qclass = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.name, self.qtype)
    }
}

/// Representation of a complete DNS packet
///
/// This is the work horse of the server. A DNS packet can be read and written
/// in a single operation, and is used both by the network facing components and
/// internally by the resolver, cache and authority.
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new("".to_string(), QueryType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            let rec = DnsRecord::read(buffer)?;
            result.answers.push(rec);
        }
        for _ in 0..result.header.authoritative_entries {
            let rec = DnsRecord::read(buffer)?;
            result.authorities.push(rec);
        }
        for _ in 0..result.header.resource_entries {
            let rec = DnsRecord::read(buffer)?;
            result.resources.push(rec);
        }

        Ok(result)
    }

    /// Decodes a complete message.
    pub fn from_bytes(data: &[u8]) -> Result<DnsPacket> {
        let mut buffer = VectorPacketBuffer::from_bytes(data);
        DnsPacket::from_buffer(&mut buffer)
    }

    /// Encodes the message without any size limit.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let (buffer, _, _) = self.encode()?;
        Ok(buffer.into_inner())
    }

    /// Number of leading records that end within `max_size` bytes once
    /// the message is packed.
    pub fn records_within(&self, max_size: usize) -> Result<usize> {
        let (_, _, record_ends) = self.encode()?;
        Ok(record_ends.iter().take_while(|&&end| end <= max_size).count())
    }

    fn record_count(&self) -> usize {
        self.answers.len() + self.authorities.len() + self.resources.len()
    }

    /// Packs the message into a scratch buffer, returning it together with
    /// the end offset of the question section and of every record. Names
    /// only ever point backwards, so any prefix of the output is valid on
    /// its own.
    fn encode(&self) -> Result<(VectorPacketBuffer, usize, Vec<usize>)> {
        let mut header = self.header.clone();
        header.questions = self.questions.len() as u16;
        header.answers = self.answers.len() as u16;
        header.authoritative_entries = self.authorities.len() as u16;
        header.resource_entries = self.resources.len() as u16;

        let mut buffer = VectorPacketBuffer::new();
        header.write(&mut buffer)?;

        for question in &self.questions {
            question.write(&mut buffer)?;
        }
        let questions_end = buffer.pos();

        let mut record_ends = Vec::with_capacity(self.record_count());
        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
        {
            rec.write(&mut buffer)?;
            record_ends.push(buffer.pos());
        }

        Ok((buffer, questions_end, record_ends))
    }

    /// Writes the message to an empty buffer, dropping records from the end
    /// until it fits in `max_size` and flagging the header as truncated when
    /// anything was dropped. The header counts always match the sections
    /// that were actually written.
    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let (mut scratch, _, record_ends) = self.encode()?;

        let fits = record_ends.iter().take_while(|&&end| end <= max_size).count();
        if fits < record_ends.len() {
            let answers = fits.min(self.answers.len());
            let authorities = (fits - answers).min(self.authorities.len());
            let resources = fits - answers - authorities;

            self.answers.truncate(answers);
            self.authorities.truncate(authorities);
            self.resources.truncate(resources);
            self.header.truncated_message = true;

            scratch = self.encode()?.0;
        }

        self.header.questions = self.questions.len() as u16;
        self.header.answers = self.answers.len() as u16;
        self.header.authoritative_entries = self.authorities.len() as u16;
        self.header.resource_entries = self.resources.len() as u16;

        buffer.write_bytes(&scratch.buffer)?;

        Ok(())
    }

    pub fn get_ttl_from_soa(&self) -> Option<u32> {
        for answer in &self.authorities {
            if let DnsRecord::Soa { minimum, .. } = *answer {
                return Some(minimum);
            }
        }

        None
    }

    /// Follows the CNAME chain in the answer section from `qname` and
    /// returns the final alias target when the answers hold no record of
    /// `qtype` for it.
    pub fn get_unresolved_cname(&self, qname: &str, qtype: QueryType) -> Option<String> {
        let mut current = normalize_name(qname);
        let mut target = None;

        for _ in 0..self.answers.len() {
            let next = self.answers.iter().find_map(|rec| match *rec {
                DnsRecord::Cname {
                    ref domain,
                    ref host,
                    ..
                } if normalize_name(domain) == current => Some(host.clone()),
                _ => None,
            });

            match next {
                Some(host) => {
                    current = normalize_name(&host);
                    target = Some(host);
                }
                None => break,
            }
        }

        let target = target?;
        let resolved = self.answers.iter().any(|rec| {
            rec.get_querytype() == qtype
                && rec
                    .get_domain()
                    .map(|d| normalize_name(&d) == current)
                    .unwrap_or(false)
        });

        if resolved {
            None
        } else {
            Some(target)
        }
    }

    /// The UDP payload size the sender advertised through EDNS, if any.
    pub fn edns_payload_size(&self) -> Option<u16> {
        self.resources.iter().find_map(|rec| match *rec {
            DnsRecord::Opt { packet_len, .. } => Some(packet_len),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

    #[test]
    fn test_packet() {
        let mut packet = DnsPacket::new();
        packet.header.id = 1337;
        packet.header.response = true;

        packet
            .questions
            .push(DnsQuestion::new("google.com".to_string(), QueryType::Ns));
        packet.answers.push(DnsRecord::Ns {
            domain: "google.com".to_string(),
            host: "ns1.google.com".to_string(),
            ttl: TransientTtl(3600),
        });
        packet.answers.push(DnsRecord::Ns {
            domain: "google.com".to_string(),
            host: "ns2.google.com".to_string(),
            ttl: TransientTtl(3600),
        });
        packet.answers.push(DnsRecord::Ns {
            domain: "google.com".to_string(),
            host: "ns3.google.com".to_string(),
            ttl: TransientTtl(3600),
        });
        packet.answers.push(DnsRecord::Ns {
            domain: "google.com".to_string(),
            host: "ns4.google.com".to_string(),
            ttl: TransientTtl(3600),
        });

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, 0xFFFF).unwrap();

        buffer.seek(0).unwrap();

        let parsed_packet = DnsPacket::from_buffer(&mut buffer).unwrap();

        assert_eq!(1337, parsed_packet.header.id);
        assert!(parsed_packet.header.response);
        assert_eq!(4, parsed_packet.header.answers);
        assert_eq!(packet.questions[0], parsed_packet.questions[0]);
        assert_eq!(packet.answers, parsed_packet.answers);
    }

    #[test]
    fn test_all_record_types_survive_encoding() {
        let mut packet = DnsPacket::new();
        packet
            .questions
            .push(DnsQuestion::new("example.com".to_string(), QueryType::Any));
        packet.answers = vec![
            DnsRecord::A {
                domain: "example.com".to_string(),
                addr: "10.0.0.1".parse().unwrap(),
                ttl: TransientTtl(60),
            },
            DnsRecord::Aaaa {
                domain: "example.com".to_string(),
                addr: "2001:db8::1".parse().unwrap(),
                ttl: TransientTtl(60),
            },
            DnsRecord::Cname {
                domain: "www.example.com".to_string(),
                host: "example.com".to_string(),
                ttl: TransientTtl(60),
            },
            DnsRecord::Ptr {
                domain: "1.0.0.10.in-addr.arpa".to_string(),
                host: "example.com".to_string(),
                ttl: TransientTtl(60),
            },
            DnsRecord::Mx {
                domain: "example.com".to_string(),
                priority: 10,
                host: "mail.example.com".to_string(),
                ttl: TransientTtl(60),
            },
            DnsRecord::Srv {
                domain: "_sip._udp.example.com".to_string(),
                priority: 1,
                weight: 5,
                port: 5060,
                host: "sip.example.com".to_string(),
                ttl: TransientTtl(60),
            },
            DnsRecord::Soa {
                domain: "example.com".to_string(),
                m_name: "ns1.example.com".to_string(),
                r_name: "hostmaster.example.com".to_string(),
                serial: 2024010101,
                refresh: 3600,
                retry: 600,
                expire: 604800,
                minimum: 300,
                ttl: TransientTtl(3600),
            },
            DnsRecord::Unknown {
                domain: "example.com".to_string(),
                qtype: 99,
                data: vec![1, 2, 3, 4, 5],
                ttl: TransientTtl(60),
            },
        ];

        let bytes = packet.to_bytes().unwrap();
        let parsed = DnsPacket::from_bytes(&bytes).unwrap();

        assert_eq!(packet.questions, parsed.questions);
        assert_eq!(packet.answers, parsed.answers);
        assert_eq!(QueryType::Unknown(99), parsed.answers[7].get_querytype());
    }

    #[test]
    fn test_long_txt_is_split_into_character_strings() {
        let text = "x".repeat(300);
        let record = DnsRecord::Txt {
            domain: "txt.example.com".to_string(),
            data: text.clone(),
            ttl: TransientTtl(60),
        };

        let mut buffer = VectorPacketBuffer::new();
        record.write(&mut buffer).unwrap();

        // name (17) + type/class/ttl (8) + rdlength (2), then 255 + 45 chunks
        assert_eq!(255, buffer.buffer[27]);
        assert_eq!(45, buffer.buffer[27 + 256]);

        buffer.seek(0).unwrap();
        match DnsRecord::read(&mut buffer).unwrap() {
            DnsRecord::Txt { data, .. } => assert_eq!(text, data),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_rdata_length_mismatch_is_malformed() {
        let record = DnsRecord::A {
            domain: "a.example.com".to_string(),
            addr: "127.0.0.1".parse().unwrap(),
            ttl: TransientTtl(60),
        };

        let mut buffer = VectorPacketBuffer::new();
        record.write(&mut buffer).unwrap();

        // Claim five bytes of rdata for a four byte address
        let len_pos = buffer.pos() - 6;
        buffer.set_u16(len_pos, 5).unwrap();
        buffer.write_u8(0).unwrap();

        buffer.seek(0).unwrap();
        match DnsRecord::read(&mut buffer) {
            Err(ProtocolError::MalformedMessage) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_truncated_input_never_panics() {
        let mut packet = DnsPacket::new();
        packet.header.id = 7;
        packet
            .questions
            .push(DnsQuestion::new("www.example.com".to_string(), QueryType::A));
        packet.answers.push(DnsRecord::A {
            domain: "www.example.com".to_string(),
            addr: "127.0.0.1".parse().unwrap(),
            ttl: TransientTtl(60),
        });

        let bytes = packet.to_bytes().unwrap();
        for len in 0..bytes.len() {
            assert!(DnsPacket::from_bytes(&bytes[..len]).is_err());
        }
        assert!(DnsPacket::from_bytes(&bytes).is_ok());
    }

    #[test]
    fn test_write_truncates_and_sets_tc() {
        let mut packet = DnsPacket::new();
        packet.header.id = 42;
        packet
            .questions
            .push(DnsQuestion::new("big.example.com".to_string(), QueryType::Txt));
        for i in 0..10 {
            packet.answers.push(DnsRecord::Txt {
                domain: "big.example.com".to_string(),
                data: format!("{}{}", i, "y".repeat(100)),
                ttl: TransientTtl(60),
            });
        }

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, UDP_PAYLOAD_SIZE).unwrap();

        assert!(buffer.buffer.len() <= UDP_PAYLOAD_SIZE);
        assert!(packet.header.truncated_message);
        assert!(packet.answers.len() < 10);

        let parsed = DnsPacket::from_bytes(&buffer.buffer).unwrap();
        assert!(parsed.header.truncated_message);
        assert_eq!(packet.answers.len(), parsed.answers.len());
        assert_eq!(packet.answers.len() as u16, parsed.header.answers);
    }

    #[test]
    fn test_stale_header_counts_are_ignored_when_packing() {
        let mut packet = DnsPacket::new();
        packet.header.answers = 9;
        packet.header.questions = 3;
        packet
            .questions
            .push(DnsQuestion::new("example.com".to_string(), QueryType::A));

        let parsed = DnsPacket::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(1, parsed.header.questions);
        assert_eq!(0, parsed.header.answers);
    }

    #[test]
    fn test_unresolved_cname() {
        let mut packet = DnsPacket::new();
        packet.answers.push(DnsRecord::Cname {
            domain: "www.example.com".to_string(),
            host: "cdn.example.net".to_string(),
            ttl: TransientTtl(60),
        });

        assert_eq!(
            Some("cdn.example.net".to_string()),
            packet.get_unresolved_cname("WWW.example.com", QueryType::A)
        );

        packet.answers.push(DnsRecord::A {
            domain: "cdn.example.net".to_string(),
            addr: "10.1.1.1".parse().unwrap(),
            ttl: TransientTtl(60),
        });
        assert_eq!(None, packet.get_unresolved_cname("www.example.com", QueryType::A));
        assert_eq!(None, packet.get_unresolved_cname("other.example.com", QueryType::A));
    }

    #[test]
    fn test_header_flags() {
        let mut packet = DnsPacket::new();
        packet.header.id = 0xBEEF;
        packet.header.opcode = 4;
        packet.header.authoritative_answer = true;
        packet.header.recursion_available = true;
        packet.header.rescode = ResultCode::REFUSED;

        let bytes = packet.to_bytes().unwrap();
        assert_eq!(12, bytes.len());
        assert_eq!([0xBE, 0xEF], [bytes[0], bytes[1]]);

        let parsed = DnsPacket::from_bytes(&bytes).unwrap();
        assert_eq!(4, parsed.header.opcode);
        assert!(parsed.header.authoritative_answer);
        assert!(parsed.header.recursion_available);
        assert!(!parsed.header.recursion_desired);
        assert_eq!(ResultCode::REFUSED, parsed.header.rescode);
    }

    #[test]
    fn test_unknown_rcodes_read_as_servfail() {
        let mut bytes = DnsPacket::new().to_bytes().unwrap();
        bytes[2] = 0x80;

        for code in 6..16u8 {
            bytes[3] = code;
            let parsed = DnsPacket::from_bytes(&bytes).unwrap();
            assert_eq!(ResultCode::SERVFAIL, parsed.header.rescode, "rcode {}", code);
        }

        bytes[3] = 0;
        let parsed = DnsPacket::from_bytes(&bytes).unwrap();
        assert_eq!(ResultCode::NOERROR, parsed.header.rescode);
    }
}
