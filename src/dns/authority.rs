//! Contains the data store for local zones
//!
//! Every zone keeps its records keyed by lowercased owner name, in the order
//! they were added. The set of zones is published as an immutable snapshot:
//! readers clone an `Arc` and never observe a half applied update, writers
//! build a new snapshot and swap it in.
//!
//! ## Wildcard Records
//!
//! An owner of the form `*.sub.example.com` answers for any name exactly one
//! label below `sub.example.com` that has no records of its own. Returned
//! records carry the query name as owner.
//!
//! ## Apex Records
//!
//! `@` and `@.example.com` are accepted as aliases for the zone apex when
//! records are added.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use derive_more::{Display, Error, From};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::metrics::ZONE_STATS;
use crate::dns::protocol::{normalize_name, DnsPacket, DnsRecord, QueryType, ResultCode, TransientTtl};

#[derive(Debug, Display, From, Error)]
pub enum AuthorityError {
    Buffer(crate::dns::buffer::BufferError),
    Protocol(crate::dns::protocol::ProtocolError),
    Io(std::io::Error),
    PoisonedLock,
    NoSuchZone,
}

type Result<T> = std::result::Result<T, AuthorityError>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Zone {
    pub domain: String,
    pub m_name: String,
    pub r_name: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
    records: BTreeMap<String, Vec<DnsRecord>>,
}

impl Zone {
    pub fn new(domain: String, m_name: String, r_name: String) -> Zone {
        Zone {
            domain: normalize_name(&domain),
            m_name,
            r_name,
            serial: 0,
            refresh: 0,
            retry: 0,
            expire: 0,
            minimum: 0,
            records: BTreeMap::new(),
        }
    }

    /// Maps an owner name onto its storage key, resolving `@` to the apex.
    fn owner_key(&self, owner: &str) -> String {
        let owner = normalize_name(owner);
        if owner == "@" || owner == format!("@.{}", self.domain) {
            self.domain.clone()
        } else {
            owner
        }
    }

    /// True when `qname` is the apex or lies below it.
    pub fn contains(&self, qname: &str) -> bool {
        let qname = normalize_name(qname);
        self.domain.is_empty()
            || qname == self.domain
            || qname.ends_with(&format!(".{}", self.domain))
    }

    /// Adds a record, returning false if an identical record is already
    /// present. A record differing from a stored one only in its TTL
    /// replaces it. An SOA at the apex replaces the zone's SOA data instead
    /// of being stored alongside the other records.
    pub fn add_record(&mut self, rec: &DnsRecord) -> bool {
        let owner = match rec.get_domain() {
            Some(x) => self.owner_key(&x),
            None => return false,
        };

        if let DnsRecord::Soa {
            ref m_name,
            ref r_name,
            serial,
            refresh,
            retry,
            expire,
            minimum,
            ..
        } = *rec
        {
            if owner == self.domain {
                self.m_name = m_name.clone();
                self.r_name = r_name.clone();
                self.serial = serial;
                self.refresh = refresh;
                self.retry = retry;
                self.expire = expire;
                self.minimum = minimum;
                return true;
            }
        }

        let mut rec = rec.clone();
        rec.set_domain(&owner);

        let entry = self.records.entry(owner).or_insert_with(Vec::new);
        match entry.iter_mut().find(|x| **x == rec) {
            Some(existing) if existing.get_ttl() == rec.get_ttl() => false,
            Some(existing) => {
                *existing = rec;
                true
            }
            None => {
                entry.push(rec);
                true
            }
        }
    }

    pub fn delete_record(&mut self, rec: &DnsRecord) -> bool {
        let owner = match rec.get_domain() {
            Some(x) => self.owner_key(&x),
            None => return false,
        };

        let mut rec = rec.clone();
        rec.set_domain(&owner);

        let removed = match self.records.get_mut(&owner) {
            Some(entry) => {
                let before = entry.len();
                entry.retain(|x| *x != rec);
                before != entry.len()
            }
            None => false,
        };

        if self.records.get(&owner).map(|x| x.is_empty()).unwrap_or(false) {
            self.records.remove(&owner);
        }

        removed
    }

    /// The zone's SOA data as a record.
    pub fn soa_record(&self) -> DnsRecord {
        DnsRecord::Soa {
            domain: self.domain.clone(),
            m_name: self.m_name.clone(),
            r_name: self.r_name.clone(),
            serial: self.serial,
            refresh: self.refresh,
            retry: self.retry,
            expire: self.expire,
            minimum: self.minimum,
            ttl: TransientTtl(self.minimum),
        }
    }

    /// Records stored under exactly `name`. `QueryType::Any` returns every
    /// record at the name. Unknown names yield an empty list.
    pub fn get_records(&self, name: &str, qtype: QueryType) -> Vec<DnsRecord> {
        let key = normalize_name(name);

        let mut result = Vec::new();
        if key == self.domain && (qtype == QueryType::Soa || qtype == QueryType::Any) {
            result.push(self.soa_record());
        }

        if let Some(records) = self.records.get(&key) {
            result.extend(
                records
                    .iter()
                    .filter(|rec| qtype == QueryType::Any || rec.get_querytype() == qtype)
                    .cloned(),
            );
        }

        result
    }

    fn wildcard_for(&self, name: &str) -> Option<String> {
        if name == self.domain {
            return None;
        }
        let (_, parent) = name.split_once('.')?;
        let wildcard = format!("*.{}", parent);
        if self.records.contains_key(&wildcard) {
            Some(wildcard)
        } else {
            None
        }
    }

    /// Like `get_records`, but falls back to a covering wildcard when the
    /// name itself does not exist.
    pub fn lookup(&self, name: &str, qtype: QueryType) -> Vec<DnsRecord> {
        let key = normalize_name(name);
        if self.name_exists(&key) {
            return self.get_records(&key, qtype);
        }

        match self.wildcard_for(&key) {
            Some(wildcard) => self
                .get_records(&wildcard, qtype)
                .into_iter()
                .map(|mut rec| {
                    rec.set_domain(name);
                    rec
                })
                .collect(),
            None => Vec::new(),
        }
    }

    fn name_exists(&self, key: &str) -> bool {
        if key == self.domain || self.records.contains_key(key) {
            return true;
        }

        // Empty non-terminals exist as well
        let suffix = format!(".{}", key);
        self.records.keys().any(|owner| owner.ends_with(&suffix))
    }

    /// True if the name exists in the zone, directly or through a wildcard.
    pub fn has_name(&self, name: &str) -> bool {
        let key = normalize_name(name);
        self.name_exists(&key) || self.wildcard_for(&key).is_some()
    }

    /// Every stored record except the apex SOA, ordered by owner name.
    pub fn records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.records.values().flatten()
    }

    /// Number of records including the SOA.
    pub fn record_count(&self) -> usize {
        self.records.values().map(|x| x.len()).sum::<usize>() + 1
    }
}

#[derive(Clone, Default)]
pub struct Zones {
    zones: BTreeMap<String, Arc<Zone>>,
}

impl Zones {
    pub fn new() -> Zones {
        Zones {
            zones: BTreeMap::new(),
        }
    }

    pub fn zones(&self) -> Vec<Arc<Zone>> {
        self.zones.values().cloned().collect()
    }

    pub fn get_zone(&self, domain: &str) -> Option<Arc<Zone>> {
        self.zones.get(&normalize_name(domain)).cloned()
    }

    /// Finds the zone with the longest apex that `qname` falls under.
    pub fn find_zone(&self, qname: &str) -> Option<Arc<Zone>> {
        let qname = normalize_name(qname);

        let mut candidate = qname.as_str();
        loop {
            if let Some(zone) = self.zones.get(candidate) {
                return Some(zone.clone());
            }
            if candidate.is_empty() {
                return None;
            }
            candidate = match candidate.split_once('.') {
                Some((_, parent)) => parent,
                None => "",
            };
        }
    }

    fn read_zone(data: &[u8]) -> Result<Zone> {
        let mut buffer = VectorPacketBuffer::from_bytes(data);

        let mut zone = Zone::default();
        buffer.read_qname(&mut zone.domain)?;
        zone.domain = normalize_name(&zone.domain);
        buffer.read_qname(&mut zone.m_name)?;
        buffer.read_qname(&mut zone.r_name)?;
        zone.serial = buffer.read_u32()?;
        zone.refresh = buffer.read_u32()?;
        zone.retry = buffer.read_u32()?;
        zone.expire = buffer.read_u32()?;
        zone.minimum = buffer.read_u32()?;

        let record_count = buffer.read_u32()?;
        for _ in 0..record_count {
            let rr = DnsRecord::read(&mut buffer)?;
            zone.add_record(&rr);
        }

        Ok(zone)
    }

    fn write_zone(zone: &Zone) -> Result<Vec<u8>> {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname(&zone.domain)?;
        buffer.write_qname(&zone.m_name)?;
        buffer.write_qname(&zone.r_name)?;
        buffer.write_u32(zone.serial)?;
        buffer.write_u32(zone.refresh)?;
        buffer.write_u32(zone.retry)?;
        buffer.write_u32(zone.expire)?;
        buffer.write_u32(zone.minimum)?;
        buffer.write_u32((zone.record_count() - 1) as u32)?;

        for rec in zone.records() {
            rec.write(&mut buffer)?;
        }

        Ok(buffer.into_inner())
    }

    /// Reads every zone snapshot in `zones_dir`. Unreadable files are
    /// skipped with a warning.
    pub fn load(&mut self, zones_dir: &Path) -> Result<()> {
        for wrapped_filename in zones_dir.read_dir()? {
            let filename = match wrapped_filename {
                Ok(x) => x,
                Err(_) => continue,
            };

            let data = match fs::read(filename.path()) {
                Ok(x) => x,
                Err(e) => {
                    log::warn!("Failed to read zone file {:?}: {}", filename.path(), e);
                    continue;
                }
            };

            let zone = match Zones::read_zone(&data) {
                Ok(x) => x,
                Err(e) => {
                    log::warn!("Failed to parse zone file {:?}: {}", filename.path(), e);
                    continue;
                }
            };

            log::info!(
                "Loaded zone {} with {} records",
                zone.domain,
                zone.record_count()
            );

            self.zones.insert(zone.domain.clone(), Arc::new(zone));
        }

        Ok(())
    }

    pub fn save(&self, zones_dir: &Path) -> Result<()> {
        for zone in self.zones.values() {
            let filename = zones_dir.join(Path::new(&zone.domain));
            fs::write(&filename, Zones::write_zone(zone)?)?;
        }

        Ok(())
    }
}

#[derive(Default)]
pub struct Authority {
    zones: RwLock<Arc<Zones>>,
}

impl Authority {
    pub fn new() -> Authority {
        Authority {
            zones: RwLock::new(Arc::new(Zones::new())),
        }
    }

    /// The current set of zones. The snapshot never changes underneath the
    /// caller.
    pub fn snapshot(&self) -> Result<Arc<Zones>> {
        let zones = self.zones.read().map_err(|_| AuthorityError::PoisonedLock)?;
        Ok(zones.clone())
    }

    fn swap<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Zones) -> Result<T>,
    {
        let mut zones = self
            .zones
            .write()
            .map_err(|_| AuthorityError::PoisonedLock)?;

        let mut next = (**zones).clone();
        let result = f(&mut next)?;

        ZONE_STATS
            .with_label_values(&["total_zones"])
            .set(next.zones.len() as i64);

        *zones = Arc::new(next);

        Ok(result)
    }

    pub fn load(&self, zones_dir: &Path) -> Result<()> {
        self.swap(|zones| zones.load(zones_dir))
    }

    pub fn save(&self, zones_dir: &Path) -> Result<()> {
        self.snapshot()?.save(zones_dir)
    }

    /// Installs a zone, replacing any zone with the same apex.
    pub fn add_zone(&self, zone: Zone) -> Result<()> {
        log::info!(
            "Adding zone {} (serial {}, {} records)",
            zone.domain,
            zone.serial,
            zone.record_count()
        );

        self.swap(|zones| {
            zones.zones.insert(zone.domain.clone(), Arc::new(zone));
            Ok(())
        })
    }

    pub fn remove_zone(&self, domain: &str) -> Result<Arc<Zone>> {
        self.swap(|zones| {
            zones
                .zones
                .remove(&normalize_name(domain))
                .ok_or(AuthorityError::NoSuchZone)
        })
    }

    /// Applies `f` to a copy of the named zone and publishes the result.
    pub fn update_zone<F, T>(&self, domain: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Zone) -> T,
    {
        let key = normalize_name(domain);
        self.swap(|zones| {
            let mut zone = zones
                .zones
                .get(&key)
                .map(|x| (**x).clone())
                .ok_or(AuthorityError::NoSuchZone)?;

            let result = f(&mut zone);
            zones.zones.insert(key, Arc::new(zone));

            Ok(result)
        })
    }

    pub fn get_zone(&self, domain: &str) -> Option<Arc<Zone>> {
        self.snapshot().ok()?.get_zone(domain)
    }

    pub fn find_zone(&self, qname: &str) -> Option<Arc<Zone>> {
        self.snapshot().ok()?.find_zone(qname)
    }

    pub fn zones(&self) -> Vec<Arc<Zone>> {
        self.snapshot().map(|x| x.zones()).unwrap_or_default()
    }

    /// Answers a query from local zone data, or returns `None` when no
    /// loaded zone covers `qname`.
    ///
    /// CNAMEs are chased while the target stays inside the zone, for at most
    /// `max_cname_depth` hops. A chain that is still unresolved at that
    /// depth yields NXDOMAIN. A chain that leaves the zone ends with the
    /// alias in the answer section, leaving the rest to the caller. Missing
    /// names yield NXDOMAIN and names without data of the requested type
    /// yield an empty NOERROR, both with the zone SOA in the authority
    /// section.
    pub fn query(&self, qname: &str, qtype: QueryType, max_cname_depth: usize) -> Option<DnsPacket> {
        let zone = self.find_zone(qname)?;

        let mut packet = DnsPacket::new();
        packet.header.authoritative_answer = true;

        let mut current = qname.to_string();
        let mut visited = HashSet::new();
        let mut hops = 0;

        loop {
            visited.insert(normalize_name(&current));

            let records = zone.lookup(&current, qtype);
            if !records.is_empty() {
                packet.answers.extend(records);
                break;
            }

            let alias = if qtype != QueryType::Cname && qtype != QueryType::Any {
                zone.lookup(&current, QueryType::Cname).into_iter().next()
            } else {
                None
            };

            let (alias, target) = match alias {
                Some(DnsRecord::Cname { domain, host, ttl }) => {
                    let target = host.clone();
                    (DnsRecord::Cname { domain, host, ttl }, target)
                }
                _ => {
                    if !zone.has_name(&current) {
                        packet.header.rescode = ResultCode::NXDOMAIN;
                    }
                    packet.authorities.push(zone.soa_record());
                    break;
                }
            };

            if hops >= max_cname_depth || visited.contains(&normalize_name(&target)) {
                log::debug!("CNAME chain for {} exceeds {} hops", qname, max_cname_depth);
                packet.header.rescode = ResultCode::NXDOMAIN;
                packet.authorities.push(zone.soa_record());
                break;
            }

            packet.answers.push(alias);
            hops += 1;

            if !zone.contains(&target) {
                break;
            }

            current = target;
        }

        Some(packet)
    }
}
