//! DNS Response Cache
//!
//! A TTL-aware store for records learned from upstream servers, kept apart
//! from authoritative zone data.
//!
//! The cache is organized by:
//! 1. Domain name (case-insensitive)
//! 2. Query type (A, AAAA, NS, etc.)
//! 3. Record entries with their absolute expiry
//!
//! Records for the same name and type accumulate, so round-robin answer
//! sets survive. Expired entries are never returned and are purged when a
//! lookup runs into them. Returned records carry the remaining lifetime as
//! TTL, so two reads of the same entry show a decreasing TTL.
//!
//! Every time dependent operation has an `_at` variant taking the current
//! time explicitly.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Local};
use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::dns::metrics::{DNS_CACHE_OPERATIONS, DNS_CACHE_SIZE};
use crate::dns::protocol::{normalize_name, DnsPacket, DnsRecord, QueryType, ResultCode};

#[derive(Debug, Display, From, Error)]
pub enum CacheError {
    PoisonedLock,
}

type Result<T> = std::result::Result<T, CacheError>;

/// Default bound on the number of cached names
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct RecordEntry {
    pub record: DnsRecord,
    pub expires: DateTime<Local>,
}

impl RecordEntry {
    fn is_live(&self, now: DateTime<Local>) -> bool {
        self.expires > now
    }

    /// Seconds left before expiry, rounded up.
    fn remaining_ttl(&self, now: DateTime<Local>) -> u32 {
        let millis = (self.expires - now).num_milliseconds().max(0);
        ((millis + 999) / 1000) as u32
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RecordSet {
    NoRecords {
        qtype: QueryType,
        expires: DateTime<Local>,
    },
    Records {
        qtype: QueryType,
        records: Vec<RecordEntry>,
    },
}

#[derive(Clone, Debug)]
pub struct DomainEntry {
    pub domain: String,
    pub record_types: HashMap<QueryType, RecordSet>,
    pub hits: u32,
    pub updates: u32,
}

impl DomainEntry {
    pub fn new(domain: String) -> DomainEntry {
        DomainEntry {
            domain,
            record_types: HashMap::new(),
            hits: 0,
            updates: 0,
        }
    }

    pub fn store_nxdomain(&mut self, qtype: QueryType, ttl: u32, now: DateTime<Local>) {
        self.updates += 1;

        let new_set = RecordSet::NoRecords {
            qtype,
            expires: now + Duration::seconds(ttl as i64),
        };

        self.record_types.insert(qtype, new_set);
    }

    pub fn store_record(&mut self, rec: &DnsRecord, now: DateTime<Local>) {
        self.updates += 1;

        let qtype = rec.get_querytype();
        let entry = RecordEntry {
            record: rec.clone(),
            expires: now + Duration::seconds(rec.get_ttl() as i64),
        };

        if let Some(RecordSet::Records {
            ref mut records, ..
        }) = self.record_types.get_mut(&qtype)
        {
            // Identical rdata refreshes the existing entry in place
            match records.iter_mut().find(|x| x.record == entry.record) {
                Some(existing) => *existing = entry,
                None => records.push(entry),
            }
            return;
        }

        let new_set = RecordSet::Records {
            qtype,
            records: vec![entry],
        };

        self.record_types.insert(qtype, new_set);
    }

    /// Drops expired data, returning true if nothing is left.
    fn purge(&mut self, now: DateTime<Local>) -> bool {
        self.record_types.retain(|_, set| match *set {
            RecordSet::NoRecords { expires, .. } => expires > now,
            RecordSet::Records {
                ref mut records, ..
            } => {
                records.retain(|x| x.is_live(now));
                !records.is_empty()
            }
        });

        self.record_types.is_empty()
    }
}

pub struct Cache {
    domain_entries: BTreeMap<String, DomainEntry>,
    max_entries: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Cache::new(DEFAULT_MAX_ENTRIES)
    }
}

impl Cache {
    pub fn new(max_entries: usize) -> Cache {
        Cache {
            domain_entries: BTreeMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.domain_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domain_entries.is_empty()
    }

    pub fn lookup(&mut self, qname: &str, qtype: QueryType) -> Option<DnsPacket> {
        self.lookup_at(qname, qtype, Local::now())
    }

    pub fn lookup_at(
        &mut self,
        qname: &str,
        qtype: QueryType,
        now: DateTime<Local>,
    ) -> Option<DnsPacket> {
        let qtype_str = format!("{:?}", qtype);
        let key = normalize_name(qname);

        let emptied = match self.domain_entries.get_mut(&key) {
            Some(entry) => entry.purge(now),
            None => false,
        };
        if emptied {
            self.domain_entries.remove(&key);
            DNS_CACHE_OPERATIONS
                .with_label_values(&["expire", &qtype_str])
                .inc();
        }

        let result = match self.domain_entries.get_mut(&key) {
            Some(entry) => match entry.record_types.get(&qtype) {
                Some(RecordSet::Records { ref records, .. }) => {
                    entry.hits += 1;

                    let mut qr = DnsPacket::new();
                    for cached in records {
                        let mut record = cached.record.clone();
                        record.set_ttl(cached.remaining_ttl(now));
                        qr.answers.push(record);
                    }

                    DNS_CACHE_OPERATIONS
                        .with_label_values(&["hit", &qtype_str])
                        .inc();
                    Some(qr)
                }
                Some(RecordSet::NoRecords { .. }) => {
                    entry.hits += 1;

                    let mut qr = DnsPacket::new();
                    qr.header.rescode = ResultCode::NXDOMAIN;

                    DNS_CACHE_OPERATIONS
                        .with_label_values(&["negative_hit", &qtype_str])
                        .inc();
                    Some(qr)
                }
                None => None,
            },
            None => None,
        };

        if result.is_none() {
            DNS_CACHE_OPERATIONS
                .with_label_values(&["miss", &qtype_str])
                .inc();
        }

        result
    }

    pub fn store(&mut self, records: &[DnsRecord]) {
        self.store_at(records, Local::now())
    }

    /// Caches every record with a positive TTL. Records with a zero TTL
    /// would be expired on arrival and are skipped.
    pub fn store_at(&mut self, records: &[DnsRecord], now: DateTime<Local>) {
        for rec in records {
            let domain = match rec.get_domain() {
                Some(x) => normalize_name(&x),
                None => continue,
            };

            let qtype_str = format!("{:?}", rec.get_querytype());
            if rec.get_ttl() == 0 {
                DNS_CACHE_OPERATIONS
                    .with_label_values(&["skip", &qtype_str])
                    .inc();
                continue;
            }

            DNS_CACHE_OPERATIONS
                .with_label_values(&["store", &qtype_str])
                .inc();

            self.domain_entries
                .entry(domain.clone())
                .or_insert_with(|| DomainEntry::new(domain))
                .store_record(rec, now);
        }

        self.enforce_limit(now);
    }

    pub fn store_nxdomain(&mut self, qname: &str, qtype: QueryType, ttl: u32) {
        self.store_nxdomain_at(qname, qtype, ttl, Local::now())
    }

    pub fn store_nxdomain_at(
        &mut self,
        qname: &str,
        qtype: QueryType,
        ttl: u32,
        now: DateTime<Local>,
    ) {
        if ttl == 0 {
            return;
        }

        let key = normalize_name(qname);
        self.domain_entries
            .entry(key.clone())
            .or_insert_with(|| DomainEntry::new(key))
            .store_nxdomain(qtype, ttl, now);

        self.enforce_limit(now);
    }

    /// Removes every expired entry, returning how many names were dropped.
    pub fn purge_expired_at(&mut self, now: DateTime<Local>) -> usize {
        let before = self.domain_entries.len();
        self.domain_entries.retain(|_, entry| !entry.purge(now));

        let purged = before - self.domain_entries.len();
        DNS_CACHE_SIZE
            .with_label_values(&["entries"])
            .set(self.domain_entries.len() as i64);

        purged
    }

    fn enforce_limit(&mut self, now: DateTime<Local>) {
        if self.domain_entries.len() > self.max_entries {
            self.purge_expired_at(now);
        }

        while self.domain_entries.len() > self.max_entries {
            let victim = self
                .domain_entries
                .values()
                .min_by_key(|x| (x.hits, x.updates))
                .map(|x| x.domain.clone());

            match victim {
                Some(domain) => {
                    log::debug!("Evicting {} from cache", domain);
                    self.domain_entries.remove(&domain);
                    DNS_CACHE_OPERATIONS
                        .with_label_values(&["evict", "any"])
                        .inc();
                }
                None => break,
            }
        }

        DNS_CACHE_SIZE
            .with_label_values(&["entries"])
            .set(self.domain_entries.len() as i64);
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_hits: u64,
    pub total_updates: u64,
}

#[derive(Default)]
pub struct SynchronizedCache {
    pub cache: RwLock<Cache>,
}

impl SynchronizedCache {
    pub fn new(max_entries: usize) -> SynchronizedCache {
        SynchronizedCache {
            cache: RwLock::new(Cache::new(max_entries)),
        }
    }

    pub fn get_stats(&self) -> Result<CacheStats> {
        let cache = self.cache.read().map_err(|_| CacheError::PoisonedLock)?;

        Ok(CacheStats {
            total_entries: cache.domain_entries.len(),
            total_hits: cache.domain_entries.values().map(|x| x.hits as u64).sum(),
            total_updates: cache
                .domain_entries
                .values()
                .map(|x| x.updates as u64)
                .sum(),
        })
    }

    pub fn list(&self) -> Result<Vec<DomainEntry>> {
        let cache = self.cache.read().map_err(|_| CacheError::PoisonedLock)?;

        Ok(cache.domain_entries.values().cloned().collect())
    }

    pub fn lookup(&self, qname: &str, qtype: QueryType) -> Option<DnsPacket> {
        self.lookup_at(qname, qtype, Local::now())
    }

    pub fn lookup_at(
        &self,
        qname: &str,
        qtype: QueryType,
        now: DateTime<Local>,
    ) -> Option<DnsPacket> {
        let mut cache = match self.cache.write() {
            Ok(x) => x,
            Err(_) => return None,
        };

        cache.lookup_at(qname, qtype, now)
    }

    /// Stores a batch of records under a single lock acquisition.
    pub fn store(&self, records: &[DnsRecord]) -> Result<()> {
        self.store_at(records, Local::now())
    }

    pub fn store_at(&self, records: &[DnsRecord], now: DateTime<Local>) -> Result<()> {
        let mut cache = self.cache.write().map_err(|_| CacheError::PoisonedLock)?;

        cache.store_at(records, now);

        Ok(())
    }

    pub fn store_nxdomain(&self, qname: &str, qtype: QueryType, ttl: u32) -> Result<()> {
        let mut cache = self.cache.write().map_err(|_| CacheError::PoisonedLock)?;

        cache.store_nxdomain(qname, qtype, ttl);

        Ok(())
    }

    pub fn purge_expired(&self) -> Result<usize> {
        let mut cache = self.cache.write().map_err(|_| CacheError::PoisonedLock)?;

        Ok(cache.purge_expired_at(Local::now()))
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::dns::protocol::{DnsRecord, QueryType, ResultCode, TransientTtl};

    fn a_record(domain: &str, addr: &str, ttl: u32) -> DnsRecord {
        DnsRecord::A {
            domain: domain.to_string(),
            addr: addr.parse().unwrap(),
            ttl: TransientTtl(ttl),
        }
    }

    #[test]
    fn test_cache() {
        let mut cache = Cache::default();

        // Verify that no data is returned when nothing is present
        if cache.lookup("www.google.com", QueryType::A).is_some() {
            panic!()
        }

        // Register a negative cache entry
        cache.store_nxdomain("www.google.com", QueryType::A, 3600);

        // Verify that we get a response, with the NXDOMAIN flag set
        if let Some(packet) = cache.lookup("www.google.com", QueryType::A) {
            assert_eq!(ResultCode::NXDOMAIN, packet.header.rescode);
        } else {
            panic!();
        }

        // Register a negative cache entry with no TTL
        cache.store_nxdomain("www.yahoo.com", QueryType::A, 0);

        // And check that no such result is actually returned, since it's expired
        if cache.lookup("www.yahoo.com", QueryType::A).is_some() {
            panic!()
        }

        // Now add some actual records
        let records = vec![
            a_record("www.google.com", "127.0.0.1", 3600),
            a_record("www.yahoo.com", "127.0.0.2", 0),
            DnsRecord::Cname {
                domain: "www.microsoft.com".to_string(),
                host: "www.somecdn.com".to_string(),
                ttl: TransientTtl(3600),
            },
        ];

        cache.store(&records);

        // Test for successful lookup
        if let Some(packet) = cache.lookup("www.google.com", QueryType::A) {
            assert_eq!(records[0], packet.answers[0]);
        } else {
            panic!();
        }

        // Test for failed lookup, since no Cname's are known for this domain
        if cache.lookup("www.google.com", QueryType::Cname).is_some() {
            panic!();
        }

        // Check for successful Cname lookup
        if let Some(packet) = cache.lookup("www.microsoft.com", QueryType::Cname) {
            assert_eq!(records[2], packet.answers[0]);
        } else {
            panic!();
        }

        // This lookup should fail, since the record had a 0 second TTL
        if cache.lookup("www.yahoo.com", QueryType::A).is_some() {
            panic!();
        }

        cache.store(&[a_record("www.yahoo.com", "127.0.0.2", 3600)]);

        // And now it should succeed, since the record has been stored
        if cache.lookup("www.yahoo.com", QueryType::A).is_none() {
            panic!();
        }

        // Check stat counter behavior
        assert_eq!(3, cache.len());
        let google = cache.domain_entries.get("www.google.com").unwrap();
        assert_eq!(2, google.hits);
        assert_eq!(2, google.updates);
        let yahoo = cache.domain_entries.get("www.yahoo.com").unwrap();
        assert_eq!(1, yahoo.hits);
        assert_eq!(1, yahoo.updates);
    }

    #[test]
    fn test_ttl_counts_down_and_expires() {
        let mut cache = Cache::default();
        let start = Local::now();

        cache.store_at(&[a_record("ttl.example.com", "10.0.0.1", 5)], start);

        let first = cache
            .lookup_at("ttl.example.com", QueryType::A, start)
            .unwrap();
        assert_eq!(5, first.answers[0].get_ttl());

        let second = cache
            .lookup_at("ttl.example.com", QueryType::A, start + Duration::seconds(1))
            .unwrap();
        assert!(second.answers[0].get_ttl() < first.answers[0].get_ttl());
        assert_eq!(4, second.answers[0].get_ttl());

        // Rounded up while a fraction of a second remains
        let late = cache
            .lookup_at(
                "ttl.example.com",
                QueryType::A,
                start + Duration::milliseconds(4500),
            )
            .unwrap();
        assert_eq!(1, late.answers[0].get_ttl());

        assert!(cache
            .lookup_at("ttl.example.com", QueryType::A, start + Duration::seconds(5))
            .is_none());

        // The expired entry was purged by the lookup
        assert!(cache.is_empty());
    }

    #[test]
    fn test_records_accumulate() {
        let mut cache = Cache::default();
        let now = Local::now();

        cache.store_at(&[a_record("rr.example.com", "10.0.0.1", 60)], now);
        cache.store_at(&[a_record("rr.example.com", "10.0.0.2", 60)], now);
        cache.store_at(&[a_record("RR.example.com.", "10.0.0.3", 60)], now);

        let packet = cache.lookup_at("rr.example.com", QueryType::A, now).unwrap();
        assert_eq!(3, packet.answers.len());

        // Storing the same rdata again refreshes instead of duplicating
        let later = now + Duration::seconds(30);
        cache.store_at(&[a_record("rr.example.com", "10.0.0.1", 60)], later);

        let packet = cache
            .lookup_at("rr.example.com", QueryType::A, later)
            .unwrap();
        assert_eq!(3, packet.answers.len());
        assert_eq!(60, packet.answers[0].get_ttl());
        assert_eq!(30, packet.answers[1].get_ttl());
    }

    #[test]
    fn test_entries_expire_independently() {
        let mut cache = Cache::default();
        let now = Local::now();

        cache.store_at(
            &[
                a_record("mix.example.com", "10.0.0.1", 10),
                a_record("mix.example.com", "10.0.0.2", 100),
            ],
            now,
        );

        let packet = cache
            .lookup_at("mix.example.com", QueryType::A, now + Duration::seconds(20))
            .unwrap();
        assert_eq!(1, packet.answers.len());
        assert_eq!(80, packet.answers[0].get_ttl());
    }

    #[test]
    fn test_size_limit_evicts_least_used() {
        let mut cache = Cache::new(2);
        let now = Local::now();

        cache.store_at(&[a_record("a.example.com", "10.0.0.1", 60)], now);
        cache.store_at(&[a_record("b.example.com", "10.0.0.2", 60)], now);
        cache.lookup_at("a.example.com", QueryType::A, now);

        cache.store_at(&[a_record("c.example.com", "10.0.0.3", 60)], now);

        assert_eq!(2, cache.len());
        assert!(cache.lookup_at("a.example.com", QueryType::A, now).is_some());
        assert!(cache.lookup_at("b.example.com", QueryType::A, now).is_none());
    }

    #[test]
    fn test_synchronized_cache_purge() {
        let cache = SynchronizedCache::new(100);
        let past = Local::now() - Duration::seconds(120);

        cache
            .store_at(&[a_record("old.example.com", "10.0.0.1", 60)], past)
            .unwrap();
        cache
            .store(&[a_record("new.example.com", "10.0.0.2", 60)])
            .unwrap();

        assert_eq!(1, cache.purge_expired().unwrap());
        assert_eq!(1, cache.get_stats().unwrap().total_entries);
    }
}
