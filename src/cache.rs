use crate::cache::CacheResponse::{Authoritative, Referral};
use crate::target::get_name_if_ns;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// A TTL-aware LRU cache, safe for concurrent access from many resolver
/// workers behind a single exclusive lock (§4.2, §5).
#[derive(Debug)]
pub(crate) struct Cache<K: Hash + Eq, V> {
    lru: Mutex<LruCache<K, ValueWithTtl<V>>>,
}

struct ValueWithTtl<V> {
    value: V,
    valid_before: Instant,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Debug + Clone + Send + 'static,
    V: Clone + Debug + Send + 'static,
{
    pub(crate) fn new(capacity: NonZeroUsize) -> Cache<K, V> {
        Cache { lru: Mutex::new(LruCache::new(capacity)) }
    }

    #[instrument(name = "cache-store", skip(self))]
    pub(crate) fn store_with_ttl(&self, key: K, value: V, valid_before: Instant) {
        self.lru.lock().unwrap().put(key, ValueWithTtl { value, valid_before });
    }

    #[instrument(name = "cache-get", skip(self), fields(hit = false, expired = false))]
    pub(crate) fn get_with_remaining_ttl(&self, key: &K, now: Instant) -> Option<(V, Duration)> {
        let mut guard = self.lru.lock().unwrap();
        let span = tracing::Span::current();
        let with_ttl = guard.get(key)?;
        if with_ttl.valid_before < now {
            // the value has expired; lazy-expire it on read regardless of
            // whether the background sweeper has gotten to it yet.
            guard.pop(key);
            span.record("expired", true);
            None
        } else {
            span.record("hit", true);
            Some((with_ttl.value.clone(), with_ttl.valid_before - now))
        }
    }

    /// Drops every entry whose expiry has already passed. Correctness does
    /// not depend on this running (`get` lazily expires on read); it exists
    /// to reclaim memory for keys nobody has looked up since they expired.
    fn sweep(&self, now: Instant) {
        let mut guard = self.lru.lock().unwrap();
        let expired: Vec<K> =
            guard.iter().filter(|(_, v)| v.valid_before <= now).map(|(k, _)| k.clone()).collect();
        for key in &expired {
            guard.pop(key);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired cache entries");
        }
    }

    /// Spawns the background sweeper as a detached task, ticking once per
    /// `interval`. The caller owns the returned handle and is expected to
    /// abort it when the cache itself is dropped.
    pub(crate) fn spawn_sweeper(self: std::sync::Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                self.sweep(Instant::now());
            }
        })
    }
}

pub(crate) type DnsCache = Cache<Query, Vec<Record>>;

#[derive(Debug, Hash, Eq, PartialEq, Clone)]
pub(crate) struct Query {
    pub to_resolve: Name,
    pub record_type: RecordType,
}

#[derive(Debug, PartialEq)]
pub(crate) enum CacheResponse {
    Authoritative(Vec<Record>),
    Referral(Vec<Record>, Vec<Record>),
    None,
}

/// Convenience methods specific to a cache holding DNS record sets.
impl DnsCache {
    /// Inserts `value` into the existing set for `key`, per §4.2's `set`
    /// contract: insert-or-ignore by record identity, merged into whatever
    /// is already cached rather than replacing it. A record already present
    /// (same rdata — the generalization of the original's "same IP" check
    /// to record types that aren't A records) is skipped; everything else
    /// is appended. The stored expiry is the minimum TTL across the merged
    /// set (the set's expiry tracks its shortest-lived member), computed
    /// from whichever of the existing entry (if still live) and this call's
    /// batch is sooner. A batch whose own minimum TTL is zero is not cached
    /// at all.
    pub(crate) fn store(&self, query: Query, value: Vec<Record>, now: Instant) {
        let min_ttl = value.iter().map(Record::ttl).min().unwrap_or(0);
        if min_ttl == 0 {
            return;
        }
        let proposed_valid_before = now + Duration::from_secs(min_ttl as u64);

        let mut guard = self.lru.lock().unwrap();
        let (mut merged, valid_before) = match guard.peek(&query) {
            Some(existing) if existing.valid_before > now => {
                (existing.value.clone(), existing.valid_before.min(proposed_valid_before))
            }
            _ => (Vec::new(), proposed_valid_before),
        };
        for record in value {
            if !merged.iter().any(|r: &Record| r.data() == record.data()) {
                merged.push(record);
            }
        }
        guard.put(query, ValueWithTtl { value: merged, valid_before });
    }

    /// Stores a referral's NS and glue records under their own keys (the
    /// delegated zone name + type NS, and each nameserver name + type A)
    /// rather than under the query that triggered the referral. Refuses to
    /// cache anything if the referral looks out-of-zone or the glue doesn't
    /// correspond to any NS name in it (§4.2 supplement).
    pub(crate) fn store_referral(
        &self,
        name_servers: Vec<Record>,
        glue: Vec<Record>,
        to_resolve: &Name,
        now: Instant,
    ) {
        if !eligible(&name_servers, &glue, to_resolve) {
            return;
        }
        for (query, records) in make_referral_query(&name_servers) {
            self.store(query, records, now)
        }
        for (query, records) in make_referral_query(&glue) {
            self.store(query, records, now)
        }
    }

    fn get_and_update_ttl(&self, query: &Query, now: Instant) -> Option<Vec<Record>> {
        self.get_with_remaining_ttl(query, now).map(update_ttl)
    }

    /// Looks for an exact hit first; on miss, walks up the name's ancestor
    /// zones for a cached delegation, so a warm cache can resume the walk
    /// from the last known referral instead of the root (§4.3 supplement).
    pub(crate) fn get_best_record(&self, query: &Query, now: Instant) -> CacheResponse {
        if let Some(records) = self.get_and_update_ttl(query, now) {
            return Authoritative(records);
        }
        for parent in parents(&query.to_resolve) {
            let q = Query { to_resolve: parent, record_type: RecordType::NS };
            if let Some(records) = self.get_and_update_ttl(&q, now) {
                return Referral(records.clone(), self.fetch_glue(&records, now));
            }
        }
        CacheResponse::None
    }

    fn fetch_glue(&self, name_servers: &[Record], now: Instant) -> Vec<Record> {
        let mut result = Vec::with_capacity(name_servers.len());
        for ns in name_servers {
            if let Some(Ok(name)) = get_name_if_ns(ns) {
                let query = Query { to_resolve: name.clone(), record_type: RecordType::A };
                if let Some(records) = self.get_and_update_ttl(&query, now) {
                    result.extend(records);
                }
            } else {
                warn!(%ns, "invalid NS record retrieved from cache")
            }
        }
        result
    }
}

/// The strict ancestors of `name`, nearest first (`a.b.com` -> `[b.com,
/// com]`). The root name has no parents.
fn parents(name: &Name) -> Vec<Name> {
    let mut result = Vec::new();
    let mut name = name.base_name();
    while name.num_labels() > 0 {
        let another = name.base_name();
        result.push(name);
        name = another
    }
    result
}

fn make_referral_query(records: &[Record]) -> HashMap<Query, Vec<Record>> {
    let mut result = HashMap::new();
    for record in records {
        let query = Query { to_resolve: record.name().clone(), record_type: record.record_type() };
        result.entry(query).or_insert_with(Vec::new).push(record.clone());
    }
    result
}

/// We can only cache records that are relevant to `to_resolve`. This prevents
/// a malicious or misconfigured upstream from using a referral to poison the
/// cache with unrelated data. We skip all caching if any record is wrong.
fn eligible(name_servers: &[Record], glue: &[Record], to_resolve: &Name) -> bool {
    let mut names = HashSet::new();
    for name_server in name_servers {
        if let Some(RData::NS(ns)) = name_server.data() {
            names.insert(ns.0.to_string());
        }
        if !name_server.name().zone_of(to_resolve) {
            debug!(%to_resolve, %name_server, "received out of zone ns record");
            return false;
        }
    }
    for glue in glue {
        if !names.contains(&glue.name().to_string()) {
            debug!(%glue, "glue record without matching ns");
            return false;
        }
    }
    true
}

/// Returns a copy of the record set with each record's TTL replaced by the
/// remaining duration, so repeat reads see a decreasing TTL.
fn update_ttl(item: (Vec<Record>, Duration)) -> Vec<Record> {
    item.0
        .iter()
        .map(|r| {
            let mut r = r.clone();
            r.set_ttl(item.1.as_secs() as u32);
            r
        })
        .collect()
}
