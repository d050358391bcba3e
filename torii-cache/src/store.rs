//! The cache index: primary fingerprint map, tag index, approximate-LRU
//! eviction and the byte budget, all behind one lock.

use crate::entry::{
    compute_ttl, response_storable, vary_names, StoredResponse,
};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::flight::{FlightRole, SingleFlight};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use torii_http::{HeaderMap, Method, Response};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_bytes: u64,
    pub max_entries: usize,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            max_entries: 10_000,
            default_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Request identity used to derive fingerprints.
#[derive(Debug, Clone, Copy)]
pub struct CacheKey<'a> {
    pub method: Method,
    pub scheme: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
}

struct Entry {
    response: Arc<StoredResponse>,
    path: String,
    tags: Vec<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    stored_at: Instant,
    expires_at: Instant,
    last_accessed: Instant,
    hit_count: u64,
    size: u64,
}

#[derive(Default)]
struct Index {
    entries: HashMap<Fingerprint, Entry>,
    /// `vary` header names recorded per base fingerprint, so a later
    /// request can fold the right values into its full fingerprint.
    vary_names: HashMap<Fingerprint, Vec<String>>,
    tags: HashMap<String, HashSet<Fingerprint>>,
    total_bytes: u64,
    evictions: u64,
}

#[derive(Debug)]
pub enum Lookup {
    Fresh {
        response: Arc<StoredResponse>,
        age_secs: u64,
    },
    /// Present but past `expires_at`: revalidate with these validators.
    Stale {
        etag: Option<String>,
        last_modified: Option<String>,
    },
    Miss,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored { evicted: usize },
    NotStorable,
    TooLarge,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub evictions: u64,
}

pub struct HttpCache {
    index: Mutex<Index>,
    flight: SingleFlight,
    settings: CacheSettings,
}

impl HttpCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            index: Mutex::new(Index::default()),
            flight: SingleFlight::new(),
            settings,
        }
    }

    /// Full fingerprint for a request: the base identity plus the values
    /// of whatever `vary` names a previous response recorded for it.
    pub fn fingerprint_for(&self, key: &CacheKey<'_>, req_headers: &HeaderMap) -> Fingerprint {
        let base = base_fingerprint(key);
        let index = self.index.lock().unwrap();
        match index.vary_names.get(&base) {
            Some(names) if !names.is_empty() => {
                let vary = collect_vary(names, req_headers);
                fingerprint(key.method, key.scheme, key.host, key.path, key.query, &vary)
            }
            _ => base,
        }
    }

    pub fn lookup(&self, fp: Fingerprint, now: Instant) -> Lookup {
        let mut index = self.index.lock().unwrap();
        let Some(entry) = index.entries.get_mut(&fp) else {
            return Lookup::Miss;
        };
        if now < entry.expires_at {
            entry.last_accessed = now;
            entry.hit_count += 1;
            Lookup::Fresh {
                response: Arc::clone(&entry.response),
                age_secs: now.duration_since(entry.stored_at).as_secs(),
            }
        } else {
            Lookup::Stale {
                etag: entry.etag.clone(),
                last_modified: entry.last_modified.clone(),
            }
        }
    }

    /// Join the single-flight for a miss on `fp`.
    pub fn begin_fetch(&self, fp: Fingerprint) -> FlightRole {
        self.flight.begin(fp)
    }

    /// Store a response if its headers allow it. Evicts oldest-accessed
    /// entries until the byte and entry budgets hold; the budgets are
    /// restored before this returns.
    pub fn try_insert(
        &self,
        key: &CacheKey<'_>,
        req_headers: &HeaderMap,
        resp: &Response,
        tags: Vec<String>,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> InsertOutcome {
        if !response_storable(&resp.headers) {
            return InsertOutcome::NotStorable;
        }
        let snapshot = Arc::new(StoredResponse::snapshot(resp));
        let size = snapshot.size_bytes();
        if size > self.settings.max_bytes {
            return InsertOutcome::TooLarge;
        }
        let ttl = compute_ttl(
            &resp.headers,
            self.settings.default_ttl,
            self.settings.max_ttl,
            wall_now,
        );

        let names = vary_names(&resp.headers);
        let base = base_fingerprint(key);
        let fp = if names.is_empty() {
            base
        } else {
            let vary = collect_vary(&names, req_headers);
            fingerprint(key.method, key.scheme, key.host, key.path, key.query, &vary)
        };

        let entry = Entry {
            etag: resp.headers.get("etag").map(str::to_string),
            last_modified: resp.headers.get("last-modified").map(str::to_string),
            response: snapshot,
            path: key.path.to_string(),
            tags: tags.clone(),
            stored_at: now,
            expires_at: now + ttl,
            last_accessed: now,
            hit_count: 0,
            size,
        };

        let mut index = self.index.lock().unwrap();
        if names.is_empty() {
            index.vary_names.remove(&base);
        } else {
            index.vary_names.insert(base, names);
        }
        remove_entry(&mut index, fp);
        let evicted = evict_until_fits(&mut index, size, &self.settings);
        for tag in &tags {
            index.tags.entry(tag.clone()).or_default().insert(fp);
        }
        index.total_bytes += size;
        index.entries.insert(fp, entry);
        debug_assert_invariants(&index);
        InsertOutcome::Stored { evicted }
    }

    /// Refresh a stale entry after a 304: stamp new freshness metadata and
    /// return the stored body for serving. The previous TTL is the
    /// fallback when the 304 carries no freshness headers.
    pub fn refresh(
        &self,
        fp: Fingerprint,
        headers_304: &HeaderMap,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> Option<Arc<StoredResponse>> {
        let mut index = self.index.lock().unwrap();
        let entry = index.entries.get_mut(&fp)?;
        let previous_ttl = entry.expires_at.duration_since(entry.stored_at);
        let ttl = compute_ttl(headers_304, previous_ttl, self.settings.max_ttl, wall_now);
        entry.stored_at = now;
        entry.expires_at = now + ttl;
        entry.last_accessed = now;
        entry.hit_count += 1;
        if let Some(etag) = headers_304.get("etag") {
            entry.etag = Some(etag.to_string());
        }
        Some(Arc::clone(&entry.response))
    }

    // ── invalidation ─────────────────────────────────────────────

    pub fn invalidate(&self, fp: Fingerprint) -> bool {
        let mut index = self.index.lock().unwrap();
        let removed = remove_entry(&mut index, fp);
        debug_assert_invariants(&index);
        removed
    }

    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let mut index = self.index.lock().unwrap();
        let fps: Vec<Fingerprint> = index
            .tags
            .get(tag)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let mut removed = 0;
        for fp in fps {
            if remove_entry(&mut index, fp) {
                removed += 1;
            }
        }
        debug_assert_invariants(&index);
        debug!(tag = %tag, removed, "Cache tag invalidated");
        removed
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut index = self.index.lock().unwrap();
        let fps: Vec<Fingerprint> = index
            .entries
            .iter()
            .filter(|(_, e)| e.path.starts_with(prefix))
            .map(|(fp, _)| *fp)
            .collect();
        let mut removed = 0;
        for fp in fps {
            if remove_entry(&mut index, fp) {
                removed += 1;
            }
        }
        debug_assert_invariants(&index);
        removed
    }

    /// Drop entries past their TTL. Run periodically by the background
    /// sweeper.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut index = self.index.lock().unwrap();
        let expired: Vec<Fingerprint> = index
            .entries
            .iter()
            .filter(|(_, e)| now >= e.expires_at)
            .map(|(fp, _)| *fp)
            .collect();
        let mut removed = 0;
        for fp in expired {
            if remove_entry(&mut index, fp) {
                removed += 1;
            }
        }
        debug_assert_invariants(&index);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.index.lock().unwrap();
        CacheStats {
            entries: index.entries.len(),
            total_bytes: index.total_bytes,
            evictions: index.evictions,
        }
    }
}

fn base_fingerprint(key: &CacheKey<'_>) -> Fingerprint {
    fingerprint(key.method, key.scheme, key.host, key.path, key.query, &[])
}

fn collect_vary(names: &[String], req_headers: &HeaderMap) -> Vec<(String, String)> {
    names
        .iter()
        .map(|n| (n.clone(), req_headers.get(n).unwrap_or("").to_string()))
        .collect()
}

fn remove_entry(index: &mut Index, fp: Fingerprint) -> bool {
    let Some(entry) = index.entries.remove(&fp) else {
        return false;
    };
    index.total_bytes -= entry.size;
    for tag in &entry.tags {
        if let Some(set) = index.tags.get_mut(tag) {
            set.remove(&fp);
            if set.is_empty() {
                index.tags.remove(tag);
            }
        }
    }
    true
}

/// Evict oldest-accessed entries until `incoming` fits both budgets.
fn evict_until_fits(index: &mut Index, incoming: u64, settings: &CacheSettings) -> usize {
    let mut evicted = 0;
    while !index.entries.is_empty()
        && (index.total_bytes + incoming > settings.max_bytes
            || index.entries.len() + 1 > settings.max_entries)
    {
        let oldest = index
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(fp, _)| *fp);
        match oldest {
            Some(fp) => {
                remove_entry(index, fp);
                index.evictions += 1;
                evicted += 1;
            }
            None => break,
        }
    }
    evicted
}

#[cfg(debug_assertions)]
fn debug_assert_invariants(index: &Index) {
    let sum: u64 = index.entries.values().map(|e| e.size).sum();
    debug_assert_eq!(sum, index.total_bytes);
    for (tag, fps) in &index.tags {
        for fp in fps {
            debug_assert!(index.entries.contains_key(fp), "dangling tag {tag}");
        }
    }
}

#[cfg(not(debug_assertions))]
fn debug_assert_invariants(_index: &Index) {}
