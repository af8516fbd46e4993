//! Request deduplication cache
//!
//! Several capture points (middleware, handler, service) may observe the same
//! request. The cache fingerprints a normalized request tuple and remembers it
//! for a bounded TTL so only the first capture point produces an audit write.
//!
//! The map is process-local and guarded by a single mutex that is never held
//! across an await point. Expired entries are ignored on lookup and removed by
//! [`RequestDeduplicator::sweep`], which the pipeline runs periodically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::event::AuditEvent;
use crate::config::DedupConfig;

/// Normalized identity of an incoming request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
    pub user_id: Option<String>,
    pub ip: Option<String>,
    /// When the request was observed; bucketed to the second
    pub timestamp: DateTime<Utc>,
}

impl RequestKey {
    pub fn new(method: impl Into<String>, url: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            user_id: None,
            ip: None,
            timestamp,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Key for an event carrying a request context with method and endpoint
    pub fn from_event(event: &AuditEvent) -> Option<Self> {
        let context = event.context.as_ref()?;
        let method = context.method.as_ref()?;
        let url = context.endpoint.as_ref()?;
        Some(Self {
            method: method.clone(),
            url: url.clone(),
            user_id: event.user_id.clone(),
            ip: context.ip.clone(),
            timestamp: event.timestamp,
        })
    }

    /// BLAKE3 over `method|path|user|ip|second`
    ///
    /// The query string and fragment are stripped from the URL, a missing
    /// user becomes `anonymous` and a missing IP becomes `unknown`.
    pub fn fingerprint(&self) -> Fingerprint {
        let path = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let material = format!(
            "{}|{}|{}|{}|{}",
            self.method.to_uppercase(),
            path,
            self.user_id.as_deref().unwrap_or("anonymous"),
            self.ip.as_deref().unwrap_or("unknown"),
            self.timestamp.timestamp(),
        );
        Fingerprint(blake3::hash(material.as_bytes()).to_hex().to_string())
    }
}

/// 64-character hex digest identifying a request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remembered request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeduplicationEntry {
    pub fingerprint: Fingerprint,
    pub first_seen_at: DateTime<Utc>,
    pub processed: bool,
}

#[derive(Debug)]
struct CachedEntry {
    entry: DeduplicationEntry,
    expires_at: Instant,
}

/// Bounded-TTL fingerprint cache
#[derive(Debug)]
pub struct RequestDeduplicator {
    entries: Mutex<HashMap<Fingerprint, CachedEntry>>,
    ttl: Duration,
}

impl RequestDeduplicator {
    /// Create a cache keeping entries for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.ttl())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, CachedEntry>> {
        // A panic while holding the lock cannot leave the map inconsistent
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether this request was already processed and has not expired
    pub fn is_duplicate(&self, key: &RequestKey) -> bool {
        let fingerprint = key.fingerprint();
        let now = Instant::now();
        self.lock()
            .get(&fingerprint)
            .is_some_and(|cached| cached.expires_at > now && cached.entry.processed)
    }

    /// Remember the request as processed, returning its fingerprint
    pub fn mark_processed(&self, key: &RequestKey) -> Fingerprint {
        let fingerprint = key.fingerprint();
        let cached = self.fresh_entry(&fingerprint);
        self.lock().insert(fingerprint.clone(), cached);
        fingerprint
    }

    /// Atomically check and mark
    ///
    /// Returns the fingerprint for a first sighting and `None` for a duplicate.
    pub fn check_and_mark(&self, key: &RequestKey) -> Option<Fingerprint> {
        let fingerprint = key.fingerprint();
        let now = Instant::now();
        let mut entries = self.lock();

        if entries
            .get(&fingerprint)
            .is_some_and(|cached| cached.expires_at > now && cached.entry.processed)
        {
            return None;
        }

        entries.insert(fingerprint.clone(), self.fresh_entry(&fingerprint));
        Some(fingerprint)
    }

    /// Current entry for a request, if live
    pub fn entry(&self, key: &RequestKey) -> Option<DeduplicationEntry> {
        let fingerprint = key.fingerprint();
        let now = Instant::now();
        self.lock()
            .get(&fingerprint)
            .filter(|cached| cached.expires_at > now)
            .map(|cached| cached.entry.clone())
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, cached| cached.expires_at > now);
        before - entries.len()
    }

    /// Sweep every `interval` until the surrounding task is cancelled
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = self.sweep();
            if removed > 0 {
                tracing::debug!(removed, remaining = self.len(), "Swept expired dedup entries");
            }
        }
    }

    fn fresh_entry(&self, fingerprint: &Fingerprint) -> CachedEntry {
        CachedEntry {
            entry: DeduplicationEntry {
                fingerprint: fingerprint.clone(),
                first_seen_at: Utc::now(),
                processed: true,
            },
            expires_at: Instant::now() + self.ttl,
        }
    }
}

impl Default for RequestDeduplicator {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}
