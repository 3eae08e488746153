//! Response cache keyed by execution fingerprint.
//!
//! A fingerprint hashes everything that determines an agent's output: stage
//! identity, agent role, model configuration, the project description, and
//! all upstream artifacts. Attempt counters, state versions, and timestamps
//! are deliberately excluded, so retries and unchanged re-runs hit the cache.
//!
//! Eviction is LRU by capacity; entries past the TTL are treated as absent
//! and dropped on lookup.

use lru::LruCache;
use sha2::{Digest, Sha256};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::agent::StageContext;
use crate::artifact::ArtifactSet;
use crate::pipeline::CacheConfig;
use crate::utils::canonical::to_canonical_string;

/// SHA-256 digest of a stage execution's inputs, hex-encoded.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint for one stage execution context.
    #[must_use]
    pub fn of(ctx: &StageContext) -> Self {
        let keyed = serde_json::json!({
            "stage": ctx.stage.encode(),
            "agent_role": ctx.agent_role,
            "model_config": ctx.model_config,
            "inputs": ctx.fingerprint_payload(),
        });
        let mut hasher = Sha256::new();
        hasher.update(to_canonical_string(&keyed).as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form; the full digest is noise in logs.
        write!(f, "Fingerprint({}..)", &self.0[..12.min(self.0.len())])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Entry {
    artifacts: ArtifactSet,
    stored_at: Instant,
    hits: u64,
}

/// Cache statistics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// LRU + TTL cache of agent responses.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
}

struct CacheInner {
    entries: LruCache<Fingerprint, Entry>,
    hits: u64,
    misses: u64,
}

impl ResponseCache {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(config.capacity),
                hits: 0,
                misses: 0,
            }),
            ttl: config.ttl,
        }
    }

    /// Capacity-1 cache with zero TTL; everything misses. Placeholder used
    /// when caching is disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(&CacheConfig {
            capacity: NonZeroUsize::MIN,
            ttl: Duration::ZERO,
        })
    }

    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<ArtifactSet> {
        let mut inner = self.lock();
        let expired = matches!(
            inner.entries.peek(fingerprint),
            Some(entry) if entry.stored_at.elapsed() >= self.ttl
        );
        if expired {
            // Evict eagerly rather than waiting for LRU pressure.
            inner.entries.pop(fingerprint);
        }
        let fresh = inner.entries.get_mut(fingerprint).map(|entry| {
            entry.hits += 1;
            entry.artifacts.clone()
        });
        match fresh {
            Some(artifacts) => {
                inner.hits += 1;
                debug!(%fingerprint, "cache hit");
                Some(artifacts)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, fingerprint: Fingerprint, artifacts: ArtifactSet) {
        if self.ttl.is_zero() {
            return;
        }
        let mut inner = self.lock();
        inner.entries.put(
            fingerprint,
            Entry {
                artifacts,
                stored_at: Instant::now(),
                hits: 0,
            },
        );
    }

    /// Times the entry has been served, if it is present.
    #[must_use]
    pub fn entry_hits(&self, fingerprint: &Fingerprint) -> Option<u64> {
        let inner = self.lock();
        inner.entries.peek(fingerprint).map(|entry| entry.hits)
    }

    /// Fingerprints currently cached, most recently used first.
    #[must_use]
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        let inner = self.lock();
        inner.entries.iter().map(|(f, _)| f.clone()).collect()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ProjectHeader;
    use crate::artifact::Artifact;
    use crate::stage::StageId;
    use rustc_hash::FxHashMap;
    use serde_json::json;

    fn ctx(description: &str) -> StageContext {
        StageContext {
            stage: StageId::architecture(),
            agent_role: "architect".into(),
            attempt: 1,
            project: ProjectHeader {
                project_id: "p".into(),
                name: "demo".into(),
                description: description.into(),
                version: 0,
            },
            upstream: FxHashMap::default(),
            feedback: Vec::new(),
            model_config: json!({"model": "m"}),
        }
    }

    #[test]
    fn fingerprint_tracks_inputs_only() {
        let mut a = ctx("build a site");
        let b = ctx("build a site");
        let c = ctx("build an app");
        a.attempt = 9;
        a.project.version = 42;

        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
        assert_ne!(Fingerprint::of(&b), Fingerprint::of(&c));

        let mut d = ctx("build a site");
        d.model_config = json!({"model": "other"});
        assert_ne!(Fingerprint::of(&b), Fingerprint::of(&d));
    }

    #[test]
    fn hit_after_put_and_lru_eviction() {
        let cache = ResponseCache::new(&CacheConfig {
            capacity: NonZeroUsize::new(2).unwrap(),
            ttl: Duration::from_secs(60),
        });
        let f1 = Fingerprint::of(&ctx("one"));
        let f2 = Fingerprint::of(&ctx("two"));
        let f3 = Fingerprint::of(&ctx("three"));

        cache.put(f1.clone(), ArtifactSet::new().with(Artifact::new("a", json!(1))));
        cache.put(f2.clone(), ArtifactSet::new());
        assert!(cache.get(&f1).is_some());

        // f2 is now least recently used; inserting f3 evicts it.
        cache.put(f3.clone(), ArtifactSet::new());
        assert!(cache.get(&f2).is_none());
        assert!(cache.get(&f3).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 2);
        assert_eq!(cache.entry_hits(&f1), Some(1));
        assert_eq!(cache.entry_hits(&f3), Some(1));
        assert_eq!(cache.entry_hits(&f2), None);
        assert_eq!(cache.fingerprints().len(), 2);
    }

    #[test]
    fn zero_ttl_never_hits() {
        let cache = ResponseCache::disabled();
        let f = Fingerprint::of(&ctx("x"));
        cache.put(f.clone(), ArtifactSet::new());
        assert!(cache.get(&f).is_none());
    }
}
