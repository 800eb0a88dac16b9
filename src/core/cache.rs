use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::core::error::CacheError;
use crate::core::models::RawResultSet;
use crate::core::query::SlotId;

pub mod keys {
    use super::SlotId;

    pub const RAW_PREFIX: &str = "raw:";
    pub const PROMETHEUS_OUTPUT: &str = "prometheus:global";
    pub const SELF_METRICS: &str = "internal:self_metrics";

    pub fn raw(slot: &SlotId) -> String {
        format!("{RAW_PREFIX}{slot}")
    }
}

/// Payload stored under a cache key. The key prefix is only a naming
/// convention, readers go through the typed accessors on [`CacheEntry`].
#[derive(Debug, Clone)]
pub enum CacheValue {
    Raw(Arc<RawResultSet>),
    Exposition(Bytes),
}

impl CacheValue {
    fn kind(&self) -> &'static str {
        match self {
            CacheValue::Raw(_) => "raw result set",
            CacheValue::Exposition(_) => "exposition payload",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: CacheValue,
}

impl CacheEntry {
    pub fn as_raw(&self, key: &str) -> Result<&Arc<RawResultSet>, CacheError> {
        match &self.value {
            CacheValue::Raw(set) => Ok(set),
            other => Err(CacheError::TypeMismatch {
                key: key.to_string(),
                expected: "raw result set",
                found: other.kind(),
            }),
        }
    }

    pub fn as_exposition(&self, key: &str) -> Result<&Bytes, CacheError> {
        match &self.value {
            CacheValue::Exposition(bytes) => Ok(bytes),
            other => Err(CacheError::TypeMismatch {
                key: key.to_string(),
                expected: "exposition payload",
                found: other.kind(),
            }),
        }
    }
}

struct CacheInner {
    entries: DashMap<String, CacheEntry>,
    writes: watch::Sender<u64>,
}

/// Concurrent hand-off point between pollers, the converter and the servers.
#[derive(Clone)]
pub struct MetricsCache {
    inner: Arc<CacheInner>,
}

impl MetricsCache {
    pub fn new() -> Self {
        let (writes, _) = watch::channel(0);
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                writes,
            }),
        }
    }

    /// Replaces whatever is stored under `key`.
    pub fn put(&self, key: impl Into<String>, value: CacheValue) {
        let key = key.into();
        tracing::debug!(key = %key, kind = value.kind(), "Writing cache entry");
        self.inner.entries.insert(key, CacheEntry { value });
        self.inner.writes.send_modify(|generation| *generation += 1);
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.inner.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn get_exposition(&self, key: &str) -> Result<Bytes, CacheError> {
        let entry = self
            .get(key)
            .ok_or_else(|| CacheError::Missing(key.to_string()))?;
        entry.as_exposition(key).cloned()
    }

    /// Visits every entry whose key starts with `prefix`. Writes racing with
    /// the iteration may or may not be observed. `f` must not write to the
    /// cache, shard locks are held while it runs.
    pub fn for_each_with_prefix(&self, prefix: &str, mut f: impl FnMut(&str, &CacheEntry)) {
        for entry in self.inner.entries.iter() {
            if entry.key().starts_with(prefix) {
                f(entry.key(), entry.value());
            }
        }
    }

    /// Entries under `prefix`, ordered by key as a string. Callers that need
    /// config order sort by the slot held in the value.
    pub fn snapshot_prefix(&self, prefix: &str) -> Vec<(String, CacheEntry)> {
        let mut entries = Vec::new();
        self.for_each_with_prefix(prefix, |key, entry| {
            entries.push((key.to_string(), entry.clone()));
        });
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Receiver whose value changes after every write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.writes.subscribe()
    }
}

impl Default for MetricsCache {
    fn default() -> Self {
        Self::new()
    }
}
