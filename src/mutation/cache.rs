//! Bounded LRU cache of trial results.
//!
//! Keyed by the source file's content hash and the mutation signature, so a
//! trial is skipped only when neither the file nor the mutant changed.

use super::MutationResult;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKey {
    pub content_hash: String,
    pub signature: String,
}

impl CacheKey {
    pub fn new(content_hash: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash.into(),
            signature: signature.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, (u64, MutationResult)>,
    /// Access tick -> key, oldest first
    order: BTreeMap<u64, CacheKey>,
    tick: u64,
    stats: CacheStats,
}

impl Inner {
    fn touch(&mut self, key: &CacheKey) -> Option<MutationResult> {
        self.tick += 1;
        let tick = self.tick;
        let (old_tick, result) = self.entries.get_mut(key)?;
        self.order.remove(old_tick);
        *old_tick = tick;
        self.order.insert(tick, key.clone());
        Some(result.clone())
    }

    fn insert(&mut self, key: CacheKey, result: MutationResult, capacity: usize) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((old_tick, _)) = self.entries.insert(key.clone(), (tick, result)) {
            self.order.remove(&old_tick);
        }
        self.order.insert(tick, key);

        while self.entries.len() > capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            self.stats.evictions += 1;
        }
    }
}

/// Thread-safe LRU map from [`CacheKey`] to [`MutationResult`].
///
/// Lookups, insertions and evictions all happen under one lock.
pub struct ResultCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    version: u32,
    /// Least recently used first
    entries: Vec<SnapshotEntry>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotEntry {
    #[serde(flatten)]
    key: CacheKey,
    result: MutationResult,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Look up a result, marking it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<MutationResult> {
        let mut inner = self.lock();
        let found = inner.touch(key);
        if found.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        found
    }

    pub fn insert(&self, key: CacheKey, result: MutationResult) {
        let capacity = self.capacity;
        self.lock().insert(key, result, capacity);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }

    /// Load a snapshot written by [`ResultCache::save`].
    ///
    /// A missing file yields an empty cache. A corrupt or foreign snapshot is
    /// discarded with a warning; it only costs re-running trials.
    pub fn load(path: &Path, capacity: usize) -> Result<Self> {
        let cache = Self::new(capacity);
        if !path.exists() {
            return Ok(cache);
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache snapshot {}", path.display()))?;
        let snapshot: Snapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Ignoring unreadable cache snapshot {}: {}", path.display(), e);
                return Ok(cache);
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                "Ignoring cache snapshot {} with version {}",
                path.display(),
                snapshot.version
            );
            return Ok(cache);
        }

        {
            let mut inner = cache.lock();
            for entry in snapshot.entries {
                inner.insert(entry.key, entry.result, cache.capacity);
            }
            inner.stats = CacheStats::default();
        }

        if !cache.is_empty() {
            tracing::info!("Loaded {} cached trial results from {}", cache.len(), path.display());
        }
        Ok(cache)
    }

    /// Write the cache to `path` atomically, least recently used first.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let inner = self.lock();
            let entries = inner
                .order
                .values()
                .filter_map(|key| {
                    inner.entries.get(key).map(|(_, result)| SnapshotEntry {
                        key: key.clone(),
                        result: result.clone(),
                    })
                })
                .collect();
            Snapshot {
                version: SNAPSHOT_VERSION,
                entries,
            }
        };

        let json = serde_json::to_vec(&snapshot).context("Failed to serialize cache")?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&json)?;
        temp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to write cache snapshot {}", path.display()))?;

        tracing::debug!("Saved {} cached trial results to {}", snapshot.entries.len(), path.display());
        Ok(())
    }
}
