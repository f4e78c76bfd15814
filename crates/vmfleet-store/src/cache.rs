//! In-memory read-through/write-through cache in front of a `Storage`.
//!
//! Correctness is governed entirely by checksum comparison against the
//! backing storage: no TTLs, no invalidation messages. The index is
//! per-process and unpersisted, so the first list of each kind after a
//! cold start always reloads from the backing storage. There is no
//! eviction; the index grows with the number of distinct UIDs ever seen
//! (VM fleet sizes are assumed small).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use vmfleet_common::{Kind, Object, PartialObject, Result, Uid};

use crate::storage::Storage;

/// A cached object: either the full body or only its lightweight
/// metadata projection, plus the checksum it was observed at.
#[derive(Debug, Clone)]
enum CacheValue {
    Full(Object),
    Meta(PartialObject),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CacheValue,
    checksum: String,
}

type Index = HashMap<Kind, HashMap<Uid, CacheEntry>>;

/// A `Storage` wrapper serving repeat reads from memory. Writes always
/// flush through to the backing storage synchronously.
pub struct Cache {
    storage: Arc<dyn Storage>,
    index: RwLock<Index>,
}

impl Cache {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            index: RwLock::new(Index::new()),
        }
    }

    async fn entry(&self, kind: Kind, uid: &Uid) -> Option<CacheEntry> {
        self.index
            .read()
            .await
            .get(&kind)
            .and_then(|uids| uids.get(uid))
            .cloned()
    }

    async fn insert(&self, kind: Kind, uid: Uid, entry: CacheEntry) {
        self.index
            .write()
            .await
            .entry(kind)
            .or_default()
            .insert(uid, entry);
    }

    async fn remove(&self, kind: Kind, uid: &Uid) {
        if let Some(uids) = self.index.write().await.get_mut(&kind) {
            uids.remove(uid);
        }
    }

    async fn indexed_count(&self, kind: Kind) -> u64 {
        self.index
            .read()
            .await
            .get(&kind)
            .map(|uids| uids.len() as u64)
            .unwrap_or(0)
    }

    async fn indexed_uids(&self, kind: Kind) -> Vec<Uid> {
        self.index
            .read()
            .await
            .get(&kind)
            .map(|uids| uids.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Fetches the full object from the backing storage and replaces the
    /// index entry. A meta-only entry refreshed here is thereby promoted
    /// to a full one.
    async fn refresh_full(&self, kind: Kind, uid: &Uid) -> Result<Object> {
        let obj = self.storage.get(kind, uid).await?;
        let checksum = self.storage.checksum(kind, uid).await.unwrap_or_default();
        self.insert(
            kind,
            uid.clone(),
            CacheEntry {
                value: CacheValue::Full(obj.clone()),
                checksum,
            },
        )
        .await;
        Ok(obj)
    }

    async fn refresh_meta(&self, kind: Kind, uid: &Uid) -> Result<PartialObject> {
        let partial = self.storage.get_meta(kind, uid).await?;
        let checksum = self.storage.checksum(kind, uid).await.unwrap_or_default();
        self.insert(
            kind,
            uid.clone(),
            CacheEntry {
                value: CacheValue::Meta(partial.clone()),
                checksum,
            },
        )
        .await;
        Ok(partial)
    }

    /// Re-persists the entire index through the backing storage.
    /// Expensive; intended for full-rewrite scenarios only. Meta-only
    /// entries are skipped: they hold nothing the storage does not
    /// already have.
    pub async fn flush(&self) -> Result<()> {
        let index = self.index.read().await.clone();
        for uids in index.into_values() {
            for entry in uids.into_values() {
                if let CacheValue::Full(mut obj) = entry.value {
                    self.storage.set(&mut obj).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for Cache {
    async fn get(&self, kind: Kind, uid: &Uid) -> Result<Object> {
        if let Some(entry) = self.entry(kind, uid).await {
            let current = match self.storage.checksum(kind, uid).await {
                Ok(sum) => sum,
                Err(e) => {
                    // The backing object vanished out-of-band; the entry
                    // is dead weight.
                    self.remove(kind, uid).await;
                    return Err(e);
                }
            };
            if current == entry.checksum {
                if let CacheValue::Full(obj) = entry.value {
                    debug!(%kind, %uid, "cache hit");
                    return Ok(obj);
                }
                // Meta-only entry: promote with a full fetch.
            } else {
                debug!(%kind, %uid, "checksum changed, refetching");
            }
        }
        self.refresh_full(kind, uid).await
    }

    async fn get_meta(&self, kind: Kind, uid: &Uid) -> Result<PartialObject> {
        if let Some(entry) = self.entry(kind, uid).await {
            let current = match self.storage.checksum(kind, uid).await {
                Ok(sum) => sum,
                Err(e) => {
                    self.remove(kind, uid).await;
                    return Err(e);
                }
            };
            if current == entry.checksum {
                // A full entry satisfies a meta read without downgrade.
                return Ok(match entry.value {
                    CacheValue::Full(obj) => obj.to_partial(),
                    CacheValue::Meta(partial) => partial,
                });
            }
        }
        self.refresh_meta(kind, uid).await
    }

    async fn set(&self, obj: &mut Object) -> Result<()> {
        let kind = obj.kind();
        let uid = obj.uid().clone();

        // Index first so in-flight readers in this process observe the
        // write immediately, then flush through synchronously.
        self.insert(
            kind,
            uid.clone(),
            CacheEntry {
                value: CacheValue::Full(obj.clone()),
                checksum: String::new(),
            },
        )
        .await;
        self.storage.set(obj).await?;

        // Record the post-write checksum so the next read is a hit.
        let checksum = self.storage.checksum(kind, &uid).await.unwrap_or_default();
        self.insert(
            kind,
            uid,
            CacheEntry {
                value: CacheValue::Full(obj.clone()),
                checksum,
            },
        )
        .await;
        Ok(())
    }

    async fn patch(&self, kind: Kind, uid: &Uid, patch: &[u8]) -> Result<()> {
        // Patches flush straight through; the changed checksum makes the
        // cached copy refetch on next access.
        self.storage.patch(kind, uid, patch).await
    }

    async fn delete(&self, kind: Kind, uid: &Uid) -> Result<()> {
        self.remove(kind, uid).await;
        self.storage.delete(kind, uid).await
    }

    async fn list(&self, kind: Kind) -> Result<Vec<Object>> {
        let storage_count = self.storage.count(kind).await?;
        if self.indexed_count(kind).await == storage_count {
            debug!(%kind, "cache hit when listing");
            let mut objs = Vec::with_capacity(storage_count as usize);
            for uid in self.indexed_uids(kind).await {
                objs.push(self.get(kind, &uid).await?);
            }
            return Ok(objs);
        }

        debug!(%kind, "cache miss when listing");
        let objs = self.storage.list(kind).await?;
        for obj in &objs {
            let checksum = self
                .storage
                .checksum(kind, obj.uid())
                .await
                .unwrap_or_default();
            self.insert(
                kind,
                obj.uid().clone(),
                CacheEntry {
                    value: CacheValue::Full(obj.clone()),
                    checksum,
                },
            )
            .await;
        }
        Ok(objs)
    }

    async fn list_meta(&self, kind: Kind) -> Result<Vec<PartialObject>> {
        let storage_count = self.storage.count(kind).await?;
        if self.indexed_count(kind).await == storage_count {
            debug!(%kind, "cache hit when listing");
            let mut objs = Vec::with_capacity(storage_count as usize);
            for uid in self.indexed_uids(kind).await {
                objs.push(self.get_meta(kind, &uid).await?);
            }
            return Ok(objs);
        }

        debug!(%kind, "cache miss when listing");
        let metas = self.storage.list_meta(kind).await?;
        for partial in &metas {
            // Backfill without downgrading entries that already hold the
            // full object.
            if self.entry(kind, partial.uid()).await.is_some() {
                continue;
            }
            let checksum = self
                .storage
                .checksum(kind, partial.uid())
                .await
                .unwrap_or_default();
            self.insert(
                kind,
                partial.uid().clone(),
                CacheEntry {
                    value: CacheValue::Meta(partial.clone()),
                    checksum,
                },
            )
            .await;
        }
        Ok(metas)
    }

    async fn count(&self, kind: Kind) -> Result<u64> {
        // The cache is transparent about cardinality.
        self.storage.count(kind).await
    }

    async fn checksum(&self, kind: Kind, uid: &Uid) -> Result<String> {
        self.storage.checksum(kind, uid).await
    }
}
