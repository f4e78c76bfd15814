//! One logical `Storage` fanning writes out across a read-write primary
//! and any number of write-only secondaries.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::debug;

use vmfleet_common::{Error, Kind, Object, PartialObject, Result, Uid};

use crate::storage::Storage;
use crate::update::AssociatedUpdate;
use crate::watch::storage::GenericWatchStorage;
use crate::watch::watcher::EVENT_BUFFER;

/// Fans `set`/`patch`/`delete` out to every backend concurrently and
/// aggregates failures; serves every read from the primary alone.
/// Watched secondaries additionally feed their update streams into one
/// shared channel, tagged with the producing storage.
pub struct SyncStorage {
    primary: Arc<dyn Storage>,
    /// Primary (index 0) plus secondaries, in registration order. The
    /// indices tag per-backend failures in aggregate errors.
    backends: Vec<Arc<dyn Storage>>,
    watched: Vec<Arc<GenericWatchStorage>>,
    update_tx: StdMutex<Option<mpsc::Sender<AssociatedUpdate>>>,
    update_rx: StdMutex<Option<mpsc::Receiver<AssociatedUpdate>>>,
}

impl SyncStorage {
    pub fn new(primary: Arc<dyn Storage>) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            backends: vec![Arc::clone(&primary)],
            primary,
            watched: Vec::new(),
            update_tx: StdMutex::new(Some(tx)),
            update_rx: StdMutex::new(Some(rx)),
        }
    }

    /// Registers a write-only secondary.
    pub fn add(&mut self, storage: Arc<dyn Storage>) {
        self.backends.push(storage);
    }

    /// Registers a write-only secondary whose watch events are merged
    /// into the shared update stream.
    pub fn add_watched(&mut self, storage: Arc<GenericWatchStorage>) {
        if let Some(tx) = self.update_tx.lock().unwrap().as_ref() {
            storage.set_event_stream(tx.clone());
        }
        self.watched.push(Arc::clone(&storage));
        self.backends.push(storage);
    }

    /// Takes the merged update stream. Yields `None` after the first
    /// call. The stream closes once [`SyncStorage::close`] has run.
    pub fn updates(&self) -> Option<mpsc::Receiver<AssociatedUpdate>> {
        self.update_rx.lock().unwrap().take()
    }

    /// Stops all watched secondaries and closes the update stream so
    /// downstream consumers exit cleanly.
    pub async fn close(&self) {
        for watched in &self.watched {
            watched.close().await;
        }
        self.update_tx.lock().unwrap().take();
    }

    /// Runs the operation against every backend in parallel, waits for
    /// all of them, and aggregates failures. No short-circuit: partial
    /// failure visibility matters more than an early exit.
    async fn run_all<F>(&self, op: F) -> Result<()>
    where
        F: Fn(Arc<dyn Storage>) -> BoxFuture<'static, Result<()>>,
    {
        let (tx, mut rx) = mpsc::channel(self.backends.len());
        for (i, backend) in self.backends.iter().enumerate() {
            let tx = tx.clone();
            let fut = op(Arc::clone(backend));
            tokio::spawn(async move {
                let _ = tx.send((i, fut.await)).await;
            });
        }
        drop(tx);

        let mut failures = Vec::new();
        while let Some((i, result)) = rx.recv().await {
            if let Err(e) = result {
                failures.push((i, e.to_string()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort_by_key(|&(i, _)| i);
            Err(Error::Backend(failures))
        }
    }
}

#[async_trait]
impl Storage for SyncStorage {
    async fn get(&self, kind: Kind, uid: &Uid) -> Result<Object> {
        self.primary.get(kind, uid).await
    }

    async fn get_meta(&self, kind: Kind, uid: &Uid) -> Result<PartialObject> {
        self.primary.get_meta(kind, uid).await
    }

    async fn set(&self, obj: &mut Object) -> Result<()> {
        // Checked here, not just in the backends: a panic inside a
        // spawned fan-out task would not propagate to the caller.
        if obj.uid().is_empty() {
            panic!("Storage::set called with an empty UID; UIDs must be assigned before persisting");
        }

        // Stamp the creation time once up front, so every backend
        // persists an identical value.
        if obj.created().is_none()
            && self
                .primary
                .checksum(obj.kind(), obj.uid())
                .await
                .is_err()
        {
            obj.set_created(Utc::now());
        }

        debug!(kind = %obj.kind(), uid = %obj.uid(), backends = self.backends.len(), "fanning out set");
        let template = obj.clone();
        self.run_all(move |backend| {
            let mut obj = template.clone();
            Box::pin(async move { backend.set(&mut obj).await })
        })
        .await
    }

    async fn patch(&self, kind: Kind, uid: &Uid, patch: &[u8]) -> Result<()> {
        let uid = uid.clone();
        let patch = patch.to_vec();
        self.run_all(move |backend| {
            let uid = uid.clone();
            let patch = patch.clone();
            Box::pin(async move { backend.patch(kind, &uid, &patch).await })
        })
        .await
    }

    async fn delete(&self, kind: Kind, uid: &Uid) -> Result<()> {
        let uid = uid.clone();
        self.run_all(move |backend| {
            let uid = uid.clone();
            Box::pin(async move { backend.delete(kind, &uid).await })
        })
        .await
    }

    async fn list(&self, kind: Kind) -> Result<Vec<Object>> {
        self.primary.list(kind).await
    }

    async fn list_meta(&self, kind: Kind) -> Result<Vec<PartialObject>> {
        self.primary.list_meta(kind).await
    }

    async fn count(&self, kind: Kind) -> Result<u64> {
        self.primary.count(kind).await
    }

    async fn checksum(&self, kind: Kind, uid: &Uid) -> Result<String> {
        self.primary.checksum(kind, uid).await
    }
}
