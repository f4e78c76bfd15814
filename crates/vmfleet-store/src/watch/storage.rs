//! A `Storage` composed with a filesystem watcher: external edits to
//! the directory become typed update events, while the storage's own
//! writes are suppressed from the stream.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use vmfleet_common::serializer;
use vmfleet_common::{Error, Kind, Object, PartialObject, Result, Uid};

use crate::key::ObjectKey;
use crate::raw::{ManifestRawStorage, RawStorage};
use crate::storage::{GenericStorage, Storage};
use crate::update::{AssociatedUpdate, Event, FileUpdate, Update};
use crate::watch::watcher::{FileWatcher, SuspendSlot, WatchOptions};

/// Storage over a manifest directory, watching it for out-of-band edits.
///
/// Precondition: a single writer at a time per instance. Event
/// suppression uses a one-shot flag, so two concurrent programmatic
/// writers could leak one of their own events back into the stream.
pub struct GenericWatchStorage {
    inner: GenericStorage,
    raw: Arc<ManifestRawStorage>,
    suspend: SuspendSlot,
    events: StdMutex<Option<mpsc::Sender<AssociatedUpdate>>>,
    watcher: StdMutex<Option<FileWatcher>>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl GenericWatchStorage {
    /// Starts watching `dir` and resolves the identity of every
    /// recognized manifest already present. Files that fail to resolve
    /// (unknown kind, missing UID) are logged and left untracked.
    pub async fn new(dir: &Path, opts: WatchOptions) -> Result<Arc<Self>> {
        let raw = Arc::new(ManifestRawStorage::new(dir));
        let (watcher, files, updates) = FileWatcher::new(dir, opts)?;

        for path in files {
            match resolve_identity(&path).await {
                Ok(partial) => {
                    let key = ObjectKey::new(partial.kind, partial.uid().clone());
                    raw.add_mapping(key, path).await;
                }
                Err(e) => warn!(?path, "ignoring manifest: {e}"),
            }
        }

        let storage = Arc::new(Self {
            inner: GenericStorage::new(Arc::clone(&raw) as Arc<dyn RawStorage>),
            suspend: watcher.suspend_handle(),
            raw,
            events: StdMutex::new(None),
            watcher: StdMutex::new(Some(watcher)),
            monitor: StdMutex::new(None),
        });

        let monitor = tokio::spawn(monitor_loop(Arc::clone(&storage), updates));
        *storage.monitor.lock().unwrap() = Some(monitor);
        Ok(storage)
    }

    /// Wires the stream that resolved update events are sent on.
    pub fn set_event_stream(&self, stream: mpsc::Sender<AssociatedUpdate>) {
        *self.events.lock().unwrap() = Some(stream);
    }

    pub fn manifest_dir(&self) -> &Path {
        self.raw.watch_dir()
    }

    /// Stops the watch and waits for the monitor to drain, then drops
    /// the event sender so a shared update stream can close.
    pub async fn close(&self) {
        let watcher = self.watcher.lock().unwrap().take();
        if let Some(w) = watcher {
            w.close().await;
        }
        let monitor = self.monitor.lock().unwrap().take();
        if let Some(m) = monitor {
            let _ = m.await;
        }
        self.events.lock().unwrap().take();
    }
}

/// Reads just enough of a manifest to know what object it declares.
/// Requires a recognized kind and a non-empty UID.
async fn resolve_identity(path: &Path) -> Result<PartialObject> {
    let content = fs::read(path).await?;
    let partial = serializer::decode_partial(&content)?;
    if partial.uid().is_empty() {
        return Err(Error::Decode(".metadata.uid not set".into()));
    }
    Ok(partial)
}

async fn monitor_loop(
    storage: Arc<GenericWatchStorage>,
    mut updates: mpsc::Receiver<FileUpdate>,
) {
    debug!("watch storage: monitor task started");
    while let Some(FileUpdate { event, path }) = updates.recv().await {
        let partial = match event {
            Event::Delete => {
                // The file is already gone, so its identity can only
                // come from the path mapping. An unmapped path was never
                // a tracked object (e.g. it failed resolution earlier).
                match storage.raw.get_mapping(&path).await {
                    Some(key) => {
                        storage.raw.remove_mapping(&key).await;
                        PartialObject::synthetic(key.kind, key.uid)
                    }
                    None => {
                        debug!(?path, "ignoring delete of untracked path");
                        continue;
                    }
                }
            }
            Event::Create | Event::Modify => match resolve_identity(&path).await {
                Ok(partial) => {
                    let key = ObjectKey::new(partial.kind, partial.uid().clone());
                    storage.raw.add_mapping(key, path.clone()).await;
                    partial
                }
                Err(e) => {
                    warn!(?path, "ignoring manifest: {e}");
                    continue;
                }
            },
        };

        let sender = storage.events.lock().unwrap().clone();
        if let Some(tx) = sender {
            let update = AssociatedUpdate {
                update: Update { event, partial },
                storage: Arc::clone(&storage) as Arc<dyn Storage>,
            };
            if tx.send(update).await.is_err() {
                debug!("watch storage: update consumer gone");
            }
        }
    }
    debug!("watch storage: monitor task stopped");
}

#[async_trait]
impl Storage for GenericWatchStorage {
    async fn get(&self, kind: Kind, uid: &Uid) -> Result<Object> {
        self.inner.get(kind, uid).await
    }

    async fn get_meta(&self, kind: Kind, uid: &Uid) -> Result<PartialObject> {
        self.inner.get_meta(kind, uid).await
    }

    async fn set(&self, obj: &mut Object) -> Result<()> {
        let key = ObjectKey::new(obj.kind(), obj.uid().clone());
        // Drop the event this write is about to cause: a modify for a
        // tracked file, a create for one being materialized.
        let expected = if self.raw.exists(&key).await {
            Event::Modify
        } else {
            Event::Create
        };
        self.suspend.suspend(expected);
        self.inner.set(obj).await
    }

    async fn patch(&self, kind: Kind, uid: &Uid, patch: &[u8]) -> Result<()> {
        self.suspend.suspend(Event::Modify);
        self.inner.patch(kind, uid, patch).await
    }

    async fn delete(&self, kind: Kind, uid: &Uid) -> Result<()> {
        self.suspend.suspend(Event::Delete);
        let result = self.inner.delete(kind, uid).await;
        // The mapping is gone with the file; the suppressed event will
        // not re-resolve it.
        result
    }

    async fn list(&self, kind: Kind) -> Result<Vec<Object>> {
        self.inner.list(kind).await
    }

    async fn list_meta(&self, kind: Kind) -> Result<Vec<PartialObject>> {
        self.inner.list_meta(kind).await
    }

    async fn count(&self, kind: Kind) -> Result<u64> {
        self.inner.count(kind).await
    }

    async fn checksum(&self, kind: Kind, uid: &Uid) -> Result<String> {
        self.inner.checksum(kind, uid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn opts() -> WatchOptions {
        WatchOptions {
            dispatch_interval: Duration::from_millis(150),
        }
    }

    fn vm_manifest(name: &str, uid: &str) -> String {
        format!(
            "kind: VM\napiVersion: vmfleet/v1alpha1\nmetadata:\n  name: {name}\n  uid: {uid}\nspec:\n  image: ubuntu:22.04\n  kernel: vmfleet/kernel:5.15\nstatus:\n  running: true\n"
        )
    }

    async fn recv(rx: &mut mpsc::Receiver<AssociatedUpdate>) -> AssociatedUpdate {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for update")
            .expect("update stream closed early")
    }

    async fn expect_quiet(rx: &mut mpsc::Receiver<AssociatedUpdate>) {
        let res = tokio::time::timeout(Duration::from_millis(700), rx.recv()).await;
        assert!(res.is_err(), "expected no update, got {:?}", res.unwrap());
    }

    #[tokio::test]
    async fn test_initial_files_are_tracked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("v1.yaml"), vm_manifest("v1", "abc123")).unwrap();

        let storage = GenericWatchStorage::new(dir.path(), opts()).await.unwrap();
        let obj = storage.get(Kind::Vm, &Uid::from("abc123")).await.unwrap();
        assert_eq!(obj.name(), "v1");
        assert_eq!(storage.count(Kind::Vm).await.unwrap(), 1);
        storage.close().await;
    }

    #[tokio::test]
    async fn test_own_set_is_suppressed_but_external_edit_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("v1.yaml");
        std::fs::write(&file, vm_manifest("v1", "abc123")).unwrap();

        let storage = GenericWatchStorage::new(dir.path(), opts()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        storage.set_event_stream(tx);

        // A write through the storage must not come back as an event.
        let mut obj = storage.get(Kind::Vm, &Uid::from("abc123")).await.unwrap();
        obj.set_name("v1-renamed");
        storage.set(&mut obj).await.unwrap();
        expect_quiet(&mut rx).await;

        // An edit bypassing the storage must surface exactly once.
        std::fs::write(&file, vm_manifest("v1-external", "abc123")).unwrap();
        let update = recv(&mut rx).await;
        assert_eq!(update.update.event, Event::Modify);
        assert_eq!(update.update.partial.uid().as_str(), "abc123");
        expect_quiet(&mut rx).await;

        storage.close().await;
    }

    #[tokio::test]
    async fn test_delete_resolves_identity_via_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("v1.yaml");
        std::fs::write(&file, vm_manifest("v1", "abc123")).unwrap();

        let storage = GenericWatchStorage::new(dir.path(), opts()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        storage.set_event_stream(tx);

        std::fs::remove_file(&file).unwrap();
        let update = recv(&mut rx).await;
        assert_eq!(update.update.event, Event::Delete);
        assert_eq!(update.update.partial.kind, Kind::Vm);
        assert_eq!(update.update.partial.uid().as_str(), "abc123");

        storage.close().await;
    }

    #[tokio::test]
    async fn test_untracked_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let storage = GenericWatchStorage::new(dir.path(), opts()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        storage.set_event_stream(tx);

        // No UID: resolution fails, the file stays untracked, and its
        // deletion is dropped too.
        let bogus = dir.path().join("incomplete.yaml");
        std::fs::write(&bogus, "kind: VM\nmetadata:\n  name: nameless\n").unwrap();
        expect_quiet(&mut rx).await;
        std::fs::remove_file(&bogus).unwrap();
        expect_quiet(&mut rx).await;

        storage.close().await;
    }
}
