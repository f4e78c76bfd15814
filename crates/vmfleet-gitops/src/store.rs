//! Composition of the gitops pipeline: git clone → watched manifest
//! storage → synced storage → update stream.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use vmfleet_common::Result;
use vmfleet_store::{
    AssociatedUpdate, GenericRawStorage, GenericStorage, GenericWatchStorage, SyncStorage,
    WatchOptions,
};

use crate::gitdir::GitDirectory;

/// One logical storage over a git-managed manifest directory and a
/// local data directory. Reads come from the data directory; writes
/// land in both, so programmatic changes show up in git (and get pushed
/// by the commit loop, when credentials permit). Out-of-band edits —
/// humans committing manifests — surface on the update stream.
pub struct GitOpsStore {
    gitdir: Arc<GitDirectory>,
    storage: Arc<SyncStorage>,
    manifest: Arc<GenericWatchStorage>,
}

impl GitOpsStore {
    /// Waits for the first clone to complete (bounded by
    /// `ready_timeout`), then wires the manifest directory up behind a
    /// watched, synced storage. The git directory's loops must already
    /// be started.
    pub async fn new(
        gitdir: Arc<GitDirectory>,
        data_dir: &Path,
        watch_opts: WatchOptions,
        ready_timeout: Duration,
    ) -> Result<Self> {
        gitdir.wait_ready(ready_timeout).await?;

        let primary = Arc::new(GenericStorage::new(Arc::new(GenericRawStorage::new(
            data_dir,
        ))));
        let manifest = GenericWatchStorage::new(gitdir.dir(), watch_opts).await?;

        let mut sync = SyncStorage::new(primary);
        sync.add_watched(Arc::clone(&manifest));

        Ok(Self {
            gitdir,
            storage: Arc::new(sync),
            manifest,
        })
    }

    pub fn storage(&self) -> Arc<SyncStorage> {
        Arc::clone(&self.storage)
    }

    pub fn gitdir(&self) -> &Arc<GitDirectory> {
        &self.gitdir
    }

    pub fn manifest_storage(&self) -> &Arc<GenericWatchStorage> {
        &self.manifest
    }

    /// Takes the merged update stream; feed it to a reconciler.
    pub fn updates(&self) -> Option<mpsc::Receiver<AssociatedUpdate>> {
        self.storage.updates()
    }

    /// Tears the pipeline down: watchers first (closing the update
    /// stream), then the git loops and the clone directory.
    pub async fn close(&self) -> Result<()> {
        self.storage.close().await;
        self.gitdir.cleanup().await
    }
}
