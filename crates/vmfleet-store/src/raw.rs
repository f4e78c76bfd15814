//! Byte-level key/value persistence over a directory tree.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use vmfleet_common::{Error, Format, Result};

use crate::key::{KindKey, ObjectKey};

/// File name of the object manifest inside its per-UID directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Low-level, key-indexed storage of byte-encoded objects in
/// non-volatile memory. All keys are namespaced by one root directory.
#[async_trait]
pub trait RawStorage: Send + Sync {
    /// Returns the stored bytes for the key, or `NotFound`.
    async fn read(&self, key: &ObjectKey) -> Result<Vec<u8>>;
    /// Checks whether any bytes are stored for the key.
    async fn exists(&self, key: &ObjectKey) -> bool;
    /// Writes the given bytes, creating parent directories as needed.
    async fn write(&self, key: &ObjectKey, content: &[u8]) -> Result<()>;
    /// Removes the object's entire subtree. Tolerant of absence.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
    /// Returns all object keys stored under the kind prefix.
    async fn list(&self, kind: KindKey) -> Result<Vec<ObjectKey>>;
    /// Returns an opaque string that changes iff the stored bytes
    /// changed. Cheap: O(stat) unless content checksums are enabled.
    async fn checksum(&self, key: &ObjectKey) -> Result<String>;
    /// The encoding format of the bytes stored for this key.
    async fn format(&self, key: &ObjectKey) -> Format;
    /// The directory watchers should monitor for this storage.
    fn watch_dir(&self) -> &Path;
    /// Resolves a physical file path (as reported by a watcher) back to
    /// its virtual key.
    async fn key_for_path(&self, path: &Path) -> Result<ObjectKey>;
}

fn mtime_checksum(meta: &std::fs::Metadata) -> String {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos().to_string())
        .unwrap_or_default()
}

/// `RawStorage` over `<root>/<kind-lowercase>/<uid>/metadata.json`,
/// owning its file layout. Always encodes JSON.
pub struct GenericRawStorage {
    dir: PathBuf,
    content_checksums: bool,
}

impl GenericRawStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            content_checksums: false,
        }
    }

    /// Like [`GenericRawStorage::new`], but checksums hash file contents
    /// instead of using the modification time. Use when sub-second write
    /// rates matter more than stat-cheap checksums.
    pub fn with_content_checksums(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            content_checksums: true,
        }
    }

    fn object_dir(&self, key: &ObjectKey) -> PathBuf {
        self.dir
            .join(key.kind.lowercase())
            .join(key.uid.as_str())
    }

    fn object_path(&self, key: &ObjectKey) -> PathBuf {
        self.object_dir(key).join(METADATA_FILE)
    }
}

#[async_trait]
impl RawStorage for GenericRawStorage {
    async fn read(&self, key: &ObjectKey) -> Result<Vec<u8>> {
        fs::read(self.object_path(key)).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::NotFound(key.kind, key.uid.clone())
            } else {
                e.into()
            }
        })
    }

    async fn exists(&self, key: &ObjectKey) -> bool {
        fs::metadata(self.object_path(key)).await.is_ok()
    }

    async fn write(&self, key: &ObjectKey, content: &[u8]) -> Result<()> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        match fs::remove_dir_all(self.object_dir(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, kind: KindKey) -> Result<Vec<ObjectKey>> {
        let kind_dir = self.dir.join(kind.to_string());
        let mut entries = match fs::read_dir(&kind_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let key = ObjectKey::new(kind.0, entry.file_name().to_string_lossy().as_ref().into());
            // A UID directory without a metadata file means "no object
            // yet"; skip it instead of failing the whole listing.
            if !self.exists(&key).await {
                debug!(%key, "skipping object directory without metadata");
                continue;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    async fn checksum(&self, key: &ObjectKey) -> Result<String> {
        if self.content_checksums {
            let content = self.read(key).await?;
            let mut hasher = Sha256::new();
            hasher.update(&content);
            return Ok(format!("{:x}", hasher.finalize()));
        }

        match fs::metadata(self.object_path(key)).await {
            Ok(meta) => Ok(mtime_checksum(&meta)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(key.kind, key.uid.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn format(&self, _key: &ObjectKey) -> Format {
        Format::Json
    }

    fn watch_dir(&self) -> &Path {
        &self.dir
    }

    async fn key_for_path(&self, path: &Path) -> Result<ObjectKey> {
        let rel = path
            .strip_prefix(&self.dir)
            .map_err(|_| Error::UntrackedPath(path.to_path_buf()))?;
        let mut components = rel.components().map(|c| c.as_os_str().to_string_lossy());
        match (components.next(), components.next()) {
            (Some(kind), Some(uid)) => Ok(ObjectKey::new(kind.parse()?, uid.as_ref().into())),
            _ => Err(Error::UntrackedPath(path.to_path_buf())),
        }
    }
}

/// `RawStorage` for manifest directories whose file names are chosen by
/// humans (or git), not derived from keys. A path↔key table translates
/// between the two; it is populated by an initial directory walk and
/// kept current by the owning watch storage.
pub struct ManifestRawStorage {
    dir: PathBuf,
    mappings: RwLock<HashMap<ObjectKey, PathBuf>>,
}

impl ManifestRawStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            mappings: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_mapping(&self, key: ObjectKey, path: PathBuf) {
        debug!(%key, ?path, "adding file mapping");
        self.mappings.write().await.insert(key, path);
    }

    /// Reverse lookup: the key tracked for a physical path, if any.
    pub async fn get_mapping(&self, path: &Path) -> Option<ObjectKey> {
        self.mappings
            .read()
            .await
            .iter()
            .find(|(_, p)| p.as_path() == path)
            .map(|(k, _)| k.clone())
    }

    pub async fn remove_mapping(&self, key: &ObjectKey) {
        debug!(%key, "removing file mapping");
        self.mappings.write().await.remove(key);
    }

    async fn mapped_path(&self, key: &ObjectKey) -> Result<PathBuf> {
        self.mappings
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.kind, key.uid.clone()))
    }
}

#[async_trait]
impl RawStorage for ManifestRawStorage {
    async fn read(&self, key: &ObjectKey) -> Result<Vec<u8>> {
        let path = self.mapped_path(key).await?;
        fs::read(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::NotFound(key.kind, key.uid.clone())
            } else {
                e.into()
            }
        })
    }

    async fn exists(&self, key: &ObjectKey) -> bool {
        match self.mapped_path(key).await {
            Ok(path) => fs::metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn write(&self, key: &ObjectKey, content: &[u8]) -> Result<()> {
        let path = match self.mapped_path(key).await {
            Ok(path) => path,
            // First write of a programmatically created object: give it
            // a deterministic file name and start tracking it.
            Err(_) => {
                let path = self
                    .dir
                    .join(format!("{}-{}.yaml", key.kind.lowercase(), key.uid));
                self.add_mapping(key.clone(), path.clone()).await;
                path
            }
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let Ok(path) = self.mapped_path(key).await else {
            return Ok(());
        };
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.remove_mapping(key).await;
        Ok(())
    }

    async fn list(&self, kind: KindKey) -> Result<Vec<ObjectKey>> {
        Ok(self
            .mappings
            .read()
            .await
            .keys()
            .filter(|k| k.kind == kind.0)
            .cloned()
            .collect())
    }

    async fn checksum(&self, key: &ObjectKey) -> Result<String> {
        let path = self.mapped_path(key).await?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(mtime_checksum(&meta)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(key.kind, key.uid.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn format(&self, key: &ObjectKey) -> Format {
        match self.mapped_path(key).await {
            Ok(path) => Format::from_path(&path).unwrap_or(Format::Yaml),
            Err(_) => Format::Yaml,
        }
    }

    fn watch_dir(&self) -> &Path {
        &self.dir
    }

    async fn key_for_path(&self, path: &Path) -> Result<ObjectKey> {
        self.get_mapping(path)
            .await
            .ok_or_else(|| Error::UntrackedPath(path.to_path_buf()))
    }
}
