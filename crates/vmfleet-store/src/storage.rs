//! The typed object store: a stateless codec over a `RawStorage`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use vmfleet_common::serializer;
use vmfleet_common::{Error, FieldError, Format, Kind, Object, PartialObject, Result, Uid};

use crate::key::{KindKey, ObjectKey};
use crate::patch::strategic_merge;
use crate::raw::RawStorage;

/// Persists and retrieves typed API objects. The sole API surface
/// consumed by higher-level clients.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads and fully decodes the object with the given identity.
    async fn get(&self, kind: Kind, uid: &Uid) -> Result<Object>;
    /// Reads only the object's identity metadata. Never fails on fields
    /// unknown to the light decoder.
    async fn get_meta(&self, kind: Kind, uid: &Uid) -> Result<PartialObject>;
    /// Encodes and writes the object. Sets `metadata.created` on first
    /// persist. Panics if the object has an empty UID: that is a broken
    /// invariant upstream, not bad input.
    async fn set(&self, obj: &mut Object) -> Result<()>;
    /// Read-modify-write with a strategic merge patch (named list
    /// elements merge by name, not index).
    async fn patch(&self, kind: Kind, uid: &Uid, patch: &[u8]) -> Result<()>;
    /// Removes the object. Tolerant of absence.
    async fn delete(&self, kind: Kind, uid: &Uid) -> Result<()>;
    /// Fully decodes every object of the kind.
    async fn list(&self, kind: Kind) -> Result<Vec<Object>>;
    /// Decodes only each object's metadata; strictly cheaper than
    /// [`Storage::list`].
    async fn list_meta(&self, kind: Kind) -> Result<Vec<PartialObject>>;
    /// Number of stored objects of the kind, without decoding any.
    async fn count(&self, kind: Kind) -> Result<u64>;
    /// Checksum passthrough for the object's stored bytes.
    async fn checksum(&self, kind: Kind, uid: &Uid) -> Result<String>;
}

/// Allocates a defaulted object of the given kind (scheme defaulting).
pub fn new_object(kind: Kind) -> Object {
    Object::new(kind)
}

/// The default `Storage`: raw bytes from a `RawStorage`, typed via the
/// serializer. Owns no objects in memory.
pub struct GenericStorage {
    raw: Arc<dyn RawStorage>,
}

impl GenericStorage {
    pub fn new(raw: Arc<dyn RawStorage>) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Arc<dyn RawStorage> {
        &self.raw
    }

    async fn decode_at(&self, key: &ObjectKey) -> Result<Object> {
        let content = self.raw.read(key).await?;
        let format = self.raw.format(key).await;
        serializer::decode(&content, format)
    }
}

#[async_trait]
impl Storage for GenericStorage {
    async fn get(&self, kind: Kind, uid: &Uid) -> Result<Object> {
        self.decode_at(&ObjectKey::new(kind, uid.clone())).await
    }

    async fn get_meta(&self, kind: Kind, uid: &Uid) -> Result<PartialObject> {
        let key = ObjectKey::new(kind, uid.clone());
        let content = self.raw.read(&key).await?;
        serializer::decode_partial(&content)
    }

    async fn set(&self, obj: &mut Object) -> Result<()> {
        if obj.uid().is_empty() {
            panic!("Storage::set called with an empty UID; UIDs must be assigned before persisting");
        }
        let key = ObjectKey::new(obj.kind(), obj.uid().clone());

        // Register creation time on first persist only.
        if !self.raw.exists(&key).await && obj.created().is_none() {
            obj.set_created(Utc::now());
        }

        let format = self.raw.format(&key).await;
        let content = serializer::encode(obj, format)?;
        debug!(%key, ?format, "writing object");
        self.raw.write(&key, &content).await
    }

    async fn patch(&self, kind: Kind, uid: &Uid, patch: &[u8]) -> Result<()> {
        let key = ObjectKey::new(kind, uid.clone());
        let content = self.raw.read(&key).await?;
        let format = self.raw.format(&key).await;

        let current: serde_json::Value = match format {
            Format::Json => serde_json::from_slice(&content)?,
            Format::Yaml => serde_yaml::from_slice(&content)?,
        };
        let patch_value: serde_json::Value = serde_json::from_slice(patch)?;

        let merged = strategic_merge(current, &patch_value);
        // Decoding the merged value back into a typed object rejects
        // patches that would corrupt the stored document.
        let obj: Object = serde_json::from_value(merged)
            .map_err(|e| Error::Decode(format!("patch produced an invalid object: {e}")))?;
        if obj.uid() != uid {
            return Err(Error::Validation(vec![FieldError::new(
                "metadata.uid",
                "patches may not change the UID",
            )]));
        }

        let content = serializer::encode(&obj, format)?;
        self.raw.write(&key, &content).await
    }

    async fn delete(&self, kind: Kind, uid: &Uid) -> Result<()> {
        self.raw.delete(&ObjectKey::new(kind, uid.clone())).await
    }

    async fn list(&self, kind: Kind) -> Result<Vec<Object>> {
        let keys = self.raw.list(KindKey(kind)).await?;
        let mut objs = Vec::with_capacity(keys.len());
        for key in &keys {
            objs.push(self.decode_at(key).await?);
        }
        Ok(objs)
    }

    async fn list_meta(&self, kind: Kind) -> Result<Vec<PartialObject>> {
        let keys = self.raw.list(KindKey(kind)).await?;
        let mut objs = Vec::with_capacity(keys.len());
        for key in &keys {
            let content = self.raw.read(key).await?;
            objs.push(serializer::decode_partial(&content)?);
        }
        Ok(objs)
    }

    async fn count(&self, kind: Kind) -> Result<u64> {
        Ok(self.raw.list(KindKey(kind)).await?.len() as u64)
    }

    async fn checksum(&self, kind: Kind, uid: &Uid) -> Result<String> {
        self.raw.checksum(&ObjectKey::new(kind, uid.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::GenericRawStorage;
    use vmfleet_common::Volume;

    fn storage(dir: &std::path::Path) -> GenericStorage {
        GenericStorage::new(Arc::new(GenericRawStorage::new(dir)))
    }

    fn sample_vm(name: &str, uid: &str) -> Object {
        let mut obj = Object::new(Kind::Vm);
        obj.set_name(name);
        obj.set_uid(Uid::from(uid));
        if let Object::Vm(vm) = &mut obj {
            vm.spec.image = "ubuntu:22.04".into();
            vm.spec.kernel = "vmfleet/kernel:5.15".into();
        }
        obj
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());

        let mut obj = sample_vm("v1", "abc123");
        s.set(&mut obj).await.unwrap();
        assert!(obj.created().is_some(), "created must be set on first persist");

        let fetched = s.get(Kind::Vm, &Uid::from("abc123")).await.unwrap();
        assert_eq!(fetched, obj);
    }

    #[tokio::test]
    async fn test_created_is_set_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());

        let mut obj = sample_vm("v1", "abc123");
        s.set(&mut obj).await.unwrap();
        let created = obj.created().unwrap();

        s.set(&mut obj).await.unwrap();
        assert_eq!(obj.created().unwrap(), created);
    }

    #[tokio::test]
    #[should_panic(expected = "empty UID")]
    async fn test_set_with_empty_uid_panics() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());
        let mut obj = Object::new(Kind::Vm);
        let _ = s.set(&mut obj).await;
    }

    #[tokio::test]
    async fn test_get_distinguishes_not_found_from_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());
        let uid = Uid::from("abc123");

        assert!(s.get(Kind::Vm, &uid).await.unwrap_err().is_not_found());

        std::fs::create_dir_all(dir.path().join("vm/abc123")).unwrap();
        std::fs::write(dir.path().join("vm/abc123/metadata.json"), b"{not json").unwrap();
        let err = s.get(Kind::Vm, &uid).await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn test_get_meta_ignores_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());

        std::fs::create_dir_all(dir.path().join("vm/abc123")).unwrap();
        std::fs::write(
            dir.path().join("vm/abc123/metadata.json"),
            br#"{"kind":"VM","apiVersion":"vmfleet/v1alpha1",
                "metadata":{"name":"v1","uid":"abc123"},
                "spec":{"futureField":{"deeply":"nested"}}}"#,
        )
        .unwrap();

        let partial = s.get_meta(Kind::Vm, &Uid::from("abc123")).await.unwrap();
        assert_eq!(partial.name(), "v1");
    }

    #[tokio::test]
    async fn test_patch_merges_named_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());

        let mut obj = sample_vm("v1", "abc123");
        if let Object::Vm(vm) = &mut obj {
            vm.spec.volumes = vec![
                Volume {
                    name: "data".into(),
                    host_path: "/srv/data".into(),
                    read_only: false,
                },
                Volume {
                    name: "logs".into(),
                    host_path: "/srv/logs".into(),
                    read_only: false,
                },
            ];
        }
        s.set(&mut obj).await.unwrap();

        let uid = Uid::from("abc123");
        let patch = br#"{"spec":{"volumes":[{"name":"logs","readOnly":true}]}}"#;
        s.patch(Kind::Vm, &uid, patch).await.unwrap();

        let vm = s.get(Kind::Vm, &uid).await.unwrap();
        let volumes = &vm.as_vm().unwrap().spec.volumes;
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].name, "data");
        assert_eq!(volumes[0].host_path, "/srv/data");
        assert!(!volumes[0].read_only, "sibling volume must be untouched");
        assert!(volumes[1].read_only);
    }

    #[tokio::test]
    async fn test_patch_may_not_change_uid() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());
        let mut obj = sample_vm("v1", "abc123");
        s.set(&mut obj).await.unwrap();

        let err = s
            .patch(
                Kind::Vm,
                &Uid::from("abc123"),
                br#"{"metadata":{"uid":"other"}}"#,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_list_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());

        for (name, uid) in [("v1", "aaa"), ("v2", "bbb"), ("v3", "ccc")] {
            s.set(&mut sample_vm(name, uid)).await.unwrap();
        }

        assert_eq!(s.count(Kind::Vm).await.unwrap(), 3);
        assert_eq!(s.count(Kind::Image).await.unwrap(), 0);
        assert_eq!(s.list(Kind::Vm).await.unwrap().len(), 3);

        let metas = s.list_meta(Kind::Vm).await.unwrap();
        let mut names: Vec<_> = metas.iter().map(|m| m.name().to_string()).collect();
        names.sort();
        assert_eq!(names, ["v1", "v2", "v3"]);
    }
}
