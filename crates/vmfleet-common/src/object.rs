//! The typed API object model: VM, Image and Kernel resources plus the
//! identity types (Kind, UID, GroupVersionKind) they share.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// API group/version every vmfleet object is served under.
pub const API_VERSION: &str = "vmfleet/v1alpha1";

fn default_api_version() -> String {
    API_VERSION.to_string()
}

/// The resource type of a persisted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    #[serde(rename = "VM")]
    Vm,
    Image,
    Kernel,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Vm => "VM",
            Kind::Image => "Image",
            Kind::Kernel => "Kernel",
        }
    }

    /// Lowercase form, used for on-disk storage paths.
    pub fn lowercase(&self) -> &'static str {
        match self {
            Kind::Vm => "vm",
            Kind::Image => "image",
            Kind::Kernel => "kernel",
        }
    }

    pub fn all() -> [Kind; 3] {
        [Kind::Vm, Kind::Image, Kind::Kernel]
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = Error;

    // Case-insensitive: "vm", "VM" and "Vm" all parse to Kind::Vm.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vm" => Ok(Kind::Vm),
            "image" => Ok(Kind::Image),
            "kernel" => Ok(Kind::Kernel),
            _ => Err(Error::UnknownKind(s.to_string())),
        }
    }
}

/// Immutable, opaque identifier of one object instance. Assigned exactly
/// once; the sole key for storage addressing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Generates a fresh 16-hex-character UID.
    pub fn random() -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self(simple[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Group/Version/Kind: the full type identity of a persisted object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: Kind,
}

impl GroupVersionKind {
    pub fn vmfleet(kind: Kind) -> Self {
        let (group, version) = API_VERSION.split_once('/').unwrap_or((API_VERSION, ""));
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind,
        }
    }
}

/// Shared object metadata. `name` is a mutable, human-chosen convenience
/// lookup; `uid` is the stable identity; `created` is set once on first
/// persist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uid: Uid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// A named volume attached to a VM. Named list elements like these are
/// what the strategic merge patch merges by name instead of by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Volume {
    pub name: String,
    pub host_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmSpec {
    pub cpus: u64,
    pub memory_mb: u64,
    pub disk_size_gb: u64,
    /// OCI reference of the root filesystem image.
    pub image: String,
    /// OCI reference of the kernel to boot.
    pub kernel: String,
    pub volumes: Vec<Volume>,
}

impl Default for VmSpec {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mb: 512,
            disk_size_gb: 4,
            image: String::new(),
            kernel: String::new(),
            volumes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmStatus {
    /// Desired-and-observed run state as authored in the manifest; the
    /// reconcile loop converges the runtime toward this.
    pub running: bool,
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VmSpec,
    #[serde(default)]
    pub status: VmStatus,
}

impl Default for Vm {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            metadata: ObjectMeta::default(),
            spec: VmSpec::default(),
            status: VmStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageSpec {
    /// OCI reference the image was imported from.
    pub oci: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageStatus {
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ImageSpec,
    #[serde(default)]
    pub status: ImageStatus,
}

impl Default for Image {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            metadata: ObjectMeta::default(),
            spec: ImageSpec::default(),
            status: ImageStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelSpec {
    pub oci: String,
    pub cmdline: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelStatus {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kernel {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: KernelSpec,
    #[serde(default)]
    pub status: KernelStatus,
}

impl Default for Kernel {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            metadata: ObjectMeta::default(),
            spec: KernelSpec::default(),
            status: KernelStatus::default(),
        }
    }
}

/// A persisted resource of any recognized kind. Internally tagged by the
/// `kind` field, so a manifest decodes straight into its typed variant
/// and unrecognized kinds fail with a decode error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Object {
    #[serde(rename = "VM")]
    Vm(Vm),
    Image(Image),
    Kernel(Kernel),
}

impl Object {
    /// Allocates a defaulted object of the given kind (scheme defaulting).
    pub fn new(kind: Kind) -> Self {
        match kind {
            Kind::Vm => Object::Vm(Vm::default()),
            Kind::Image => Object::Image(Image::default()),
            Kind::Kernel => Object::Kernel(Kernel::default()),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Object::Vm(_) => Kind::Vm,
            Object::Image(_) => Kind::Image,
            Object::Kernel(_) => Kind::Kernel,
        }
    }

    pub fn api_version(&self) -> &str {
        match self {
            Object::Vm(o) => &o.api_version,
            Object::Image(o) => &o.api_version,
            Object::Kernel(o) => &o.api_version,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Object::Vm(o) => &o.metadata,
            Object::Image(o) => &o.metadata,
            Object::Kernel(o) => &o.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Object::Vm(o) => &mut o.metadata,
            Object::Image(o) => &mut o.metadata,
            Object::Kernel(o) => &mut o.metadata,
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.metadata().uid
    }

    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.metadata().created
    }

    pub fn set_uid(&mut self, uid: Uid) {
        self.metadata_mut().uid = uid;
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.metadata_mut().name = name.into();
    }

    pub fn set_created(&mut self, at: DateTime<Utc>) {
        self.metadata_mut().created = Some(at);
    }

    pub fn group_version_kind(&self) -> GroupVersionKind {
        GroupVersionKind::vmfleet(self.kind())
    }

    pub fn as_vm(&self) -> Option<&Vm> {
        match self {
            Object::Vm(vm) => Some(vm),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&Image> {
        match self {
            Object::Image(img) => Some(img),
            _ => None,
        }
    }

    pub fn as_kernel(&self) -> Option<&Kernel> {
        match self {
            Object::Kernel(k) => Some(k),
            _ => None,
        }
    }

    /// The lightweight metadata-only projection of this object.
    pub fn to_partial(&self) -> PartialObject {
        PartialObject {
            kind: self.kind(),
            api_version: self.api_version().to_string(),
            metadata: self.metadata().clone(),
        }
    }
}

/// The metadata-only projection of an object: kind, apiVersion and
/// metadata, with every other field ignored during decoding. Decoding a
/// full body into this never fails on fields unknown to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialObject {
    pub kind: Kind,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl PartialObject {
    /// Synthesizes a partial object from identity alone, for events whose
    /// backing file is already gone (deletes).
    pub fn synthetic(kind: Kind, uid: Uid) -> Self {
        Self {
            kind,
            api_version: default_api_version(),
            metadata: ObjectMeta {
                uid,
                ..ObjectMeta::default()
            },
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.metadata.uid
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

impl From<&Object> for PartialObject {
    fn from(obj: &Object) -> Self {
        obj.to_partial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_is_case_insensitive() {
        assert_eq!("vm".parse::<Kind>().unwrap(), Kind::Vm);
        assert_eq!("VM".parse::<Kind>().unwrap(), Kind::Vm);
        assert_eq!("Image".parse::<Kind>().unwrap(), Kind::Image);
        assert_eq!("KERNEL".parse::<Kind>().unwrap(), Kind::Kernel);
        assert!("pod".parse::<Kind>().is_err());
    }

    #[test]
    fn test_kind_lowercase_used_for_paths() {
        assert_eq!(Kind::Vm.lowercase(), "vm");
        assert_eq!(Kind::Vm.to_string(), "VM");
    }

    #[test]
    fn test_uid_random_is_16_hex_chars() {
        let uid = Uid::random();
        assert_eq!(uid.as_str().len(), 16);
        assert!(uid.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(uid, Uid::random());
    }

    #[test]
    fn test_object_defaults_by_kind() {
        let obj = Object::new(Kind::Vm);
        assert_eq!(obj.kind(), Kind::Vm);
        assert_eq!(obj.api_version(), API_VERSION);
        let vm = obj.as_vm().unwrap();
        assert_eq!(vm.spec.cpus, 1);
        assert_eq!(vm.spec.memory_mb, 512);
    }

    #[test]
    fn test_partial_decodes_from_full_body() {
        let mut obj = Object::new(Kind::Vm);
        obj.set_name("web-1");
        obj.set_uid(Uid::from("0123456789abcdef"));

        let json = serde_json::to_vec(&obj).unwrap();
        let partial: PartialObject = serde_json::from_slice(&json).unwrap();
        assert_eq!(partial.kind, Kind::Vm);
        assert_eq!(partial.name(), "web-1");
        assert_eq!(partial.uid().as_str(), "0123456789abcdef");
    }
}
