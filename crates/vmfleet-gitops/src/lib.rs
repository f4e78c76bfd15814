//! GitOps plumbing for vmfleet: a live clone of the manifest
//! repository, the storage composition over it, and the reconcile loop
//! that converges VM runtime state toward what the manifests declare.

pub mod gitdir;
pub mod reconcile;
pub mod runtime;
pub mod store;

pub use gitdir::{GitAuth, GitDirectory, GitDirectoryOptions};
pub use reconcile::Reconciler;
pub use runtime::VmRuntime;
pub use store::GitOpsStore;
