//! The boundary to the VM runtime collaborator. The reconcile loop
//! drives these verbs; what happens behind them (hypervisor processes,
//! networking, overlays) is someone else's problem.

use async_trait::async_trait;

use vmfleet_common::{PartialObject, Result, Uid, Vm};

#[async_trait]
pub trait VmRuntime: Send + Sync {
    /// Whether a runtime instance for this UID is currently running.
    async fn inspect(&self, uid: &Uid) -> Result<bool>;
    /// Ensures runtime resources exist for the VM. Must be a no-op when
    /// they already do.
    async fn create(&self, vm: &Vm) -> Result<()>;
    async fn start(&self, vm: &Vm) -> Result<()>;
    async fn stop(&self, vm: &Vm) -> Result<()>;
    /// Cleans up runtime-side resources. Storage deletion has already
    /// happened by the time this is called, so only identity is passed.
    async fn remove(&self, vm: &PartialObject) -> Result<()>;
}
