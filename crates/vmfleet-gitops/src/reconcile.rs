//! The control loop converging VM runtime state toward the declared
//! desired state carried by the update stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vmfleet_common::{validate, Kind, Result, Vm};
use vmfleet_store::{AssociatedUpdate, Event};

use crate::runtime::VmRuntime;

/// Consumes the merged update stream and issues runtime actions. One
/// bad manifest or one failing VM never halts the loop: per-object
/// errors are logged and swallowed here, and only here.
pub struct Reconciler {
    runtime: Arc<dyn VmRuntime>,
}

impl Reconciler {
    pub fn new(runtime: Arc<dyn VmRuntime>) -> Self {
        Self { runtime }
    }

    /// Runs until the update stream closes.
    pub async fn run(&self, mut updates: mpsc::Receiver<AssociatedUpdate>) {
        info!("reconcile loop started");
        while let Some(update) = updates.recv().await {
            if update.update.partial.kind != Kind::Vm {
                debug!(kind = %update.update.partial.kind, "ignoring non-VM update");
                continue;
            }
            let uid = update.update.partial.uid().clone();
            if let Err(e) = self.handle(update).await {
                warn!(%uid, "failed to reconcile VM: {e}");
            }
        }
        info!("update stream closed, reconcile loop exiting");
    }

    async fn handle(&self, update: AssociatedUpdate) -> Result<()> {
        match update.update.event {
            Event::Delete => {
                // The object is already gone from storage; all that is
                // left is runtime-side cleanup, keyed by the identity
                // the event carries.
                info!(uid = %update.update.partial.uid(), "removing VM");
                self.runtime.remove(&update.update.partial).await
            }
            Event::Create | Event::Modify => {
                let obj = update
                    .storage
                    .get(Kind::Vm, update.update.partial.uid())
                    .await?;
                if let Err(e) = validate(&obj) {
                    warn!(uid = %obj.uid(), "skipping invalid VM manifest: {e}");
                    return Ok(());
                }
                match obj.as_vm() {
                    Some(vm) => self.converge(vm).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// The convergence core: diff desired against observed and act.
    /// Re-running against unchanged state performs no runtime action.
    pub async fn converge(&self, vm: &Vm) -> Result<()> {
        let desired = vm.status.running;
        let observed = self.runtime.inspect(&vm.metadata.uid).await?;

        match (desired, observed) {
            (true, false) => {
                info!(uid = %vm.metadata.uid, name = %vm.metadata.name, "starting VM");
                self.runtime.create(vm).await?;
                self.runtime.start(vm).await
            }
            (false, true) => {
                info!(uid = %vm.metadata.uid, name = %vm.metadata.name, "stopping VM");
                self.runtime.stop(vm).await
            }
            _ => {
                debug!(uid = %vm.metadata.uid, desired, observed, "state already converged");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use vmfleet_common::{Object, PartialObject, Uid};
    use vmfleet_store::{GenericRawStorage, GenericStorage, Storage, Update};

    /// Records every action and tracks a running set, so tests can
    /// assert exactly which verbs the loop issued.
    #[derive(Default)]
    struct MockRuntime {
        running: StdMutex<HashSet<Uid>>,
        actions: StdMutex<Vec<String>>,
    }

    impl MockRuntime {
        fn actions(&self) -> Vec<String> {
            self.actions.lock().unwrap().clone()
        }

        fn log(&self, action: &str, uid: &Uid) {
            self.actions.lock().unwrap().push(format!("{action} {uid}"));
        }
    }

    #[async_trait]
    impl VmRuntime for MockRuntime {
        async fn inspect(&self, uid: &Uid) -> Result<bool> {
            Ok(self.running.lock().unwrap().contains(uid))
        }
        async fn create(&self, vm: &Vm) -> Result<()> {
            self.log("create", &vm.metadata.uid);
            Ok(())
        }
        async fn start(&self, vm: &Vm) -> Result<()> {
            self.log("start", &vm.metadata.uid);
            self.running.lock().unwrap().insert(vm.metadata.uid.clone());
            Ok(())
        }
        async fn stop(&self, vm: &Vm) -> Result<()> {
            self.log("stop", &vm.metadata.uid);
            self.running.lock().unwrap().remove(&vm.metadata.uid);
            Ok(())
        }
        async fn remove(&self, vm: &PartialObject) -> Result<()> {
            self.log("remove", vm.uid());
            Ok(())
        }
    }

    fn sample_vm(uid: &str, running: bool) -> Vm {
        let mut obj = Object::new(Kind::Vm);
        obj.set_name("v1");
        obj.set_uid(Uid::from(uid));
        let Object::Vm(mut vm) = obj else { unreachable!() };
        vm.spec.image = "ubuntu:22.04".into();
        vm.spec.kernel = "vmfleet/kernel:5.15".into();
        vm.status.running = running;
        vm
    }

    #[tokio::test]
    async fn test_converge_is_idempotent() {
        let runtime = Arc::new(MockRuntime::default());
        let reconciler = Reconciler::new(runtime.clone());
        let vm = sample_vm("abc123", true);

        // First pass acts, second pass observes convergence and does
        // nothing.
        reconciler.converge(&vm).await.unwrap();
        assert_eq!(runtime.actions(), ["create abc123", "start abc123"]);
        reconciler.converge(&vm).await.unwrap();
        assert_eq!(runtime.actions(), ["create abc123", "start abc123"]);
    }

    #[tokio::test]
    async fn test_converge_stops_unwanted_vm() {
        let runtime = Arc::new(MockRuntime::default());
        let reconciler = Reconciler::new(runtime.clone());

        let started = sample_vm("abc123", true);
        reconciler.converge(&started).await.unwrap();

        let mut stopped = started.clone();
        stopped.status.running = false;
        reconciler.converge(&stopped).await.unwrap();
        reconciler.converge(&stopped).await.unwrap();
        assert_eq!(
            runtime.actions(),
            ["create abc123", "start abc123", "stop abc123"]
        );
    }

    #[tokio::test]
    async fn test_invalid_manifest_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(GenericStorage::new(Arc::new(
            GenericRawStorage::new(dir.path()),
        )));

        // Persist a VM that fails validation (no image/kernel).
        let mut obj = Object::new(Kind::Vm);
        obj.set_name("broken");
        obj.set_uid(Uid::from("bad111"));
        storage.set(&mut obj).await.unwrap();

        let runtime = Arc::new(MockRuntime::default());
        let reconciler = Reconciler::new(runtime.clone());
        let update = AssociatedUpdate {
            update: Update {
                event: Event::Modify,
                partial: obj.to_partial(),
            },
            storage,
        };
        reconciler.handle(update).await.unwrap();
        assert!(runtime.actions().is_empty());
    }

    #[tokio::test]
    async fn test_delete_routes_to_remove_with_identity_only() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(GenericStorage::new(Arc::new(
            GenericRawStorage::new(dir.path()),
        )));

        let runtime = Arc::new(MockRuntime::default());
        let reconciler = Reconciler::new(runtime.clone());
        let update = AssociatedUpdate {
            update: Update {
                event: Event::Delete,
                partial: PartialObject::synthetic(Kind::Vm, Uid::from("gone99")),
            },
            storage,
        };
        reconciler.handle(update).await.unwrap();
        assert_eq!(runtime.actions(), ["remove gone99"]);
    }

    #[tokio::test]
    async fn test_run_consumes_stream_until_close_and_survives_errors() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(GenericStorage::new(Arc::new(
            GenericRawStorage::new(dir.path()),
        )));

        let mut valid = Object::new(Kind::Vm);
        valid.set_name("good");
        valid.set_uid(Uid::from("good11"));
        if let Object::Vm(vm) = &mut valid {
            vm.spec.image = "ubuntu:22.04".into();
            vm.spec.kernel = "vmfleet/kernel:5.15".into();
            vm.status.running = true;
        }
        storage.set(&mut valid).await.unwrap();

        let runtime = Arc::new(MockRuntime::default());
        let reconciler = Reconciler::new(runtime.clone());

        let (tx, rx) = mpsc::channel(8);
        // An update whose object is missing from storage errors inside
        // the loop; the stream must keep being consumed regardless.
        tx.send(AssociatedUpdate {
            update: Update {
                event: Event::Modify,
                partial: PartialObject::synthetic(Kind::Vm, Uid::from("missing")),
            },
            storage: storage.clone(),
        })
        .await
        .unwrap();
        tx.send(AssociatedUpdate {
            update: Update {
                event: Event::Create,
                partial: valid.to_partial(),
            },
            storage: storage.clone(),
        })
        .await
        .unwrap();
        drop(tx);

        reconciler.run(rx).await;
        assert_eq!(runtime.actions(), ["create good11", "start good11"]);
    }
}
