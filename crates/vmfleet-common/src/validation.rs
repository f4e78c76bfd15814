//! Semantic validation of decoded objects. The reconcile loop skips (and
//! logs) objects that fail here instead of halting the stream.

use std::collections::HashSet;

use crate::error::{Error, FieldError, Result};
use crate::object::Object;

/// Validates a well-formed object, collecting every field error rather
/// than stopping at the first.
pub fn validate(obj: &Object) -> Result<()> {
    let mut errs = Vec::new();

    let meta = obj.metadata();
    if meta.name.is_empty() {
        errs.push(FieldError::new("metadata.name", "must not be empty"));
    }
    if meta.uid.is_empty() {
        errs.push(FieldError::new("metadata.uid", "must not be empty"));
    }

    match obj {
        Object::Vm(vm) => {
            if vm.spec.cpus < 1 {
                errs.push(FieldError::new("spec.cpus", "must be at least 1"));
            }
            if vm.spec.memory_mb < 1 {
                errs.push(FieldError::new("spec.memoryMb", "must be at least 1 MiB"));
            }
            if vm.spec.image.is_empty() {
                errs.push(FieldError::new("spec.image", "must reference an image"));
            }
            if vm.spec.kernel.is_empty() {
                errs.push(FieldError::new("spec.kernel", "must reference a kernel"));
            }

            let mut seen = HashSet::new();
            for (i, vol) in vm.spec.volumes.iter().enumerate() {
                if vol.name.is_empty() {
                    errs.push(FieldError::new(
                        format!("spec.volumes[{i}].name"),
                        "must not be empty",
                    ));
                } else if !seen.insert(vol.name.as_str()) {
                    errs.push(FieldError::new(
                        format!("spec.volumes[{i}].name"),
                        format!("duplicate volume name {:?}", vol.name),
                    ));
                }
            }
        }
        Object::Image(img) => {
            if img.spec.oci.is_empty() {
                errs.push(FieldError::new("spec.oci", "must reference an OCI image"));
            }
        }
        Object::Kernel(k) => {
            if k.spec.oci.is_empty() {
                errs.push(FieldError::new("spec.oci", "must reference an OCI image"));
            }
        }
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Kind, Uid, Volume};

    fn valid_vm() -> Object {
        let mut obj = Object::new(Kind::Vm);
        obj.set_name("v1");
        obj.set_uid(Uid::random());
        if let Object::Vm(vm) = &mut obj {
            vm.spec.image = "ubuntu:22.04".into();
            vm.spec.kernel = "vmfleet/kernel:5.15".into();
        }
        obj
    }

    #[test]
    fn test_valid_vm_passes() {
        assert!(validate(&valid_vm()).is_ok());
    }

    #[test]
    fn test_missing_identity_collects_both_errors() {
        let obj = Object::new(Kind::Vm);
        match validate(&obj) {
            Err(Error::Validation(errs)) => {
                let fields: Vec<_> = errs.iter().map(|e| e.field.as_str()).collect();
                assert!(fields.contains(&"metadata.name"));
                assert!(fields.contains(&"metadata.uid"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_volume_names_rejected() {
        let mut obj = valid_vm();
        if let Object::Vm(vm) = &mut obj {
            for _ in 0..2 {
                vm.spec.volumes.push(Volume {
                    name: "data".into(),
                    host_path: "/srv".into(),
                    read_only: false,
                });
            }
        }
        let err = validate(&obj).unwrap_err();
        assert!(err.to_string().contains("duplicate volume name"));
    }

    #[test]
    fn test_zero_cpus_rejected() {
        let mut obj = valid_vm();
        if let Object::Vm(vm) = &mut obj {
            vm.spec.cpus = 0;
        }
        assert!(validate(&obj).is_err());
    }
}
