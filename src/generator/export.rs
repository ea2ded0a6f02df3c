//! Export of the built VM.

use crate::resources::kubevirt::{
    ExportSpec, TypedLocalObjectReference, VirtualMachine, VirtualMachineExport,
};
use crate::resources::{ObjectMeta, Resource};

use super::{SecretPurpose, secret_name};

/// Export named after `vm`, protected by the `<vm>-export-token` secret.
#[must_use]
pub fn virtual_machine_export(vm: &VirtualMachine) -> VirtualMachineExport {
    let name = &vm.metadata.name;
    VirtualMachineExport {
        metadata: ObjectMeta {
            name: name.clone(),
            namespace: vm.metadata.namespace.clone(),
            ..ObjectMeta::default()
        },
        spec: ExportSpec {
            source: TypedLocalObjectReference {
                api_group: Some(String::from("kubevirt.io")),
                kind: VirtualMachine::KIND.to_owned(),
                name: name.clone(),
            },
            token_secret_ref: Some(secret_name(name, SecretPurpose::ExportToken)),
        },
        status: None,
    }
}
