//! Secrets owned by the VM or the export.

use std::collections::BTreeMap;

use crate::resources::core::Secret;
use crate::resources::kubevirt::{VirtualMachine, VirtualMachineExport};
use crate::resources::{ObjectMeta, OwnerReference, Resource};

use super::{
    GENERATED_SECRET_LENGTH, OsFamily, SecretPurpose, VirtualMachineOptions, random_token,
    secret_name,
};

/// Key holding the export download token.
pub const EXPORT_TOKEN_KEY: &str = "token";

fn owned_secret<R: Resource>(
    owner: &R,
    name: String,
    string_data: BTreeMap<String, String>,
) -> Secret {
    let namespace = owner.metadata().namespace.clone();
    Secret {
        metadata: ObjectMeta {
            name,
            namespace,
            ..ObjectMeta::default()
        }
        .owned_by(OwnerReference::controller_of(owner)),
        type_: Some(String::from("Opaque")),
        string_data,
    }
}

/// Cloud-init (`userData`) or sysprep (`autounattend.xml`) payload.
#[must_use]
pub fn startup_script_secret(vm: &VirtualMachine, opts: &VirtualMachineOptions) -> Secret {
    let key = match opts.os_family() {
        OsFamily::Linux => "userData",
        OsFamily::Windows => "autounattend.xml",
    };
    owned_secret(
        vm,
        secret_name(&opts.name, SecretPurpose::StartupScripts),
        BTreeMap::from([(key.to_owned(), opts.startup_script.clone())]),
    )
}

/// Object-storage key pair for the image import, when one was supplied.
#[must_use]
pub fn s3_credentials_secret(vm: &VirtualMachine, opts: &VirtualMachineOptions) -> Option<Secret> {
    let credentials = opts.image.credentials.as_ref()?;
    Some(owned_secret(
        vm,
        secret_name(&opts.name, SecretPurpose::S3Credentials),
        BTreeMap::from([
            (
                String::from("accessKeyId"),
                credentials.access_key_id.clone(),
            ),
            (
                String::from("secretKey"),
                credentials.secret_access_key.clone(),
            ),
        ]),
    ))
}

/// Guest user password, generated when none was supplied.
///
/// Returns the secret together with the effective password so callers can
/// hand it to the provisioner.
#[must_use]
pub fn user_credentials_secret(
    vm: &VirtualMachine,
    opts: &VirtualMachineOptions,
) -> Option<(Secret, String)> {
    let credentials = opts.credentials.as_ref()?;
    let password = credentials
        .password
        .clone()
        .unwrap_or_else(|| random_token(GENERATED_SECRET_LENGTH));
    let secret = owned_secret(
        vm,
        secret_name(&opts.name, SecretPurpose::UserCredentials),
        BTreeMap::from([(credentials.username.clone(), password.clone())]),
    );
    Some((secret, password))
}

/// Download token referenced by the export's `tokenSecretRef`.
#[must_use]
pub fn export_token_secret(export: &VirtualMachineExport, token: &str) -> Secret {
    let name = export
        .spec
        .token_secret_ref
        .clone()
        .unwrap_or_else(|| secret_name(&export.metadata.name, SecretPurpose::ExportToken));
    owned_secret(
        export,
        name,
        BTreeMap::from([(EXPORT_TOKEN_KEY.to_owned(), token.to_owned())]),
    )
}
