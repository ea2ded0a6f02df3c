//! Pure resource-spec generation.
//!
//! Every function in this module maps declarative options to cluster object
//! descriptions without performing I/O. Output is deterministic for a given
//! input, except for randomly generated passwords and export tokens.

mod export;
mod jobs;
mod nodepool;
mod secrets;
mod upload;
mod vm;

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::resources::Toleration;

pub use export::virtual_machine_export;
pub use jobs::{guestfs_job, warmup_job};
pub use nodepool::{NODE_POOL_NAME, builder_node_pool};
pub use secrets::{
    EXPORT_TOKEN_KEY, export_token_secret, s3_credentials_secret, startup_script_secret,
    user_credentials_secret,
};
pub use upload::{EXPORT_TOKEN_HEADER, UploaderOptions, uploader_job, uploader_secret};
pub use vm::virtual_machine;

/// Length of generated passwords and export tokens.
pub const GENERATED_SECRET_LENGTH: usize = 20;

/// Label and taint key reserving nodes for image builds.
pub const BUILDER_NODE_LABEL: &str = "pelo.tech/uki-labs";
/// Value of [`BUILDER_NODE_LABEL`].
pub const BUILDER_NODE_VALUE: &str = "builder";

/// Label KubeVirt puts on the launcher pod of a VM.
pub const VM_NAME_LABEL: &str = "vm.kubevirt.io/name";

const TOKEN_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Guest operating system family.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OsFamily {
    /// Cloud image booted with cloud-init.
    Linux,
    /// Installer ISO driven by an unattended answer file.
    Windows,
}

impl OsFamily {
    /// Derives the family from a cluster preference name.
    #[must_use]
    pub fn from_preference(preference: &str) -> Self {
        if preference.to_ascii_lowercase().contains("windows") {
            Self::Windows
        } else {
            Self::Linux
        }
    }
}

/// Object-storage access key pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectStoreCredentials {
    /// Access key identifier.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
}

/// Where the source image is imported from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageSource {
    /// Image URL.
    pub url: String,
    /// Key pair; when present the URL is fetched as an object-storage source.
    pub credentials: Option<ObjectStoreCredentials>,
}

/// Guest user injected through the guest agent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UserCredentials {
    /// Guest username.
    pub username: String,
    /// Password; generated when `None`.
    pub password: Option<String>,
}

/// Immutable description of the VM to build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VirtualMachineOptions {
    /// VM name.
    pub name: String,
    /// Target namespace.
    pub namespace: String,
    /// Cluster preference name.
    pub os_preference: String,
    /// Source image.
    pub image: ImageSource,
    /// Primary disk size, for example `20Gi`.
    pub disk_space: String,
    /// Optional guest user.
    pub credentials: Option<UserCredentials>,
    /// First-boot payload for the OS family.
    pub startup_script: String,
}

impl VirtualMachineOptions {
    /// OS family derived from the preference.
    #[must_use]
    pub fn os_family(&self) -> OsFamily {
        OsFamily::from_preference(&self.os_preference)
    }
}

/// Secrets derived from a VM name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecretPurpose {
    /// Guest user password.
    UserCredentials,
    /// Object-storage key pair for the image import.
    S3Credentials,
    /// Cloud-init or sysprep payload.
    StartupScripts,
    /// Export download token.
    ExportToken,
}

impl SecretPurpose {
    const fn suffix(self) -> &'static str {
        match self {
            Self::UserCredentials => "user-credentials",
            Self::S3Credentials => "s3-credentials",
            Self::StartupScripts => "startup-scripts",
            Self::ExportToken => "export-token",
        }
    }
}

/// `<vm>-<purpose>` secret name.
#[must_use]
pub fn secret_name(vm_name: &str, purpose: SecretPurpose) -> String {
    format!("{vm_name}-{}", purpose.suffix())
}

/// Name of the data volume holding the imported source image.
#[must_use]
pub fn source_volume_name(vm_name: &str) -> String {
    format!("{vm_name}-source")
}

/// Name of the data volume holding the Windows virtio drivers.
#[must_use]
pub fn virtio_volume_name(vm_name: &str) -> String {
    format!("{vm_name}-virtio-drivers")
}

/// Name of the generify job.
#[must_use]
pub fn guestfs_job_name(vm_name: &str) -> String {
    format!("{vm_name}-libguestfs")
}

/// Name of the capacity warm-up job.
#[must_use]
pub fn warmup_job_name(vm_name: &str) -> String {
    format!("{vm_name}-init")
}

/// Random string of `length` characters drawn from a 64-symbol URL-safe
/// alphabet.
#[must_use]
pub fn random_token(length: usize) -> String {
    let mut token = String::with_capacity(length);
    while token.len() < length {
        let bytes = Uuid::new_v4().into_bytes();
        // Bytes 6 and 8 carry the fixed version and variant bits.
        for (index, byte) in bytes.iter().enumerate() {
            if index == 6 || index == 8 {
                continue;
            }
            if token.len() == length {
                break;
            }
            if let Some(symbol) = TOKEN_ALPHABET.get(usize::from(byte & 0x3f)) {
                token.push(char::from(*symbol));
            }
        }
    }
    token
}

pub(crate) fn builder_node_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(
        BUILDER_NODE_LABEL.to_owned(),
        BUILDER_NODE_VALUE.to_owned(),
    )])
}

pub(crate) fn builder_tolerations() -> Vec<Toleration> {
    vec![Toleration {
        key: BUILDER_NODE_LABEL.to_owned(),
        operator: Some(String::from("Equal")),
        value: Some(BUILDER_NODE_VALUE.to_owned()),
        effect: Some(String::from("NoSchedule")),
    }]
}
