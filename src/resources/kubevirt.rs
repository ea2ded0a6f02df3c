//! KubeVirt and CDI objects: virtual machines, data volume templates, and
//! exports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    Condition, LocalObjectReference, ObjectMeta, ResourceRequirements, Toleration, impl_resource,
};

/// Virtual machine object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VirtualMachine {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    #[serde(default)]
    pub spec: VirtualMachineSpec,
    /// Observed state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VirtualMachineStatus>,
}

impl_resource!(
    VirtualMachine,
    "kubevirt.io/v1",
    "VirtualMachine",
    "virtualmachines",
    true
);

impl VirtualMachine {
    /// Status conditions, empty until the controller reports any.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }
}

/// Desired virtual machine state.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Whether the instance should be running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    /// Instance-type preference applied by the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<PreferenceMatcher>,
    /// Data volumes created alongside the VM.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_volume_templates: Vec<DataVolumeTemplate>,
    /// Instance template.
    #[serde(default)]
    pub template: InstanceTemplate,
}

/// Reference to a (cluster) preference.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PreferenceMatcher {
    /// Preference kind.
    pub kind: String,
    /// Preference name.
    pub name: String,
}

/// Observed virtual machine state.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VirtualMachineStatus {
    /// Status conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Data volume created and owned by the VM.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DataVolumeTemplate {
    /// Data volume metadata; only the name is set.
    pub metadata: ObjectMeta,
    /// Import specification.
    pub spec: DataVolumeSpec,
}

/// Data volume import specification.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DataVolumeSpec {
    /// Backing storage.
    pub storage: StorageSpec,
    /// Import source.
    pub source: DataVolumeSource,
}

/// Storage request for a data volume.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Access modes (for example `ReadWriteOnce`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    /// Size request.
    pub resources: ResourceRequirements,
}

/// Data volume import source; exactly one field is set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DataVolumeSource {
    /// Plain HTTP(S) download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSource>,
    /// Object-storage download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Source>,
}

/// HTTP import source.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct HttpSource {
    /// Image URL.
    pub url: String,
}

/// Object-storage import source.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3Source {
    /// Object URL.
    pub url: String,
    /// Secret with `accessKeyId`/`secretKey`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

/// Instance template embedded in the VM.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct InstanceTemplate {
    /// Instance specification.
    pub spec: InstanceSpec,
}

/// Instance specification.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Virtual hardware.
    pub domain: DomainSpec,
    /// Volumes backing the domain disks.
    #[serde(default)]
    pub volumes: Vec<VmVolume>,
    /// Networks attached to the interfaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,
    /// Node label constraints.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Taints the launcher pod tolerates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Guest readiness probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
    /// Credentials propagated into the guest.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_credentials: Vec<AccessCredential>,
}

/// Virtual hardware.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DomainSpec {
    /// Compute requests.
    pub resources: ResourceRequirements,
    /// Attached devices.
    pub devices: Devices,
}

/// Attached devices.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Devices {
    /// Disks, each backed by the volume of the same name.
    #[serde(default)]
    pub disks: Vec<Disk>,
    /// Network interfaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
}

/// Disk device.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Disk name, matching a volume name.
    pub name: String,
    /// Boot priority, lower boots first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<u32>,
    /// Attached as a hard disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskTarget>,
    /// Attached as an optical drive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdrom: Option<DiskTarget>,
}

/// Bus a disk device is attached to.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DiskTarget {
    /// `virtio` or `sata`.
    pub bus: String,
}

/// Network interface.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Interface {
    /// Interface name, matching a network name.
    pub name: String,
    /// NAT binding behind the pod address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masquerade: Option<Empty>,
}

/// Network definition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Network {
    /// Network name.
    pub name: String,
    /// The pod network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<Empty>,
}

/// Marker object serialised as `{}`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Empty {}

/// Volume backing a disk.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmVolume {
    /// Volume name.
    pub name: String,
    /// Data volume created from a template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<LocalObjectReference>,
    /// Blank disk of the given capacity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_disk: Option<EmptyDisk>,
    /// `NoCloud` cloud-init source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init_no_cloud: Option<CloudInitNoCloud>,
    /// Windows sysprep answer file source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysprep: Option<SysprepSource>,
}

/// Blank disk.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EmptyDisk {
    /// Capacity quantity, for example `20Gi`.
    pub capacity: String,
}

/// `NoCloud` user data source.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloudInitNoCloud {
    /// Secret holding the `userData` key.
    pub user_data_secret_ref: LocalObjectReference,
}

/// Sysprep source.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SysprepSource {
    /// Secret holding `autounattend.xml`.
    pub secret: LocalObjectReference,
}

/// Guest readiness probe.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    /// Command executed through the guest agent.
    pub exec: ExecAction,
    /// Delay before the first probe.
    pub initial_delay_seconds: i32,
    /// Interval between probes.
    pub period_seconds: i32,
}

/// Command to execute.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExecAction {
    /// Argument vector.
    pub command: Vec<String>,
}

/// Credential propagated into the guest.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessCredential {
    /// Username/password pairs read from a secret.
    pub user_password: UserPasswordCredential,
}

/// Username/password credential.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserPasswordCredential {
    /// Secret source.
    pub source: CredentialSource,
    /// Propagation mechanism.
    pub propagation_method: PropagationMethod,
}

/// Secret-backed credential source.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CredentialSource {
    /// Secret reference.
    pub secret: SecretName,
}

/// Secret referenced by `secretName`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretName {
    /// Secret name.
    pub secret_name: String,
}

/// Credential propagation via the QEMU guest agent.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PropagationMethod {
    /// Guest agent propagation.
    pub qemu_guest_agent: Empty,
}

/// Export of a VM's volumes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VirtualMachineExport {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Desired export.
    #[serde(default)]
    pub spec: ExportSpec,
    /// Observed export state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExportStatus>,
}

impl_resource!(
    VirtualMachineExport,
    "export.kubevirt.io/v1beta1",
    "VirtualMachineExport",
    "virtualmachineexports",
    true
);

impl VirtualMachineExport {
    /// Current phase, if the controller has reported one.
    #[must_use]
    pub fn phase(&self) -> Option<ExportPhase> {
        self.status.as_ref().and_then(|status| status.phase)
    }

    /// Cluster-internal download links.
    #[must_use]
    pub fn internal_links(&self) -> Option<&ExportLink> {
        self.status
            .as_ref()
            .and_then(|status| status.links.as_ref())
            .and_then(|links| links.internal.as_ref())
    }
}

/// Desired export.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportSpec {
    /// Exported object.
    pub source: TypedLocalObjectReference,
    /// Secret holding the download token under `token`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret_ref: Option<String>,
}

/// Reference to an object of a given kind in the same namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypedLocalObjectReference {
    /// API group of the referenced kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// Referenced kind.
    pub kind: String,
    /// Referenced name.
    pub name: String,
}

/// Export lifecycle phase.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum ExportPhase {
    /// Export server starting.
    Pending,
    /// Links are servable.
    Ready,
    /// Source could not be exported.
    Skipped,
    /// Export ended.
    Terminated,
    /// Phase not known to this client.
    #[serde(other)]
    Unknown,
}

/// Observed export state.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExportStatus {
    /// Current phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ExportPhase>,
    /// Download links once ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<ExportLinks>,
}

/// Internal and external link sets.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExportLinks {
    /// Links reachable from inside the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<ExportLink>,
    /// Links reachable through an ingress or route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExportLink>,
}

/// One link set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExportLink {
    /// PEM certificate of the export server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    /// Exported volumes.
    #[serde(default)]
    pub volumes: Vec<ExportVolume>,
}

impl ExportLink {
    /// URL of `volume` in `format`, if published.
    #[must_use]
    pub fn url_for(&self, volume: &str, format: &str) -> Option<&str> {
        self.volumes
            .iter()
            .filter(|entry| entry.name == volume)
            .flat_map(|entry| entry.formats.iter())
            .find(|entry| entry.format == format)
            .map(|entry| entry.url.as_str())
    }
}

/// Exported volume.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExportVolume {
    /// Volume name.
    pub name: String,
    /// Available download formats.
    #[serde(default)]
    pub formats: Vec<ExportFormat>,
}

/// Download format and URL.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExportFormat {
    /// Format name, for example `kubevirt-gzip`.
    pub format: String,
    /// Download URL.
    pub url: String,
}
