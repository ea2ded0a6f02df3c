//! Virtual machine generation.
//!
//! Linux guests boot the imported cloud image directly with a cloud-init
//! volume. Windows guests install from the imported ISO onto an empty disk,
//! loading virtio drivers and a sysprep answer file from extra CD-ROMs. The
//! drive order on Windows must match the drive letters the answer file
//! expects (D: installer, E: drivers, F: sysprep).

use std::collections::BTreeMap;

use crate::resources::kubevirt::{
    AccessCredential, CloudInitNoCloud, CredentialSource, DataVolumeSource, DataVolumeSpec,
    DataVolumeTemplate, Devices, Disk, DiskTarget, DomainSpec, Empty, EmptyDisk, ExecAction,
    HttpSource, InstanceSpec, InstanceTemplate, Interface, Network, PreferenceMatcher, Probe,
    PropagationMethod, S3Source, SecretName, StorageSpec, SysprepSource, UserPasswordCredential,
    VirtualMachine, VirtualMachineSpec, VmVolume,
};
use crate::resources::{LocalObjectReference, ObjectMeta, ResourceRequirements};

use super::{
    OsFamily, SecretPurpose, VirtualMachineOptions, builder_node_selector, builder_tolerations,
    secret_name, source_volume_name, virtio_volume_name,
};

const PRIMARY: &str = "primary";
const CLOUD_INIT: &str = "cloud-init";
const ISO_INSTALL: &str = "iso-install";
const VIRTIO_DRIVERS: &str = "virtio-drivers";
const SYSPREP_INIT: &str = "sysprep-init";
const POD_NETWORK: &str = "default";

const VIRTIO_DRIVERS_URL: &str =
    "https://fedorapeople.org/groups/virt/virtio-win/direct-downloads/stable-virtio/virtio-win.iso";
const VIRTIO_DRIVERS_SIZE: &str = "1Gi";

/// Builds the VM for `opts`.
#[must_use]
pub fn virtual_machine(opts: &VirtualMachineOptions) -> VirtualMachine {
    let family = opts.os_family();

    let access_credentials = opts
        .credentials
        .as_ref()
        .map(|_| {
            vec![AccessCredential {
                user_password: UserPasswordCredential {
                    source: CredentialSource {
                        secret: SecretName {
                            secret_name: secret_name(&opts.name, SecretPurpose::UserCredentials),
                        },
                    },
                    propagation_method: PropagationMethod {
                        qemu_guest_agent: Empty {},
                    },
                },
            }]
        })
        .unwrap_or_default();

    VirtualMachine {
        metadata: ObjectMeta::namespaced(&opts.namespace, &opts.name),
        spec: VirtualMachineSpec {
            running: Some(true),
            preference: Some(PreferenceMatcher {
                kind: String::from("VirtualMachineClusterPreference"),
                name: opts.os_preference.clone(),
            }),
            data_volume_templates: data_volume_templates(family, opts),
            template: InstanceTemplate {
                spec: InstanceSpec {
                    domain: DomainSpec {
                        resources: ResourceRequirements {
                            requests: BTreeMap::from([
                                (String::from("cpu"), String::from("4")),
                                (String::from("memory"), String::from("8Gi")),
                            ]),
                            limits: BTreeMap::new(),
                        },
                        devices: Devices {
                            disks: disks(family),
                            interfaces: vec![Interface {
                                name: POD_NETWORK.to_owned(),
                                masquerade: Some(Empty {}),
                            }],
                        },
                    },
                    volumes: volumes(family, opts),
                    networks: vec![Network {
                        name: POD_NETWORK.to_owned(),
                        pod: Some(Empty {}),
                    }],
                    node_selector: builder_node_selector(),
                    tolerations: builder_tolerations(),
                    readiness_probe: Some(Probe {
                        exec: ExecAction {
                            command: probe_command(family),
                        },
                        initial_delay_seconds: 30,
                        period_seconds: 10,
                    }),
                    access_credentials,
                },
            },
        },
        status: None,
    }
}

fn probe_command(family: OsFamily) -> Vec<String> {
    let argv: &[&str] = match family {
        OsFamily::Linux => &["cloud-init", "status"],
        OsFamily::Windows => &[
            "cmd",
            "/c",
            "findstr",
            "IMAGE_STATE_COMPLETE",
            // Guest-exec JSON breaks on backslashes; Windows accepts `/`.
            "%SystemRoot%/Setup/State/state.ini",
        ],
    };
    argv.iter().map(|arg| (*arg).to_owned()).collect()
}

fn disk(name: &str, bus: &str) -> Disk {
    Disk {
        name: name.to_owned(),
        disk: Some(DiskTarget {
            bus: bus.to_owned(),
        }),
        ..Disk::default()
    }
}

fn cdrom(name: &str, boot_order: Option<u32>) -> Disk {
    Disk {
        name: name.to_owned(),
        boot_order,
        cdrom: Some(DiskTarget {
            bus: String::from("sata"),
        }),
        ..Disk::default()
    }
}

fn disks(family: OsFamily) -> Vec<Disk> {
    match family {
        OsFamily::Linux => vec![disk(PRIMARY, "virtio"), disk(CLOUD_INIT, "virtio")],
        OsFamily::Windows => vec![
            disk(PRIMARY, "sata"),
            cdrom(ISO_INSTALL, Some(1)),
            cdrom(VIRTIO_DRIVERS, None),
            cdrom(SYSPREP_INIT, None),
        ],
    }
}

fn data_volume(name: &str, volume: &str) -> VmVolume {
    VmVolume {
        name: name.to_owned(),
        data_volume: Some(LocalObjectReference::new(volume)),
        ..VmVolume::default()
    }
}

fn volumes(family: OsFamily, opts: &VirtualMachineOptions) -> Vec<VmVolume> {
    let scripts = LocalObjectReference::new(secret_name(&opts.name, SecretPurpose::StartupScripts));
    match family {
        OsFamily::Linux => vec![
            data_volume(PRIMARY, &source_volume_name(&opts.name)),
            VmVolume {
                name: CLOUD_INIT.to_owned(),
                cloud_init_no_cloud: Some(CloudInitNoCloud {
                    user_data_secret_ref: scripts,
                }),
                ..VmVolume::default()
            },
        ],
        OsFamily::Windows => vec![
            VmVolume {
                name: PRIMARY.to_owned(),
                empty_disk: Some(EmptyDisk {
                    capacity: opts.disk_space.clone(),
                }),
                ..VmVolume::default()
            },
            data_volume(ISO_INSTALL, &source_volume_name(&opts.name)),
            data_volume(VIRTIO_DRIVERS, &virtio_volume_name(&opts.name)),
            VmVolume {
                name: SYSPREP_INIT.to_owned(),
                sysprep: Some(SysprepSource { secret: scripts }),
                ..VmVolume::default()
            },
        ],
    }
}

fn data_volume_template(name: String, size: &str, source: DataVolumeSource) -> DataVolumeTemplate {
    DataVolumeTemplate {
        metadata: ObjectMeta {
            name,
            ..ObjectMeta::default()
        },
        spec: DataVolumeSpec {
            storage: StorageSpec {
                access_modes: vec![String::from("ReadWriteOnce")],
                resources: ResourceRequirements {
                    requests: BTreeMap::from([(String::from("storage"), size.to_owned())]),
                    limits: BTreeMap::new(),
                },
            },
            source,
        },
    }
}

fn image_source(opts: &VirtualMachineOptions) -> DataVolumeSource {
    match &opts.image.credentials {
        Some(_) => DataVolumeSource {
            s3: Some(S3Source {
                url: opts.image.url.clone(),
                secret_ref: Some(secret_name(&opts.name, SecretPurpose::S3Credentials)),
            }),
            http: None,
        },
        None => DataVolumeSource {
            http: Some(HttpSource {
                url: opts.image.url.clone(),
            }),
            s3: None,
        },
    }
}

fn data_volume_templates(family: OsFamily, opts: &VirtualMachineOptions) -> Vec<DataVolumeTemplate> {
    let mut templates = vec![data_volume_template(
        source_volume_name(&opts.name),
        &opts.disk_space,
        image_source(opts),
    )];

    if family == OsFamily::Windows {
        templates.push(data_volume_template(
            virtio_volume_name(&opts.name),
            VIRTIO_DRIVERS_SIZE,
            DataVolumeSource {
                http: Some(HttpSource {
                    url: VIRTIO_DRIVERS_URL.to_owned(),
                }),
                s3: None,
            },
        ));
    }

    templates
}
