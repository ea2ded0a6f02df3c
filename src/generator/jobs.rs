//! Batch jobs supporting the build: disk generify and capacity warm-up.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::resources::batch::{Job, JobSpec};
use crate::resources::core::{
    Container, EnvVar, PodSecurityContext, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use crate::resources::kubevirt::VirtualMachine;
use crate::resources::{ObjectMeta, OwnerReference, ResourceRequirements};

use super::{
    builder_node_selector, builder_tolerations, guestfs_job_name, source_volume_name,
    warmup_job_name,
};

const GUESTFS_IMAGE: &str = "quay.io/kubevirt/libguestfs-tools:v1.1.1";
const DISK_VOLUME: &str = "vm-disk";
const DISK_PATH: &str = "/disk";
const TMP_VOLUME: &str = "libguestfs-tmp-dir";
const TMP_PATH: &str = "/tmp/guestfs";
const HOME_VOLUME: &str = "libguestfs-home-dir";
const HOME_PATH: &str = "/home/guestfs";
const GUESTFS_TTL_SECS: i32 = 30;

const WARMUP_IMAGE: &str = "yauritux/busybox-curl";

/// Runs `virt-sysprep` against the VM's primary disk claim to strip
/// machine identity, keeping the provisioning account.
#[must_use]
pub fn guestfs_job(vm: &VirtualMachine) -> Job {
    let vm_name = &vm.metadata.name;
    let namespace = vm.metadata.namespace.as_deref().unwrap_or_default();

    let command = [
        "virt-sysprep",
        "--verbose",
        "--add",
        "/disk/disk.img",
        "--network",
        "--enable",
        "bash-history,machine-id,user-account",
        "--keep-user-accounts",
        "packer",
    ]
    .iter()
    .map(|arg| (*arg).to_owned())
    .collect();

    Job {
        metadata: ObjectMeta::namespaced(namespace, &guestfs_job_name(vm_name))
            .owned_by(OwnerReference::controller_of(vm)),
        spec: JobSpec {
            ttl_seconds_after_finished: Some(GUESTFS_TTL_SECS),
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                spec: PodSpec {
                    restart_policy: Some(String::from("Never")),
                    node_selector: builder_node_selector(),
                    tolerations: builder_tolerations(),
                    security_context: Some(PodSecurityContext {
                        run_as_user: Some(0),
                    }),
                    containers: vec![Container {
                        name: String::from("libguestfs"),
                        image: GUESTFS_IMAGE.to_owned(),
                        command,
                        env: vec![
                            EnvVar::literal("LIBGUESTFS_BACKEND", "direct"),
                            EnvVar::literal("LIBGUESTFS_PATH", "/usr/local/lib/guestfs/appliance"),
                            EnvVar::literal("LIBGUESTFS_TMPDIR", TMP_PATH),
                            EnvVar::literal("HOME", HOME_PATH),
                        ],
                        volume_mounts: vec![
                            VolumeMount::new(DISK_VOLUME, DISK_PATH),
                            VolumeMount::new(TMP_VOLUME, TMP_PATH),
                            VolumeMount::new(HOME_VOLUME, HOME_PATH),
                        ],
                        resources: Some(ResourceRequirements {
                            requests: BTreeMap::new(),
                            limits: BTreeMap::from([(
                                String::from("devices.kubevirt.io/kvm"),
                                String::from("1"),
                            )]),
                        }),
                        ..Container::default()
                    }],
                    volumes: vec![
                        Volume::claim(DISK_VOLUME, &source_volume_name(vm_name)),
                        Volume::empty_dir(TMP_VOLUME),
                        Volume::empty_dir(HOME_VOLUME),
                    ],
                    ..PodSpec::default()
                },
            },
        },
        status: None,
    }
}

/// Placeholder workload that makes the autoscaler provision a node before
/// the VM is scheduled. It sleeps for `lifetime` and is reaped as soon as it
/// finishes.
#[must_use]
pub fn warmup_job(namespace: &str, vm_name: &str, lifetime: Duration, karpenter: bool) -> Job {
    let (node_selector, tolerations) = if karpenter {
        (builder_node_selector(), builder_tolerations())
    } else {
        (BTreeMap::new(), Vec::new())
    };

    Job {
        metadata: ObjectMeta::namespaced(namespace, &warmup_job_name(vm_name)),
        spec: JobSpec {
            ttl_seconds_after_finished: Some(0),
            backoff_limit: None,
            template: PodTemplateSpec {
                spec: PodSpec {
                    restart_policy: Some(String::from("Never")),
                    node_selector,
                    tolerations,
                    containers: vec![Container {
                        name: String::from("busybox"),
                        image: WARMUP_IMAGE.to_owned(),
                        command: vec![String::from("sleep"), lifetime.as_secs().to_string()],
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                },
            },
        },
        status: None,
    }
}
