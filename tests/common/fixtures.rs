//! Objects and settings shared by the orchestrator tests.

use std::sync::Arc;
use std::time::Duration;

use kubevirt_builder::BuildContext;
use kubevirt_builder::generator::{ImageSource, OsFamily, VirtualMachineOptions, virtual_machine};
use kubevirt_builder::resources::Condition;
use kubevirt_builder::resources::batch::{Job, JobStatus};
use kubevirt_builder::resources::kubevirt::{
    ExportFormat, ExportLink, ExportLinks, ExportPhase, ExportStatus, ExportVolume,
    VirtualMachine, VirtualMachineExport, VirtualMachineStatus,
};
use kubevirt_builder::steps::{DeploySettings, ExportSettings};
use kubevirt_builder::test_support::RecordingUi;

pub const NAMESPACE: &str = "build";
pub const VM_NAME: &str = "img1";
pub const GZIP_URL: &str =
    "https://virt-export-img1.build.svc/volumes/img1-source/disk.img.gz";

pub fn condition(type_: &str, status: &str) -> Condition {
    Condition {
        type_: type_.to_owned(),
        status: status.to_owned(),
        message: None,
        reason: None,
    }
}

pub fn linux_options() -> VirtualMachineOptions {
    VirtualMachineOptions {
        name: VM_NAME.to_owned(),
        namespace: NAMESPACE.to_owned(),
        os_preference: String::from("ubuntu"),
        image: ImageSource {
            url: String::from("https://images.example.com/ubuntu.img"),
            credentials: None,
        },
        disk_space: String::from("20Gi"),
        credentials: None,
        startup_script: String::from("#cloud-config\n"),
    }
}

pub const fn deploy_settings() -> DeploySettings {
    DeploySettings {
        karpenter: false,
        warmup: Duration::from_secs(120),
        deployment_timeout: Duration::from_secs(600),
    }
}

pub const fn export_settings() -> ExportSettings {
    ExportSettings {
        generify_timeout: Duration::from_secs(120),
        export_timeout: Duration::from_secs(300),
    }
}

pub fn ready_vm() -> VirtualMachine {
    let mut vm = virtual_machine(&linux_options());
    vm.status = Some(VirtualMachineStatus {
        conditions: vec![condition("Ready", "True")],
    });
    vm
}

pub fn finished_job(name: &str, outcome: &str) -> Job {
    Job {
        metadata: kubevirt_builder::resources::ObjectMeta::namespaced(NAMESPACE, name),
        status: Some(JobStatus {
            conditions: vec![condition(outcome, "True")],
        }),
        ..Job::default()
    }
}

pub fn export_in_phase(phase: ExportPhase) -> VirtualMachineExport {
    let mut export = kubevirt_builder::generator::virtual_machine_export(&ready_vm());
    export.status = Some(ExportStatus {
        phase: Some(phase),
        links: None,
    });
    export
}

pub fn published_export(cert: Option<&str>) -> VirtualMachineExport {
    let mut export = export_in_phase(ExportPhase::Ready);
    export.status = Some(ExportStatus {
        phase: Some(ExportPhase::Ready),
        links: Some(ExportLinks {
            internal: Some(ExportLink {
                cert: cert.map(str::to_owned),
                volumes: vec![ExportVolume {
                    name: String::from("img1-source"),
                    formats: vec![
                        ExportFormat {
                            format: String::from("raw"),
                            url: String::from(
                                "https://virt-export-img1.build.svc/volumes/img1-source/disk.img",
                            ),
                        },
                        ExportFormat {
                            format: String::from("kubevirt-gzip"),
                            url: GZIP_URL.to_owned(),
                        },
                    ],
                }],
            }),
            external: None,
        }),
    });
    export
}

/// Context as left by the deploy step for a Linux VM.
pub fn deployed_context(ui: Arc<RecordingUi>, family: OsFamily) -> BuildContext {
    let mut ctx = BuildContext::new(ui);
    ctx.set_os_family(family);
    ctx.set_vm(ready_vm());
    ctx
}
