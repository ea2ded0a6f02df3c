//! End-to-end builds against an in-memory cluster and a local stand-in for
//! the guest communicator.

#[path = "common/fixtures.rs"]
mod fixtures;

use std::net::Ipv4Addr;
use std::sync::Arc;

use kubevirt_builder::cluster::{ClusterError, ObjectRef, WatchEvent};
use kubevirt_builder::config::Communicator;
use kubevirt_builder::generator::{OsFamily, VM_NAME_LABEL};
use kubevirt_builder::resources::ObjectMeta;
use kubevirt_builder::resources::core::{Pod, PodStatus};
use kubevirt_builder::resources::kubevirt::{
    ExportPhase, VirtualMachine, VirtualMachineExport,
};
use kubevirt_builder::pipeline::{Runner, Step};
use kubevirt_builder::steps::{
    DeploySettings, DeployStep, ExportSettings, ExportStep, PortForwardStep, PortMapping,
    ProvisionSettings, ProvisionStep,
};
use kubevirt_builder::test_support::{FakeCluster, RecordingUi, ScriptedRunner, Verb};
use kubevirt_builder::{BuildContext, BuildError, BuildOrchestrator, BuilderConfig, ConfigError};
use rstest::{fixture, rstest};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use fixtures::{NAMESPACE, VM_NAME, export_in_phase, finished_job, ready_vm};

/// Listens like an SSH daemon: every connection gets a banner.
async fn banner_server() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind banner server");
    let port = listener.local_addr().expect("banner address").port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.ok();
            });
        }
    });
    port
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind port probe");
    listener.local_addr().expect("probe address").port()
}

fn launcher_pod() -> Pod {
    Pod {
        metadata: ObjectMeta::namespaced(NAMESPACE, "virt-launcher-img1-x7k2p")
            .with_label(VM_NAME_LABEL, VM_NAME),
        status: Some(PodStatus {
            phase: Some(String::from("Running")),
            pod_ip: Some(String::from("127.0.0.1")),
        }),
    }
}

/// Cluster whose VM, generify job, and export all become ready, with the
/// launcher pod pointing at a local listener.
fn healthy_cluster() -> Arc<FakeCluster> {
    let cluster = FakeCluster::new();
    cluster.insert(&launcher_pod());
    cluster.script_watch(
        &ObjectRef::namespaced(NAMESPACE, VM_NAME),
        vec![WatchEvent::Modified(ready_vm())],
    );
    cluster.script_watch(
        &ObjectRef::namespaced(NAMESPACE, "img1-libguestfs"),
        vec![WatchEvent::Modified(finished_job("img1-libguestfs", "Complete"))],
    );
    cluster.script_watch(
        &ObjectRef::namespaced(NAMESPACE, VM_NAME),
        vec![WatchEvent::Modified(export_in_phase(ExportPhase::Ready))],
    );
    Arc::new(cluster)
}

/// The orchestrator's steps, with the guest port redirected to `guest_port`.
fn steps_reaching(
    cluster: &Arc<FakeCluster>,
    runner: &Arc<ScriptedRunner>,
    config: &BuilderConfig,
    local: u16,
    guest_port: u16,
) -> Vec<Box<dyn Step>> {
    vec![
        Box::new(DeployStep::new(
            Arc::clone(cluster),
            config.vm_options().expect("vm options"),
            DeploySettings::from(config),
        )),
        Box::new(PortForwardStep::new(
            Arc::clone(cluster),
            PortMapping {
                local,
                remote: guest_port,
            },
        )),
        Box::new(ProvisionStep::new(
            Arc::clone(runner),
            ProvisionSettings::from_config(config).expect("provision settings"),
        )),
        Box::new(ExportStep::new(
            Arc::clone(cluster),
            ExportSettings::from(config),
        )),
    ]
}

#[fixture]
fn config() -> BuilderConfig {
    BuilderConfig {
        name: VM_NAME.to_owned(),
        namespace: NAMESPACE.to_owned(),
        os_preference: String::from("ubuntu"),
        source_url: String::from("https://images.example.com/ubuntu.img"),
        source_access_key_id: None,
        source_secret_access_key: None,
        disk_space: String::from("20Gi"),
        username: None,
        password: None,
        startup_script: None,
        startup_script_file: None,
        communicator: String::from("ssh"),
        ssh_port: 2222,
        winrm_port: 5389,
        connect_timeout_secs: 30,
        provisioner_command: Some(String::from("ansible-playbook site.yml")),
        deployment_timeout_secs: 600,
        generify_timeout_secs: 120,
        export_timeout_secs: 300,
        karpenter: false,
        warmup_secs: 120,
    }
}

#[rstest]
#[tokio::test]
async fn successful_build_produces_an_artifact_and_keeps_the_exported_vm(
    mut config: BuilderConfig,
) {
    let guest_port = banner_server().await;
    config.ssh_port = free_port().await;
    let cluster = healthy_cluster();
    let runner = Arc::new(ScriptedRunner::new());
    runner.push_exit_code(0);
    let ui = Arc::new(RecordingUi::default());

    let orchestrator = BuildOrchestrator::new(Arc::clone(&cluster), Arc::clone(&runner));
    let steps = orchestrator.steps(&config).expect("valid config");
    assert_eq!(
        steps.iter().map(|step| step.name()).collect::<Vec<_>>(),
        ["deploy", "port-forward", "provision", "export"]
    );

    let mut ctx = BuildContext::new(ui.clone());
    ctx.set_os_family(OsFamily::Linux);
    let mut pipeline = Runner::new(steps_reaching(
        &cluster,
        &runner,
        &config,
        config.ssh_port,
        guest_port,
    ));

    let report = pipeline.run(&mut ctx).await;

    assert!(!report.halted, "{:?}", ctx.error());
    assert_eq!(report.executed, ["deploy", "port-forward", "provision", "export"]);
    let artifact = ctx.artifact().expect("artifact");
    assert_eq!(artifact.namespace, NAMESPACE);
    assert_eq!(artifact.export_name, VM_NAME);

    let invocations = runner.invocations();
    let invocation = invocations.first().expect("provisioner ran");
    assert_eq!(invocation.program, "sh");
    assert_eq!(invocation.env_var("BUILDER_HOST"), Some("127.0.0.1"));
    let port = config.ssh_port.to_string();
    assert_eq!(invocation.env_var("BUILDER_PORT"), Some(port.as_str()));
    assert_eq!(invocation.env_var("BUILDER_USERNAME"), Some("packer"));
    assert_eq!(invocation.env_var("BUILDER_COMMUNICATOR"), Some("ssh"));

    let operations = cluster.operations();
    assert!(
        operations.contains(&String::from("list Pod build[vm.kubevirt.io/name=img1]")),
        "{operations:?}"
    );
    assert!(
        operations.contains(&String::from("portforward Pod build/virt-launcher-img1-x7k2p")),
        "{operations:?}"
    );
    assert_eq!(
        operations.last().map(String::as_str),
        Some("watch VirtualMachineExport build/img1")
    );
    assert!(
        cluster
            .operation_log()
            .iter()
            .all(|operation| operation.verb != Verb::Delete),
        "{operations:?}"
    );
    assert!(
        cluster
            .object::<VirtualMachine>(&ObjectRef::namespaced(NAMESPACE, VM_NAME))
            .is_some()
    );
    assert!(
        cluster
            .object::<VirtualMachineExport>(&ObjectRef::namespaced(NAMESPACE, VM_NAME))
            .is_some()
    );
    assert!(
        ui.messages()
            .iter()
            .any(|line| line == "Virtual Machine build/img1 is kept until its export is uploaded")
    );
}

#[rstest]
#[tokio::test]
async fn failing_provisioner_halts_before_export(mut config: BuilderConfig) {
    let guest_port = banner_server().await;
    config.ssh_port = free_port().await;
    let cluster = healthy_cluster();
    let runner = Arc::new(ScriptedRunner::new());
    runner.push_failure(2);
    let mut ctx = BuildContext::new(Arc::new(RecordingUi::default()));
    ctx.set_os_family(OsFamily::Linux);
    let mut pipeline = Runner::new(steps_reaching(&cluster, &runner, &config, 0, guest_port));

    let report = pipeline.run(&mut ctx).await;

    assert!(report.halted);
    assert_eq!(report.executed, ["deploy", "port-forward", "provision"]);
    let err = ctx.error().expect("failure recorded");
    assert!(
        err.to_string()
            .contains("provisioner `ansible-playbook site.yml` exited with status 2"),
        "{err}"
    );
    assert!(
        cluster
            .operation_log()
            .iter()
            .all(|operation| operation.verb != Verb::Stop)
    );
    assert!(
        cluster
            .object::<VirtualMachine>(&ObjectRef::namespaced(NAMESPACE, VM_NAME))
            .is_none()
    );
}

#[rstest]
#[tokio::test]
async fn missing_launcher_pod_halts_and_removes_the_vm(config: BuilderConfig) {
    let cluster = FakeCluster::new();
    cluster.script_watch(
        &ObjectRef::namespaced(NAMESPACE, VM_NAME),
        vec![WatchEvent::Modified(ready_vm())],
    );
    let cluster = Arc::new(cluster);
    let orchestrator =
        BuildOrchestrator::new(Arc::clone(&cluster), Arc::new(ScriptedRunner::new()));

    let err = orchestrator
        .execute(&config, Arc::new(RecordingUi::default()))
        .await
        .expect_err("no launcher pod");

    let BuildError::LauncherPod { vm, .. } = &err else {
        panic!("expected a launcher pod error, got {err}");
    };
    assert_eq!(vm, "build/img1");
    assert_eq!(
        cluster.operations().last().map(String::as_str),
        Some("delete VirtualMachine build/img1")
    );
}

#[rstest]
#[tokio::test]
async fn deploy_failure_is_returned_by_the_orchestrator(config: BuilderConfig) {
    let cluster = FakeCluster::new();
    cluster.fail_next(
        Verb::Create,
        "VirtualMachine",
        ClusterError::Api {
            operation: "create",
            kind: "VirtualMachine",
            target: String::from("build/img1"),
            status: 403,
            message: String::from("forbidden"),
        },
    );
    let cluster = Arc::new(cluster);
    let orchestrator =
        BuildOrchestrator::new(Arc::clone(&cluster), Arc::new(ScriptedRunner::new()));

    let err = orchestrator
        .execute(&config, Arc::new(RecordingUi::default()))
        .await
        .expect_err("create rejected");

    assert!(
        err.to_string()
            .starts_with("failed to create VirtualMachine build/img1"),
        "{err}"
    );
    assert_eq!(
        cluster.operations(),
        ["create Namespace build", "create VirtualMachine build/img1"]
    );
}

#[rstest]
#[case::communicator("communicator", "telnet")]
#[case::name("name", "")]
#[tokio::test]
async fn invalid_config_fails_before_any_cluster_call(
    mut config: BuilderConfig,
    #[case] field: &str,
    #[case] value: &str,
) {
    match field {
        "communicator" => config.communicator = value.to_owned(),
        _ => config.name = value.to_owned(),
    }
    let cluster = Arc::new(FakeCluster::new());
    let orchestrator =
        BuildOrchestrator::new(Arc::clone(&cluster), Arc::new(ScriptedRunner::new()));

    let err = orchestrator
        .execute(&config, Arc::new(RecordingUi::default()))
        .await
        .expect_err("config rejected");

    assert!(
        matches!(
            err,
            BuildError::Config(ConfigError::Invalid(_) | ConfigError::MissingField(_))
        ),
        "{err}"
    );
    assert!(cluster.operations().is_empty());
}

#[rstest]
fn winrm_builds_forward_the_winrm_port(mut config: BuilderConfig) {
    config.communicator = String::from("winrm");
    let mapping = PortMapping::from_config(&config).expect("mapping");
    assert_eq!(mapping.local, 5389);
    assert_eq!(mapping.remote, 5985);
    assert_eq!(config.communicator(), Ok(Communicator::WinRm));
}
