//! Export step behaviour against an in-memory cluster.

#[path = "common/fixtures.rs"]
mod fixtures;

use std::sync::Arc;

use kubevirt_builder::cluster::{ObjectRef, WatchEvent};
use kubevirt_builder::generator::{OsFamily, virtual_machine_export};
use kubevirt_builder::pipeline::{Runner, Step, StepAction};
use kubevirt_builder::resources::batch::Job;
use kubevirt_builder::resources::core::Secret;
use kubevirt_builder::resources::kubevirt::{ExportPhase, VirtualMachineExport};
use kubevirt_builder::steps::ExportStep;
use kubevirt_builder::test_support::{FakeCluster, RecordingUi, Verb};
use rstest::{fixture, rstest};

use fixtures::{
    NAMESPACE, VM_NAME, deployed_context, export_in_phase, export_settings, finished_job,
    ready_vm,
};

const GUESTFS_JOB: &str = "img1-libguestfs";

fn export_ref() -> ObjectRef {
    ObjectRef::namespaced(NAMESPACE, VM_NAME)
}

fn job_ref() -> ObjectRef {
    ObjectRef::namespaced(NAMESPACE, GUESTFS_JOB)
}

/// Cluster holding the built VM, with a generify job that completes and an
/// export that becomes ready.
#[fixture]
fn cluster() -> Arc<FakeCluster> {
    let cluster = FakeCluster::new();
    cluster.insert(&ready_vm());
    cluster.script_watch(
        &job_ref(),
        vec![WatchEvent::Modified(finished_job(GUESTFS_JOB, "Complete"))],
    );
    cluster.script_watch(
        &export_ref(),
        vec![
            WatchEvent::Added(export_in_phase(ExportPhase::Pending)),
            WatchEvent::Modified(export_in_phase(ExportPhase::Ready)),
        ],
    );
    Arc::new(cluster)
}

#[rstest]
#[tokio::test]
async fn linux_export_generifies_then_publishes(cluster: Arc<FakeCluster>) {
    let ui = Arc::new(RecordingUi::default());
    let mut ctx = deployed_context(ui.clone(), OsFamily::Linux);
    let mut step = ExportStep::new(Arc::clone(&cluster), export_settings());

    assert_eq!(step.run(&mut ctx).await, StepAction::Continue);

    assert_eq!(
        cluster.operations(),
        [
            "stop VirtualMachine build/img1",
            "create Job build/img1-libguestfs",
            "watch Job build/img1-libguestfs",
            "create VirtualMachineExport build/img1",
            "create Secret build/img1-export-token",
            "watch VirtualMachineExport build/img1",
        ]
    );
    assert_eq!(ui.messages(), ["phase 'Pending'", "phase 'Ready'"]);

    let token = ctx.export_token().expect("token recorded").to_owned();
    assert_eq!(token.len(), 20);
    let secret: Secret = cluster
        .object(&ObjectRef::namespaced(NAMESPACE, "img1-export-token"))
        .expect("token secret stored");
    assert_eq!(secret.string_data.get("token"), Some(&token));
    let owner = secret
        .metadata
        .owner_references
        .first()
        .expect("owned by the export");
    assert_eq!(owner.kind, "VirtualMachineExport");

    let artifact = ctx.artifact().expect("artifact available");
    assert_eq!(artifact.namespace, NAMESPACE);
    assert_eq!(artifact.export_name, VM_NAME);
    assert_eq!(artifact.export_token, token);
}

#[rstest]
#[tokio::test]
async fn windows_export_skips_generify(cluster: Arc<FakeCluster>) {
    let mut ctx = deployed_context(Arc::new(RecordingUi::default()), OsFamily::Windows);
    let mut step = ExportStep::new(Arc::clone(&cluster), export_settings());

    assert_eq!(step.run(&mut ctx).await, StepAction::Continue);

    assert!(
        cluster
            .operation_log()
            .iter()
            .all(|operation| operation.kind != "Job"),
        "{:?}",
        cluster.operations()
    );
    assert!(cluster.object::<Job>(&job_ref()).is_none());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn export_that_never_becomes_ready_times_out_and_is_kept() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.insert(&ready_vm());
    cluster.script_watch::<VirtualMachineExport>(
        &export_ref(),
        vec![WatchEvent::Added(export_in_phase(ExportPhase::Pending))],
    );
    let mut ctx = deployed_context(Arc::new(RecordingUi::default()), OsFamily::Windows);
    let steps: Vec<Box<dyn Step>> = vec![Box::new(ExportStep::new(
        Arc::clone(&cluster),
        export_settings(),
    ))];

    let report = Runner::new(steps).run(&mut ctx).await;

    assert!(report.halted);
    let err = ctx.error().expect("timeout recorded");
    assert!(err.is_timeout(), "{err}");
    assert!(!err.is_terminal());
    assert!(
        cluster
            .operation_log()
            .iter()
            .all(|operation| operation.verb != Verb::Delete)
    );
    assert!(cluster.object::<VirtualMachineExport>(&export_ref()).is_some());
}

#[rstest]
#[case::skipped(ExportPhase::Skipped)]
#[case::terminated(ExportPhase::Terminated)]
#[tokio::test]
async fn export_in_a_final_phase_is_terminal(#[case] phase: ExportPhase) {
    let cluster = Arc::new(FakeCluster::new());
    cluster.insert(&ready_vm());
    cluster.script_watch(&export_ref(), vec![WatchEvent::Modified(export_in_phase(phase))]);
    let mut ctx = deployed_context(Arc::new(RecordingUi::default()), OsFamily::Windows);
    let mut step = ExportStep::new(Arc::clone(&cluster), export_settings());

    assert_eq!(step.run(&mut ctx).await, StepAction::Halt);

    let err = ctx.error().expect("failure recorded");
    assert!(err.is_terminal(), "{err}");
    assert!(!err.is_timeout());
}

#[rstest]
#[tokio::test]
async fn failed_generify_job_halts_before_exporting(cluster: Arc<FakeCluster>) {
    cluster.script_watch(
        &job_ref(),
        vec![WatchEvent::Modified(finished_job(GUESTFS_JOB, "Failed"))],
    );
    let ui = Arc::new(RecordingUi::default());
    let mut ctx = deployed_context(ui.clone(), OsFamily::Linux);
    let mut step = ExportStep::new(Arc::clone(&cluster), export_settings());

    assert_eq!(step.run(&mut ctx).await, StepAction::Halt);

    let err = ctx.error().expect("failure recorded");
    assert!(err.is_terminal(), "{err}");
    assert!(err.to_string().contains("Job build/img1-libguestfs failed"), "{err}");
    assert!(cluster.object::<VirtualMachineExport>(&export_ref()).is_none());
    assert_eq!(ui.errors().len(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn existing_export_is_recreated_once_it_is_gone(cluster: Arc<FakeCluster>) {
    cluster.insert(&virtual_machine_export(&ready_vm()));
    cluster.linger_next_delete("VirtualMachineExport", 1);
    let ui = Arc::new(RecordingUi::with_answers(&["r"]));
    let mut ctx = deployed_context(ui.clone(), OsFamily::Windows);
    let mut step = ExportStep::new(Arc::clone(&cluster), export_settings());

    assert_eq!(step.run(&mut ctx).await, StepAction::Continue, "{:?}", ctx.error());

    let prompts = ui.prompts();
    assert_eq!(prompts.len(), 1);
    let prompt = prompts.first().expect("one prompt");
    assert!(
        prompt.starts_with("Virtual Machine Export build/img1 already exists."),
        "{prompt}"
    );
    let export_ops: Vec<String> = cluster
        .operations()
        .into_iter()
        .filter(|operation| operation.contains("VirtualMachineExport"))
        .collect();
    assert_eq!(
        export_ops,
        [
            "create VirtualMachineExport build/img1",
            "delete VirtualMachineExport build/img1",
            "get VirtualMachineExport build/img1",
            "get VirtualMachineExport build/img1",
            "create VirtualMachineExport build/img1",
            "watch VirtualMachineExport build/img1",
        ]
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn export_stuck_in_deletion_times_out_without_recreating(cluster: Arc<FakeCluster>) {
    cluster.insert(&virtual_machine_export(&ready_vm()));
    cluster.linger_next_delete("VirtualMachineExport", usize::MAX);
    let ui = Arc::new(RecordingUi::with_answers(&["R"]));
    let mut ctx = deployed_context(ui.clone(), OsFamily::Windows);
    let mut step = ExportStep::new(Arc::clone(&cluster), export_settings());

    assert_eq!(step.run(&mut ctx).await, StepAction::Halt);

    let err = ctx.error().expect("timeout recorded");
    assert!(err.is_timeout(), "{err}");
    let creates = cluster
        .operation_log()
        .iter()
        .filter(|operation| {
            operation.verb == Verb::Create && operation.kind == "VirtualMachineExport"
        })
        .count();
    assert_eq!(creates, 1);
}

#[rstest]
#[tokio::test]
async fn continuing_past_an_existing_export_surfaces_the_conflict(cluster: Arc<FakeCluster>) {
    cluster.insert(&virtual_machine_export(&ready_vm()));
    let ui = Arc::new(RecordingUi::with_answers(&["c"]));
    let mut ctx = deployed_context(ui.clone(), OsFamily::Windows);
    let mut step = ExportStep::new(Arc::clone(&cluster), export_settings());

    assert_eq!(step.run(&mut ctx).await, StepAction::Halt);

    let err = ctx.error().expect("conflict recorded");
    assert!(err.to_string().contains("already exists"), "{err}");
    assert!(
        cluster
            .operation_log()
            .iter()
            .all(|operation| operation.verb != Verb::Delete)
    );
}

#[rstest]
#[tokio::test]
async fn export_without_a_deployed_vm_halts() {
    let cluster = Arc::new(FakeCluster::new());
    let mut ctx = kubevirt_builder::BuildContext::new(Arc::new(RecordingUi::default()));
    ctx.set_os_family(OsFamily::Linux);
    let mut step = ExportStep::new(Arc::clone(&cluster), export_settings());

    assert_eq!(step.run(&mut ctx).await, StepAction::Halt);
    assert!(cluster.operations().is_empty());
}
