//! Upload orchestration against an in-memory cluster.

#[path = "common/fixtures.rs"]
mod fixtures;

use std::sync::Arc;

use kubevirt_builder::cluster::{ObjectRef, Propagation, WatchEvent};
use kubevirt_builder::resources::batch::Job;
use kubevirt_builder::resources::core::Secret;
use kubevirt_builder::resources::kubevirt::{ExportPhase, VirtualMachine, VirtualMachineExport};
use kubevirt_builder::test_support::{FakeCluster, RecordingUi, Verb};
use kubevirt_builder::{BuildArtifact, UploadConfig, UploadError, UploadOrchestrator};
use rstest::{fixture, rstest};

use fixtures::{
    GZIP_URL, NAMESPACE, VM_NAME, export_in_phase, finished_job, published_export, ready_vm,
};

const UPLOAD_JOB: &str = "s3-uploader-img1";
const TOKEN: &str = "tok-123";
const CERT: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

fn export_ref() -> ObjectRef {
    ObjectRef::namespaced(NAMESPACE, VM_NAME)
}

fn job_ref() -> ObjectRef {
    ObjectRef::namespaced(NAMESPACE, UPLOAD_JOB)
}

#[fixture]
fn config() -> UploadConfig {
    UploadConfig {
        bucket: String::from("bucket"),
        key_prefix: String::from("prefix"),
        access_key_id: String::from("AKIAEXAMPLE"),
        secret_access_key: String::from("wJalrXUtnFEMI"),
        region: String::from("eu-west-1"),
        timeout_secs: 1800,
    }
}

#[fixture]
fn artifact() -> BuildArtifact {
    BuildArtifact {
        namespace: NAMESPACE.to_owned(),
        export_name: VM_NAME.to_owned(),
        export_token: TOKEN.to_owned(),
    }
}

fn cluster_with(export: &VirtualMachineExport, job_outcome: &str) -> Arc<FakeCluster> {
    let cluster = FakeCluster::new();
    cluster.insert(export);
    cluster.script_watch(
        &job_ref(),
        vec![WatchEvent::Modified(finished_job(UPLOAD_JOB, job_outcome))],
    );
    Arc::new(cluster)
}

#[rstest]
#[tokio::test]
async fn completed_upload_returns_destination_and_deletes_export_and_vm(
    config: UploadConfig,
    artifact: BuildArtifact,
) {
    let cluster = cluster_with(&published_export(Some(CERT)), "Complete");
    cluster.insert(&ready_vm());
    let ui = RecordingUi::default();
    let orchestrator = UploadOrchestrator::new(Arc::clone(&cluster), config);

    let destination = orchestrator
        .upload(&ui, &artifact)
        .await
        .expect("upload succeeds");

    assert_eq!(destination, "s3://bucket/prefix/img1.img.gz");
    assert_eq!(
        cluster.operations(),
        [
            "get VirtualMachineExport build/img1",
            "create Job build/s3-uploader-img1",
            "create Secret build/img1-s3-uploader",
            "watch Job build/s3-uploader-img1",
            "delete VirtualMachineExport build/img1",
            "delete VirtualMachine build/img1",
        ]
    );
    let delete = cluster
        .operation_log()
        .into_iter()
        .find(|operation| operation.verb == Verb::Delete)
        .expect("export deleted");
    assert_eq!(delete.propagation, Some(Propagation::Foreground));
    assert!(cluster.object::<VirtualMachineExport>(&export_ref()).is_none());
    assert!(cluster.object::<VirtualMachine>(&export_ref()).is_none());
    assert!(
        ui.messages()
            .iter()
            .any(|line| line == "Virtual Machine build/img1 has been deleted")
    );

    let job: Job = cluster.object(&job_ref()).expect("job stored");
    let export_owner = job
        .metadata
        .owner_references
        .first()
        .expect("job owned by export");
    assert_eq!(export_owner.kind, "VirtualMachineExport");
    let download = job
        .spec
        .template
        .spec
        .init_containers
        .first()
        .expect("download container");
    let script = download.command.last().expect("download script");
    assert!(script.contains(GZIP_URL), "{script}");
    assert!(script.contains("x-kubevirt-export-token: $EXPORT_TOKEN"), "{script}");
    assert!(script.contains("--cacert"), "{script}");

    let secret: Secret = cluster
        .object(&ObjectRef::namespaced(NAMESPACE, "img1-s3-uploader"))
        .expect("secret stored");
    assert_eq!(secret.string_data.get("EXPORT_TOKEN").map(String::as_str), Some(TOKEN));
    assert_eq!(secret.string_data.get("EXPORT_CA_CERT").map(String::as_str), Some(CERT));
    let job_owner = secret
        .metadata
        .owner_references
        .first()
        .expect("secret owned by job");
    assert_eq!(job_owner.kind, "Job");
    assert_eq!(Some(job_owner.uid.as_str()), job.metadata.uid.as_deref());
}

#[rstest]
#[tokio::test]
async fn export_without_a_certificate_downloads_without_cacert(
    config: UploadConfig,
    artifact: BuildArtifact,
) {
    let cluster = cluster_with(&published_export(None), "Complete");
    let orchestrator = UploadOrchestrator::new(Arc::clone(&cluster), config);

    orchestrator
        .upload(&RecordingUi::default(), &artifact)
        .await
        .expect("upload succeeds");

    let secret: Secret = cluster
        .object(&ObjectRef::namespaced(NAMESPACE, "img1-s3-uploader"))
        .expect("secret stored");
    assert!(!secret.string_data.contains_key("EXPORT_CA_CERT"));
}

#[rstest]
#[tokio::test]
async fn export_without_links_is_rejected_before_creating_the_job(
    config: UploadConfig,
    artifact: BuildArtifact,
) {
    let cluster = cluster_with(&export_in_phase(ExportPhase::Ready), "Complete");
    let orchestrator = UploadOrchestrator::new(Arc::clone(&cluster), config);

    let err = orchestrator
        .upload(&RecordingUi::default(), &artifact)
        .await
        .expect_err("no gzip link");

    let UploadError::MissingVolume { volume, format, .. } = &err else {
        panic!("expected a missing volume error, got {err}");
    };
    assert_eq!(volume, "img1-source");
    assert_eq!(*format, "kubevirt-gzip");
    assert_eq!(cluster.operations(), ["get VirtualMachineExport build/img1"]);
}

#[rstest]
#[tokio::test]
async fn failed_upload_job_is_deleted_and_export_kept(
    config: UploadConfig,
    artifact: BuildArtifact,
) {
    let cluster = cluster_with(&published_export(None), "Failed");
    let orchestrator = UploadOrchestrator::new(Arc::clone(&cluster), config);

    let err = orchestrator
        .upload(&RecordingUi::default(), &artifact)
        .await
        .expect_err("job failed");

    assert!(err.is_terminal(), "{err}");
    assert!(!err.is_timeout());
    let deletes: Vec<_> = cluster
        .operation_log()
        .into_iter()
        .filter(|operation| operation.verb == Verb::Delete)
        .collect();
    assert_eq!(deletes.len(), 1);
    let delete = deletes.first().expect("one delete");
    assert_eq!(delete.kind, "Job");
    assert_eq!(delete.target, "build/s3-uploader-img1");
    assert!(cluster.object::<Job>(&job_ref()).is_none());
    assert!(cluster.object::<VirtualMachineExport>(&export_ref()).is_some());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stalled_upload_job_times_out(mut config: UploadConfig, artifact: BuildArtifact) {
    let cluster = FakeCluster::new();
    cluster.insert(&published_export(None));
    cluster.script_watch::<Job>(&job_ref(), Vec::new());
    config.timeout_secs = 60;
    let orchestrator = UploadOrchestrator::new(Arc::new(cluster), config);

    let err = orchestrator
        .upload(&RecordingUi::default(), &artifact)
        .await
        .expect_err("job never finishes");

    assert!(err.is_timeout(), "{err}");
}

#[rstest]
#[tokio::test]
async fn missing_export_names_it(config: UploadConfig, artifact: BuildArtifact) {
    let cluster = Arc::new(FakeCluster::new());
    let orchestrator = UploadOrchestrator::new(Arc::clone(&cluster), config);

    let err = orchestrator
        .upload(&RecordingUi::default(), &artifact)
        .await
        .expect_err("export missing");

    assert!(
        err.to_string()
            .starts_with("failed to get VirtualMachineExport build/img1"),
        "{err}"
    );
}

#[rstest]
#[tokio::test]
async fn invalid_config_makes_no_cluster_calls(mut config: UploadConfig, artifact: BuildArtifact) {
    config.bucket = String::new();
    let cluster = Arc::new(FakeCluster::new());
    let orchestrator = UploadOrchestrator::new(Arc::clone(&cluster), config);

    let err = orchestrator
        .upload(&RecordingUi::default(), &artifact)
        .await
        .expect_err("bucket is required");

    assert!(matches!(err, UploadError::Config(_)), "{err}");
    assert!(cluster.operations().is_empty());
}
