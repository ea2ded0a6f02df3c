//! Copies a finished export into object storage.
//!
//! The upload runs as an in-cluster job owned by the export. Once the job
//! completes the export is deleted, which cascades to its token secret, the
//! job, and the job's credentials secret. The stopped source VM, kept by a
//! successful build because it owns the exported volume, goes last.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::cluster::{Cluster, ClusterError, ObjectRef, Propagation};
use crate::config::{ConfigError, UploadConfig};
use crate::context::BuildArtifact;
use crate::generator::{UploaderOptions, source_volume_name, uploader_job, uploader_secret};
use crate::resources::Resource;
use crate::resources::batch::Job;
use crate::resources::kubevirt::{VirtualMachine, VirtualMachineExport};
use crate::ui::Ui;
use crate::watch::{WaitError, job_complete, wait_for_condition};

/// Download format the upload job fetches.
pub const EXPORT_FORMAT: &str = "kubevirt-gzip";

/// Errors returned by [`UploadOrchestrator::upload`].
#[derive(Debug, Error)]
pub enum UploadError {
    /// Upload settings were rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The export does not publish the compressed source volume.
    #[error("export {export} has no {format} link for volume {volume}")]
    MissingVolume {
        /// `namespace/name` of the export.
        export: String,
        /// Expected volume name.
        volume: String,
        /// Expected format.
        format: &'static str,
    },
    /// A cluster request failed.
    #[error("failed to {operation}: {source}")]
    Cluster {
        /// What was being done.
        operation: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },
    /// The upload job did not complete.
    #[error(transparent)]
    Wait(#[from] WaitError),
}

impl UploadError {
    /// Returns true when the job did not finish in time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Wait(err) if err.is_timeout())
    }

    /// Returns true when the job failed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Wait(err) if err.is_terminal())
    }
}

fn cluster_error(operation: String) -> impl FnOnce(ClusterError) -> UploadError {
    move |source| UploadError::Cluster { operation, source }
}

async fn create<C: Cluster, R: Resource>(cluster: &C, resource: &R) -> Result<R, UploadError> {
    cluster
        .create(resource)
        .await
        .map_err(cluster_error(format!(
            "create {} {}",
            R::KIND,
            ObjectRef::of(resource)
        )))
}

async fn delete_if_present<C: Cluster, R: Resource>(
    cluster: &C,
    target: &ObjectRef,
) -> Result<(), UploadError> {
    match cluster.delete::<R>(target, Propagation::Foreground).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(cluster_error(format!("delete {} {target}", R::KIND))(err)),
    }
}

/// Uploads exports described by [`BuildArtifact`]s.
pub struct UploadOrchestrator<C> {
    cluster: Arc<C>,
    config: UploadConfig,
}

impl<C: Cluster> UploadOrchestrator<C> {
    /// Creates an orchestrator uploading to the destination in `config`.
    #[must_use]
    pub const fn new(cluster: Arc<C>, config: UploadConfig) -> Self {
        Self { cluster, config }
    }

    /// Runs the upload job for `artifact`, then deletes the export and its
    /// source VM. Returns the object-storage URL of the image.
    ///
    /// A failed or timed-out job is deleted so a retry can recreate it; the
    /// export is kept.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError`] when the settings are invalid, the export lacks
    /// the compressed source volume, a cluster call fails, or the job does
    /// not complete.
    pub async fn upload(&self, ui: &dyn Ui, artifact: &BuildArtifact) -> Result<String, UploadError> {
        self.config.validate()?;
        let cluster = self.cluster.as_ref();
        let export_ref = ObjectRef::namespaced(&artifact.namespace, &artifact.export_name);

        let export: VirtualMachineExport = cluster
            .get(&export_ref)
            .await
            .map_err(cluster_error(format!("get VirtualMachineExport {export_ref}")))?;

        let vm_name = export.spec.source.name.clone();
        let vm_ref = ObjectRef::namespaced(&artifact.namespace, &vm_name);
        let volume = source_volume_name(&vm_name);
        let links = export.internal_links();
        let export_url = links
            .and_then(|link| link.url_for(&volume, EXPORT_FORMAT))
            .ok_or_else(|| UploadError::MissingVolume {
                export: export_ref.to_string(),
                volume: volume.clone(),
                format: EXPORT_FORMAT,
            })?
            .to_owned();

        let opts = UploaderOptions {
            name: vm_name,
            namespace: artifact.namespace.clone(),
            export_url,
            export_token: artifact.export_token.clone(),
            export_cert: links
                .and_then(|link| link.cert.clone())
                .filter(|cert| !cert.trim().is_empty()),
            bucket: self.config.bucket.clone(),
            key_prefix: self.config.key_prefix.clone(),
            access_key_id: self.config.access_key_id.clone(),
            secret_access_key: self.config.secret_access_key.clone(),
            region: self.config.region.clone(),
        };
        let destination = opts.destination();

        ui.say(&format!("uploading Virtual Machine Export {export_ref} to {destination}..."));
        let job = create(cluster, &uploader_job(&export, &opts)).await?;
        create(cluster, &uploader_secret(&job, &opts)).await?;

        let job_ref = ObjectRef::of(&job);
        if let Err(err) =
            wait_for_condition(cluster, &job_ref, self.config.timeout(), job_complete).await
        {
            if let Err(cleanup) = cluster
                .delete::<Job>(&job_ref, Propagation::Foreground)
                .await
            {
                warn!(job = %job_ref, error = %cleanup, "failed to delete upload job");
            }
            return Err(err.into());
        }

        delete_if_present::<C, VirtualMachineExport>(cluster, &export_ref).await?;
        delete_if_present::<C, VirtualMachine>(cluster, &vm_ref).await?;
        ui.message(&format!("Virtual Machine {vm_ref} has been deleted"));

        info!(export = %export_ref, %destination, "upload complete");
        ui.say(&format!("uploaded Virtual Machine Export {export_ref} to {destination}"));
        Ok(destination)
    }
}
