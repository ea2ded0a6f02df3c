//! Orchestrates an image build end to end.
//!
//! The build deploys a VM, forwards its communicator port, runs the
//! provisioner against it, and exports the resulting disk. Whatever
//! happens, every step that ran is cleaned up before the result is
//! returned.

use std::sync::Arc;

use tracing::info;

use crate::cluster::Cluster;
use crate::config::BuilderConfig;
use crate::context::{BuildArtifact, BuildContext};
use crate::error::BuildError;
use crate::pipeline::{Runner, Step};
use crate::steps::{
    CommandRunner, DeploySettings, DeployStep, ExportSettings, ExportStep, PortForwardStep,
    PortMapping, ProvisionSettings, ProvisionStep,
};
use crate::ui::Ui;

/// Executes builds against a cluster.
pub struct BuildOrchestrator<C, R> {
    cluster: Arc<C>,
    runner: Arc<R>,
}

impl<C, R> BuildOrchestrator<C, R>
where
    C: Cluster + 'static,
    R: CommandRunner,
{
    /// Creates a new orchestrator running provisioner commands through
    /// `runner`.
    #[must_use]
    pub const fn new(cluster: Arc<C>, runner: Arc<R>) -> Self {
        Self { cluster, runner }
    }

    /// Ordered build steps for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Config`] when the configuration is invalid.
    pub fn steps(&self, config: &BuilderConfig) -> Result<Vec<Box<dyn Step>>, BuildError> {
        let options = config.vm_options()?;
        let mapping = PortMapping::from_config(config)?;
        let provision = ProvisionSettings::from_config(config)?;
        Ok(vec![
            Box::new(DeployStep::new(
                Arc::clone(&self.cluster),
                options,
                DeploySettings::from(config),
            )),
            Box::new(PortForwardStep::new(Arc::clone(&self.cluster), mapping)),
            Box::new(ProvisionStep::new(Arc::clone(&self.runner), provision)),
            Box::new(ExportStep::new(
                Arc::clone(&self.cluster),
                ExportSettings::from(config),
            )),
        ])
    }

    /// Runs a build and returns the artifact the upload stage consumes.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded by a step, or [`BuildError::Config`]
    /// before any cluster call when the configuration is invalid.
    pub async fn execute(
        &self,
        config: &BuilderConfig,
        ui: Arc<dyn Ui>,
    ) -> Result<BuildArtifact, BuildError> {
        let steps = self.steps(config)?;
        let mut ctx = BuildContext::new(ui);
        ctx.set_os_family(config.os_family());

        let report = Runner::new(steps).run(&mut ctx).await;
        info!(
            steps = ?report.executed,
            halted = report.halted,
            "build pipeline finished"
        );

        if let Some(err) = ctx.take_error() {
            return Err(err);
        }
        Ok(ctx.artifact()?)
    }
}
