//! Stops the VM, generifies its disk, and publishes it through an export.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::cluster::{Cluster, ObjectRef, Propagation, WatchEvent};
use crate::config::BuilderConfig;
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::generator::{
    GENERATED_SECRET_LENGTH, OsFamily, export_token_secret, guestfs_job, random_token,
    virtual_machine_export,
};
use crate::pipeline::{Step, StepAction, StepFuture};
use crate::resources::kubevirt::{VirtualMachine, VirtualMachineExport};
use crate::ui::{Recreate, Ui, ask_for_recreation};
use crate::watch::{WaitError, export_ready, job_complete, wait_for_condition};

use super::{conclude, create, ensure};

/// Pause between checks that a deleted export is gone.
const REMOVAL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Export deadlines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExportSettings {
    /// How long the generify job may run.
    pub generify_timeout: Duration,
    /// How long the export may take to become servable.
    pub export_timeout: Duration,
}

impl From<&BuilderConfig> for ExportSettings {
    fn from(config: &BuilderConfig) -> Self {
        Self {
            generify_timeout: config.generify_timeout(),
            export_timeout: config.export_timeout(),
        }
    }
}

/// Produces a servable export of the built disk.
///
/// The export outlives the build; the upload stage deletes it.
pub struct ExportStep<C> {
    cluster: Arc<C>,
    settings: ExportSettings,
}

impl<C: Cluster + 'static> ExportStep<C> {
    /// Creates the step.
    #[must_use]
    pub const fn new(cluster: Arc<C>, settings: ExportSettings) -> Self {
        Self { cluster, settings }
    }

    async fn create_export(
        &self,
        ui: &dyn Ui,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachineExport, BuildError> {
        let cluster = self.cluster.as_ref();
        let desired = virtual_machine_export(vm);
        match cluster.create(&desired).await {
            Ok(export) => return Ok(export),
            Err(err) if err.is_already_exists() => {}
            Err(err) => {
                return Err(BuildError::cluster(
                    format!("create VirtualMachineExport {}", ObjectRef::of(&desired)),
                    err,
                ));
            }
        }

        let target = ObjectRef::of(&desired);
        if ask_for_recreation(ui, "Virtual Machine Export", &target.to_string())
            == Recreate::Recreate
        {
            cluster
                .delete::<VirtualMachineExport>(&target, Propagation::Foreground)
                .await
                .map_err(|err| {
                    BuildError::cluster(format!("delete VirtualMachineExport {target}"), err)
                })?;
            self.await_removal(&target).await?;
        }
        create(cluster, &desired).await
    }

    /// Polls until the export is gone. Foreground deletion keeps it around
    /// until its token secret has been collected.
    async fn await_removal(&self, target: &ObjectRef) -> Result<(), BuildError> {
        let timeout = self.settings.export_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            match self.cluster.get::<VirtualMachineExport>(target).await {
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => {
                    return Err(BuildError::cluster(
                        format!("get VirtualMachineExport {target}"),
                        err,
                    ));
                }
                Ok(_) => debug!(export = %target, "export still terminating"),
            }
            if Instant::now() + REMOVAL_POLL_INTERVAL > deadline {
                return Err(WaitError::Timeout {
                    kind: "VirtualMachineExport",
                    target: target.to_string(),
                    timeout,
                }
                .into());
            }
            sleep(REMOVAL_POLL_INTERVAL).await;
        }
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<(), BuildError> {
        let cluster = self.cluster.as_ref();
        let vm = ctx.vm()?.clone();
        let target = ObjectRef::of(&vm);

        ctx.ui()
            .say(&format!("stopping Virtual Machine for export {target}..."));
        cluster
            .stop_virtual_machine(&target)
            .await
            .map_err(|err| BuildError::cluster(format!("stop VirtualMachine {target}"), err))?;

        if ctx.os_family()? == OsFamily::Linux {
            ctx.ui().say(&format!(
                "generify-ing with 'virt-sysprep' Virtual Machine for export {target}..."
            ));
            let job = create(cluster, &guestfs_job(&vm)).await?;
            wait_for_condition(
                cluster,
                &ObjectRef::of(&job),
                self.settings.generify_timeout,
                job_complete,
            )
            .await?;
        }

        ctx.ui()
            .say(&format!("creating Virtual Machine Export {target}..."));
        let export = self.create_export(ctx.ui(), &vm).await?;
        ctx.set_export(export.clone());

        let token = random_token(GENERATED_SECRET_LENGTH);
        ensure(cluster, &export_token_secret(&export, &token)).await?;
        ctx.set_export_token(token);

        let ui = ctx.ui();
        wait_for_condition(
            cluster,
            &ObjectRef::of(&export),
            self.settings.export_timeout,
            |event: &WatchEvent<VirtualMachineExport>| {
                if let Some(phase) = event.object().phase() {
                    ui.message(&format!("phase '{phase:?}'"));
                }
                export_ready(event)
            },
        )
        .await?;

        info!(export = %ObjectRef::of(&export), "export ready");
        ctx.ui()
            .say(&format!("export step has completed for Virtual Machine {target}"));
        Ok(())
    }
}

impl<C: Cluster + 'static> Step for ExportStep<C> {
    fn name(&self) -> &'static str {
        "export"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = self.execute(ctx).await;
            conclude(ctx, result)
        })
    }

    fn cleanup<'a>(
        &'a mut self,
        _ctx: &'a mut BuildContext,
    ) -> StepFuture<'a, Result<(), BuildError>> {
        Box::pin(async { Ok(()) })
    }
}
