//! Build steps: deploy the VM, forward its communicator port, run the
//! provisioner, and export the disk.
//!
//! Each step reports progress through the context's [`Ui`](crate::ui::Ui)
//! and, on failure, records the error in the context before halting.

mod deploy;
mod export;
mod port_forward;
mod provision;

use tracing::debug;

use crate::cluster::{Cluster, ObjectRef};
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::pipeline::StepAction;
use crate::resources::Resource;

pub use deploy::{DeploySettings, DeployStep};
pub use export::{ExportSettings, ExportStep};
pub use port_forward::{PortForwardStep, PortMapping};
pub use provision::{
    CommandOutput, CommandRunner, ProcessCommandRunner, ProvisionError, ProvisionSettings,
    ProvisionStep,
};

/// Converts a step body's result into a pipeline action, recording and
/// showing the error on failure.
fn conclude(ctx: &mut BuildContext, result: Result<(), BuildError>) -> StepAction {
    match result {
        Ok(()) => StepAction::Continue,
        Err(err) => {
            ctx.ui().error(&err.to_string());
            ctx.record_error(err);
            StepAction::Halt
        }
    }
}

/// Creates `resource`, naming the object in the error on failure.
async fn create<C: Cluster, R: Resource>(cluster: &C, resource: &R) -> Result<R, BuildError> {
    cluster.create(resource).await.map_err(|err| {
        BuildError::cluster(
            format!("create {} {}", R::KIND, ObjectRef::of(resource)),
            err,
        )
    })
}

/// Creates `resource`, treating an existing object of the same name as
/// success.
async fn ensure<C: Cluster, R: Resource>(cluster: &C, resource: &R) -> Result<(), BuildError> {
    match cluster.create(resource).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_already_exists() => {
            debug!(kind = R::KIND, target = %ObjectRef::of(resource), "already exists");
            Ok(())
        }
        Err(err) => Err(BuildError::cluster(
            format!("create {} {}", R::KIND, ObjectRef::of(resource)),
            err,
        )),
    }
}
