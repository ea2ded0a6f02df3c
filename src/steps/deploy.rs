//! Creates the VM, its secrets, and waits for it to become ready.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cluster::{Cluster, ObjectRef, Propagation};
use crate::config::{BuilderConfig, DEFAULT_GUEST_PASSWORD, DEFAULT_GUEST_USERNAME};
use crate::context::{BuildContext, GuestCredentials};
use crate::error::BuildError;
use crate::generator::{
    VirtualMachineOptions, builder_node_pool, s3_credentials_secret, startup_script_secret,
    user_credentials_secret, virtual_machine, warmup_job,
};
use crate::pipeline::{Step, StepAction, StepFuture};
use crate::resources::ObjectMeta;
use crate::resources::core::Namespace;
use crate::resources::kubevirt::VirtualMachine;
use crate::watch::{vm_ready, wait_for_condition};

use super::{conclude, create, ensure};

/// Deployment knobs outside the VM description itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeploySettings {
    /// Provision capacity through a Karpenter node pool and warm-up job.
    pub karpenter: bool,
    /// Lifetime of the warm-up job.
    pub warmup: Duration,
    /// How long the VM may take to report `Ready`.
    pub deployment_timeout: Duration,
}

impl From<&BuilderConfig> for DeploySettings {
    fn from(config: &BuilderConfig) -> Self {
        Self {
            karpenter: config.karpenter,
            warmup: config.warmup(),
            deployment_timeout: config.deployment_timeout(),
        }
    }
}

/// Deploys the build VM.
///
/// Cleanup deletes the VM with foreground propagation so its data volumes
/// and secrets go with it. The namespace and node pool are shared and stay.
pub struct DeployStep<C> {
    cluster: Arc<C>,
    options: VirtualMachineOptions,
    settings: DeploySettings,
}

impl<C: Cluster + 'static> DeployStep<C> {
    /// Creates the step.
    #[must_use]
    pub const fn new(
        cluster: Arc<C>,
        options: VirtualMachineOptions,
        settings: DeploySettings,
    ) -> Self {
        Self {
            cluster,
            options,
            settings,
        }
    }

    async fn bootstrap(&self) -> Result<(), BuildError> {
        let cluster = self.cluster.as_ref();
        ensure(
            cluster,
            &Namespace {
                metadata: ObjectMeta::cluster_scoped(&self.options.namespace),
            },
        )
        .await?;

        if self.settings.karpenter {
            ensure(cluster, &builder_node_pool()).await?;
            ensure(
                cluster,
                &warmup_job(
                    &self.options.namespace,
                    &self.options.name,
                    self.settings.warmup,
                    true,
                ),
            )
            .await?;
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<(), BuildError> {
        let cluster = self.cluster.as_ref();
        let target = format!("{}/{}", self.options.namespace, self.options.name);

        self.bootstrap().await?;

        ctx.ui()
            .say(&format!("creating Virtual Machine {target}..."));
        let vm = create(cluster, &virtual_machine(&self.options)).await?;
        ctx.set_vm(vm.clone());

        if let Some(secret) = s3_credentials_secret(&vm, &self.options) {
            create(cluster, &secret).await?;
        }
        create(cluster, &startup_script_secret(&vm, &self.options)).await?;

        let credentials = match (
            self.options.credentials.as_ref(),
            user_credentials_secret(&vm, &self.options),
        ) {
            (Some(user), Some((secret, password))) => {
                create(cluster, &secret).await?;
                GuestCredentials {
                    username: user.username.clone(),
                    password,
                }
            }
            _ => GuestCredentials {
                username: DEFAULT_GUEST_USERNAME.to_owned(),
                password: DEFAULT_GUEST_PASSWORD.to_owned(),
            },
        };
        ctx.set_guest_credentials(credentials);

        wait_for_condition(
            cluster,
            &ObjectRef::of(&vm),
            self.settings.deployment_timeout,
            vm_ready(ctx.ui()),
        )
        .await?;

        info!(vm = %target, "virtual machine ready");
        ctx.ui()
            .say(&format!("deployment step has completed for Virtual Machine {target}"));
        Ok(())
    }
}

impl<C: Cluster + 'static> Step for DeployStep<C> {
    fn name(&self) -> &'static str {
        "deploy"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = self.execute(ctx).await;
            conclude(ctx, result)
        })
    }

    fn cleanup<'a>(
        &'a mut self,
        ctx: &'a mut BuildContext,
    ) -> StepFuture<'a, Result<(), BuildError>> {
        Box::pin(async move {
            let Some(vm) = ctx.take_vm() else {
                return Ok(());
            };
            let target = ObjectRef::of(&vm);
            // The export serves the VM's data volume; upload removes both.
            if ctx.error().is_none() {
                info!(vm = %target, "keeping virtual machine for the upload stage");
                ctx.ui().message(&format!(
                    "Virtual Machine {target} is kept until its export is uploaded"
                ));
                return Ok(());
            }
            match self
                .cluster
                .delete::<VirtualMachine>(&target, Propagation::Foreground)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    return Err(BuildError::cluster(
                        format!("delete VirtualMachine {target}"),
                        err,
                    ));
                }
            }
            ctx.ui()
                .message(&format!("Virtual Machine {target} has been deleted"));
            Ok(())
        })
    }
}
