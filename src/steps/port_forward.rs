//! Forwards a local port to the guest communicator through the launcher pod.

use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{Cluster, ObjectRef};
use crate::config::{BuilderConfig, ConfigError};
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::generator::VM_NAME_LABEL;
use crate::pipeline::{Step, StepAction, StepFuture};
use crate::resources::core::Pod;
use crate::tunnel::{DEFAULT_READY_TIMEOUT, TunnelError, start_tunnel};

use super::conclude;

/// Local port and the guest port it reaches.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortMapping {
    /// Port bound on 127.0.0.1.
    pub local: u16,
    /// Port inside the guest.
    pub remote: u16,
}

impl PortMapping {
    /// Mapping for the configured communicator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown communicator.
    pub fn from_config(config: &BuilderConfig) -> Result<Self, ConfigError> {
        let communicator = config.communicator()?;
        Ok(Self {
            local: config.local_port(communicator),
            remote: communicator.guest_port(),
        })
    }
}

/// Opens the tunnel to the guest; cleanup closes it.
pub struct PortForwardStep<C> {
    cluster: Arc<C>,
    mapping: PortMapping,
    ready_timeout: Duration,
}

impl<C: Cluster + 'static> PortForwardStep<C> {
    /// Creates the step.
    #[must_use]
    pub const fn new(cluster: Arc<C>, mapping: PortMapping) -> Self {
        Self {
            cluster,
            mapping,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<(), BuildError> {
        let vm = ctx.vm()?;
        let namespace = vm.metadata.namespace.clone().unwrap_or_default();
        let target = format!("{namespace}/{}", vm.metadata.name);
        let selector = format!("{VM_NAME_LABEL}={}", vm.metadata.name);

        let pods: Vec<Pod> = self
            .cluster
            .list(Some(&namespace), &selector)
            .await
            .map_err(|err| {
                BuildError::cluster(format!("list pods of Virtual Machine {target}"), err)
            })?;
        let (pod, address) = pods
            .iter()
            .find_map(|pod| Some((pod, pod.status.as_ref()?.pod_ip.as_deref()?)))
            .ok_or_else(|| BuildError::LauncherPod {
                vm: target.clone(),
                reason: String::from("no pod with an address"),
            })?;
        let pod_ref = ObjectRef::namespaced(&namespace, &pod.metadata.name);

        let dialer = self
            .cluster
            .pod_dialer(&pod_ref, address, self.mapping.remote)
            .map_err(|err| BuildError::LauncherPod {
                vm: target.clone(),
                reason: err.to_string(),
            })?;
        let handle = match start_tunnel(dialer, self.mapping.local, self.ready_timeout).await {
            Ok(handle) => handle,
            Err(mut err) => {
                if let TunnelError::NotReady { handle, .. } = &mut err {
                    handle.stop();
                }
                return Err(err.into());
            }
        };
        ctx.ui().message(&format!(
            "forwarding 127.0.0.1:{} to pod {pod_ref} port {}",
            handle.local_port(),
            self.mapping.remote
        ));
        ctx.set_tunnel(handle);
        ctx.ui()
            .say(&format!("port-forwarding step has completed for Virtual Machine {target}"));
        Ok(())
    }
}

impl<C: Cluster + 'static> Step for PortForwardStep<C> {
    fn name(&self) -> &'static str {
        "port-forward"
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
            if let Some(mut tunnel) = ctx.take_tunnel() {
                tunnel.stop();
            }
            Ok(())
        })
    }
}
