//! Build-level error type.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::context::ContextError;
use crate::steps::ProvisionError;
use crate::tunnel::TunnelError;
use crate::watch::WaitError;

/// First fatal error of a build, as recorded in the build context.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Configuration was rejected before any cluster call.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A cluster request failed.
    #[error("failed to {operation}: {source}")]
    Cluster {
        /// What the step was doing, for example `create secret`.
        operation: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },
    /// A readiness wait failed.
    #[error(transparent)]
    Wait(#[from] WaitError),
    /// The port-forward tunnel could not be started.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    /// The VM's launcher pod cannot be used as the tunnel target.
    #[error("cannot reach the launcher pod of Virtual Machine {vm}: {reason}")]
    LauncherPod {
        /// `namespace/name` of the VM.
        vm: String,
        /// What was wrong.
        reason: String,
    },
    /// The provisioner could not reach the guest or failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// A step read a value no earlier step produced.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// The pipeline halted without recording a cause.
    #[error("build halted by step {step}")]
    Halted {
        /// Name of the halting step.
        step: String,
    },
}

impl BuildError {
    /// Wraps a cluster error with the operation that produced it.
    pub fn cluster(operation: impl Into<String>, source: ClusterError) -> Self {
        Self::Cluster {
            operation: operation.into(),
            source,
        }
    }

    /// Returns true when a deadline elapsed.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        match self {
            Self::Wait(err) => err.is_timeout(),
            Self::Provision(err) => err.is_timeout(),
            Self::Cluster { source, .. } => source.is_timeout(),
            Self::Tunnel(TunnelError::NotReady { .. }) => true,
            _ => false,
        }
    }

    /// Returns true when a watched object reached an unrecoverable state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Wait(err) if err.is_terminal())
    }
}
