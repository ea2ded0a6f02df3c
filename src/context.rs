//! State shared by the build steps.
//!
//! Each slot is written by exactly one step and read by later ones. Reading
//! a slot before its producer ran yields [`ContextError::Missing`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::BuildError;
use crate::generator::OsFamily;
use crate::resources::kubevirt::{VirtualMachine, VirtualMachineExport};
use crate::tunnel::TunnelHandle;
use crate::ui::Ui;

/// Raised when a step reads a slot no earlier step filled.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ContextError {
    /// The named slot is empty.
    #[error("build context has no {slot}; an earlier step did not run")]
    Missing {
        /// Slot name.
        slot: &'static str,
    },
}

/// Account the provisioner logs in with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GuestCredentials {
    /// Guest username.
    pub username: String,
    /// Guest password.
    pub password: String,
}

/// Reference to a finished build, handed to the upload stage.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct BuildArtifact {
    /// Namespace holding the export.
    pub namespace: String,
    /// Export name.
    pub export_name: String,
    /// Download token for the export.
    pub export_token: String,
}

/// Per-build state lent mutably to one step at a time.
pub struct BuildContext {
    ui: Arc<dyn Ui>,
    os_family: Option<OsFamily>,
    vm: Option<VirtualMachine>,
    guest_credentials: Option<GuestCredentials>,
    tunnel: Option<TunnelHandle>,
    export: Option<VirtualMachineExport>,
    export_token: Option<String>,
    error: Option<BuildError>,
}

fn missing(slot: &'static str) -> ContextError {
    ContextError::Missing { slot }
}

impl BuildContext {
    /// Creates an empty context reporting to `ui`.
    #[must_use]
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self {
            ui,
            os_family: None,
            vm: None,
            guest_credentials: None,
            tunnel: None,
            export: None,
            export_token: None,
            error: None,
        }
    }

    /// Output sink.
    #[must_use]
    pub fn ui(&self) -> &dyn Ui {
        self.ui.as_ref()
    }

    /// Records the guest OS family.
    pub const fn set_os_family(&mut self, family: OsFamily) {
        self.os_family = Some(family);
    }

    /// Guest OS family.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Missing`] when it was never recorded.
    pub fn os_family(&self) -> Result<OsFamily, ContextError> {
        self.os_family.ok_or_else(|| missing("OS family"))
    }

    /// Records the provisioned VM.
    pub fn set_vm(&mut self, vm: VirtualMachine) {
        self.vm = Some(vm);
    }

    /// Provisioned VM.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Missing`] before the deploy step ran.
    pub fn vm(&self) -> Result<&VirtualMachine, ContextError> {
        self.vm.as_ref().ok_or_else(|| missing("virtual machine"))
    }

    /// Removes the VM, returning it if one was recorded.
    pub const fn take_vm(&mut self) -> Option<VirtualMachine> {
        self.vm.take()
    }

    /// Records the guest login.
    pub fn set_guest_credentials(&mut self, credentials: GuestCredentials) {
        self.guest_credentials = Some(credentials);
    }

    /// Guest login.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Missing`] before the deploy step ran.
    pub fn guest_credentials(&self) -> Result<&GuestCredentials, ContextError> {
        self.guest_credentials
            .as_ref()
            .ok_or_else(|| missing("guest credentials"))
    }

    /// Records the running tunnel.
    pub fn set_tunnel(&mut self, tunnel: TunnelHandle) {
        self.tunnel = Some(tunnel);
    }

    /// Local port of the running tunnel.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Missing`] before the port-forward step ran.
    pub fn tunnel_port(&self) -> Result<u16, ContextError> {
        self.tunnel
            .as_ref()
            .map(TunnelHandle::local_port)
            .ok_or_else(|| missing("tunnel"))
    }

    /// Removes the tunnel, returning it if one was running.
    pub const fn take_tunnel(&mut self) -> Option<TunnelHandle> {
        self.tunnel.take()
    }

    /// Records the export.
    pub fn set_export(&mut self, export: VirtualMachineExport) {
        self.export = Some(export);
    }

    /// Export of the built VM.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Missing`] before the export step created it.
    pub fn export(&self) -> Result<&VirtualMachineExport, ContextError> {
        self.export.as_ref().ok_or_else(|| missing("export"))
    }

    /// Records the export download token.
    pub fn set_export_token(&mut self, token: String) {
        self.export_token = Some(token);
    }

    /// Export download token.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Missing`] before the export step generated it.
    pub fn export_token(&self) -> Result<&str, ContextError> {
        self.export_token
            .as_deref()
            .ok_or_else(|| missing("export token"))
    }

    /// Records `error` unless an earlier one is already recorded.
    pub fn record_error(&mut self, error: impl Into<BuildError>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    /// First recorded error.
    #[must_use]
    pub const fn error(&self) -> Option<&BuildError> {
        self.error.as_ref()
    }

    /// Removes and returns the first recorded error.
    pub const fn take_error(&mut self) -> Option<BuildError> {
        self.error.take()
    }

    /// Artifact describing the finished build.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Missing`] when the export or its token is
    /// absent.
    pub fn artifact(&self) -> Result<BuildArtifact, ContextError> {
        let export = self.export()?;
        let namespace = export
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| missing("export namespace"))?;
        Ok(BuildArtifact {
            namespace,
            export_name: export.metadata.name.clone(),
            export_token: self.export_token()?.to_owned(),
        })
    }
}
