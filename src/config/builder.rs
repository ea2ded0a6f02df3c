//! Image build settings.

use std::fmt;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::generator::{
    ImageSource, ObjectStoreCredentials, OsFamily, UserCredentials, VirtualMachineOptions,
};
use crate::startup_script::startup_script_for;

use super::{ConfigError, FieldMetadata, require_field};

/// Guest account used by the embedded startup scripts.
pub const DEFAULT_GUEST_USERNAME: &str = "packer";
/// Password of the embedded guest account.
pub const DEFAULT_GUEST_PASSWORD: &str = "packer";

const PRIVILEGED_PORT_LIMIT: u16 = 1024;

/// Protocol the provisioner uses to reach the guest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Communicator {
    /// SSH on guest port 22.
    Ssh,
    /// `WinRM` on guest port 5985.
    WinRm,
}

impl Communicator {
    /// Port the guest listens on.
    #[must_use]
    pub const fn guest_port(self) -> u16 {
        match self {
            Self::Ssh => 22,
            Self::WinRm => 5985,
        }
    }
}

impl fmt::Display for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ssh => "ssh",
            Self::WinRm => "winrm",
        })
    }
}

/// Image build settings derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KUBEVIRT_BUILDER",
    discovery(
        app_name = "kubevirt-builder",
        env_var = "KUBEVIRT_BUILDER_CONFIG_PATH",
        config_file_name = "kubevirt-builder.toml",
        dotfile_name = ".kubevirt-builder.toml",
        project_file_name = "kubevirt-builder.toml"
    )
)]
pub struct BuilderConfig {
    /// VM name; every generated object is derived from it.
    pub name: String,
    /// Namespace the build runs in. Created when missing.
    pub namespace: String,
    /// Cluster preference name; anything containing `windows` selects the
    /// Windows layout.
    pub os_preference: String,
    /// Image URL imported into the source data volume.
    pub source_url: String,
    /// Object-storage access key for `source_url`.
    pub source_access_key_id: Option<String>,
    /// Object-storage secret key for `source_url`.
    pub source_secret_access_key: Option<String>,
    /// Size of the primary disk.
    #[ortho_config(default = "10Gi".to_owned())]
    pub disk_space: String,
    /// Guest user whose password is injected through the guest agent.
    pub username: Option<String>,
    /// Password for `username`; generated when omitted.
    pub password: Option<String>,
    /// Inline startup-script override.
    pub startup_script: Option<String>,
    /// Startup-script override read from a file.
    pub startup_script_file: Option<String>,
    /// `ssh` or `winrm`.
    #[ortho_config(default = "ssh".to_owned())]
    pub communicator: String,
    /// Local port forwarded to the guest SSH port.
    #[ortho_config(default = 2222)]
    pub ssh_port: u16,
    /// Local port forwarded to the guest `WinRM` port.
    #[ortho_config(default = 5389)]
    pub winrm_port: u16,
    /// Seconds to wait for the forwarded port to accept connections.
    #[ortho_config(default = 300)]
    pub connect_timeout_secs: u64,
    /// Shell command run once the guest is reachable.
    pub provisioner_command: Option<String>,
    /// Seconds to wait for the VM to report `Ready`.
    #[ortho_config(default = 600)]
    pub deployment_timeout_secs: u64,
    /// Seconds to wait for the generify job.
    #[ortho_config(default = 120)]
    pub generify_timeout_secs: u64,
    /// Seconds to wait for the export to become servable.
    #[ortho_config(default = 300)]
    pub export_timeout_secs: u64,
    /// Provision builder nodes through a Karpenter node pool.
    #[ortho_config(default = false)]
    pub karpenter: bool,
    /// Lifetime of the capacity warm-up job, in seconds.
    #[ortho_config(default = 120)]
    pub warmup_secs: u64,
}

impl BuilderConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kubevirt-builder")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide missing values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is empty, the
    /// communicator is unknown, a port is privileged, a timeout is zero, or
    /// the object-storage key pair is incomplete.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.name,
            &FieldMetadata::new("VM name", "KUBEVIRT_BUILDER_NAME", "name", "builder"),
        )?;
        require_field(
            &self.namespace,
            &FieldMetadata::new(
                "namespace",
                "KUBEVIRT_BUILDER_NAMESPACE",
                "namespace",
                "builder",
            ),
        )?;
        require_field(
            &self.os_preference,
            &FieldMetadata::new(
                "OS preference",
                "KUBEVIRT_BUILDER_OS_PREFERENCE",
                "os_preference",
                "builder",
            ),
        )?;
        require_field(
            &self.source_url,
            &FieldMetadata::new(
                "image source URL",
                "KUBEVIRT_BUILDER_SOURCE_URL",
                "source_url",
                "builder",
            ),
        )?;
        require_field(
            &self.disk_space,
            &FieldMetadata::new(
                "disk size",
                "KUBEVIRT_BUILDER_DISK_SPACE",
                "disk_space",
                "builder",
            ),
        )?;

        let communicator = self.communicator()?;
        let port = self.local_port(communicator);
        if port < PRIVILEGED_PORT_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "{communicator} port {port} is reserved; choose a port of {PRIVILEGED_PORT_LIMIT} or above"
            )));
        }

        for (value, key) in [
            (self.connect_timeout_secs, "connect_timeout_secs"),
            (self.deployment_timeout_secs, "deployment_timeout_secs"),
            (self.generify_timeout_secs, "generify_timeout_secs"),
            (self.export_timeout_secs, "export_timeout_secs"),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
            }
        }

        if self.source_access_key_id.is_some() != self.source_secret_access_key.is_some() {
            return Err(ConfigError::Invalid(String::from(
                "source_access_key_id and source_secret_access_key must be set together",
            )));
        }

        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::Invalid(String::from(
                "password requires username",
            )));
        }

        Ok(())
    }

    /// Parses the communicator name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for anything but `ssh` or `winrm`.
    pub fn communicator(&self) -> Result<Communicator, ConfigError> {
        match self.communicator.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(Communicator::Ssh),
            "winrm" => Ok(Communicator::WinRm),
            other => Err(ConfigError::Invalid(format!(
                "unsupported communicator `{other}`; expected ssh or winrm"
            ))),
        }
    }

    /// Local port forwarded for `communicator`.
    #[must_use]
    pub const fn local_port(&self, communicator: Communicator) -> u16 {
        match communicator {
            Communicator::Ssh => self.ssh_port,
            Communicator::WinRm => self.winrm_port,
        }
    }

    /// OS family selected by the preference string.
    #[must_use]
    pub fn os_family(&self) -> OsFamily {
        OsFamily::from_preference(&self.os_preference)
    }

    /// Readiness timeout for the VM.
    #[must_use]
    pub const fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs)
    }

    /// Completion timeout for the generify job.
    #[must_use]
    pub const fn generify_timeout(&self) -> Duration {
        Duration::from_secs(self.generify_timeout_secs)
    }

    /// Readiness timeout for the export.
    #[must_use]
    pub const fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    /// Timeout for the forwarded port to accept connections.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Lifetime of the warm-up job.
    #[must_use]
    pub const fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    /// Validates the configuration and builds generator input, resolving the
    /// startup script.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation or startup-script resolution
    /// fails.
    pub fn vm_options(&self) -> Result<VirtualMachineOptions, ConfigError> {
        self.validate()?;
        let family = self.os_family();
        let startup_script = startup_script_for(
            family,
            self.startup_script.as_deref(),
            self.startup_script_file.as_deref(),
        )?;

        let credentials = match (&self.source_access_key_id, &self.source_secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(ObjectStoreCredentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
            }),
            _ => None,
        };

        Ok(VirtualMachineOptions {
            name: self.name.trim().to_owned(),
            namespace: self.namespace.trim().to_owned(),
            os_preference: self.os_preference.trim().to_owned(),
            image: ImageSource {
                url: self.source_url.trim().to_owned(),
                credentials,
            },
            disk_space: self.disk_space.trim().to_owned(),
            credentials: self.username.as_ref().map(|username| UserCredentials {
                username: username.clone(),
                password: self.password.clone(),
            }),
            startup_script,
        })
    }
}
