//! Configuration loading via `ortho-config`.
//!
//! Three independent sections are read from the same layered sources
//! (defaults, `kubevirt-builder.toml`, environment variables):
//! [`ClusterConfig`] for API access, [`BuilderConfig`] for the image build,
//! and [`UploadConfig`] for the object-storage hand-off.

mod builder;
mod upload;

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::startup_script::StartupScriptError;

pub use builder::{BuilderConfig, Communicator, DEFAULT_GUEST_PASSWORD, DEFAULT_GUEST_USERNAME};
pub use upload::UploadConfig;

/// Configuration file consulted by every section.
pub const CONFIG_FILE_NAME: &str = "kubevirt-builder.toml";

/// Cluster API access settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KUBEVIRT_CLUSTER",
    discovery(
        app_name = "kubevirt-builder",
        env_var = "KUBEVIRT_BUILDER_CONFIG_PATH",
        config_file_name = "kubevirt-builder.toml",
        dotfile_name = ".kubevirt-builder.toml",
        project_file_name = "kubevirt-builder.toml"
    )
)]
pub struct ClusterConfig {
    /// Base URL of an authenticating API endpoint such as `kubectl proxy`.
    #[ortho_config(default = "http://127.0.0.1:8001".to_owned())]
    pub api_url: String,
    /// Optional bearer token forwarded with every request.
    pub token: Option<String>,
    /// Seconds any non-watch API request may take, connection included.
    #[ortho_config(default = 30)]
    pub request_timeout_secs: u64,
}

impl ClusterConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kubevirt-builder")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that the API endpoint is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the URL is empty and
    /// [`ConfigError::Invalid`] when it is not an HTTP(S) URL or the request
    /// timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.api_url,
            &FieldMetadata::new(
                "cluster API URL",
                "KUBEVIRT_CLUSTER_API_URL",
                "api_url",
                "cluster",
            ),
        )?;
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "cluster API URL `{}` must start with http:// or https://",
                self.api_url
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "request_timeout_secs must be greater than zero",
            )));
        }
        Ok(())
    }

    /// Deadline for a single non-watch API request.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
pub(crate) struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    pub(crate) const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

pub(crate) fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in {CONFIG_FILE_NAME}",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when a startup-script override cannot be resolved.
    #[error(transparent)]
    StartupScript(#[from] StartupScriptError),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("")]
    #[case("   ")]
    fn empty_api_url_names_env_var_and_file(#[case] url: &str) {
        let config = ClusterConfig {
            api_url: url.to_owned(),
            token: None,
            request_timeout_secs: 30,
        };
        let err = config.validate().expect_err("empty URL should be rejected");
        let message = err.to_string();
        assert!(message.contains("KUBEVIRT_CLUSTER_API_URL"), "{message}");
        assert!(message.contains(CONFIG_FILE_NAME), "{message}");
    }

    #[rstest]
    fn non_http_api_url_is_invalid() {
        let config = ClusterConfig {
            api_url: String::from("127.0.0.1:8001"),
            token: None,
            request_timeout_secs: 30,
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
