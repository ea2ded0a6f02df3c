//! Object-storage upload settings.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use super::{ConfigError, FieldMetadata, require_field};

/// Destination of an exported image.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KUBEVIRT_UPLOAD",
    discovery(
        app_name = "kubevirt-builder",
        env_var = "KUBEVIRT_BUILDER_CONFIG_PATH",
        config_file_name = "kubevirt-builder.toml",
        dotfile_name = ".kubevirt-builder.toml",
        project_file_name = "kubevirt-builder.toml"
    )
)]
pub struct UploadConfig {
    /// Destination bucket.
    pub bucket: String,
    /// Key prefix inside the bucket.
    #[ortho_config(default = String::new())]
    pub key_prefix: String,
    /// Access key for the bucket.
    pub access_key_id: String,
    /// Secret key for the bucket.
    pub secret_access_key: String,
    /// Bucket region.
    pub region: String,
    /// Seconds to wait for the upload job to finish.
    #[ortho_config(default = 1800)]
    pub timeout_secs: u64,
}

impl UploadConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kubevirt-builder")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that the destination and its credentials are complete.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for an empty required field and
    /// [`ConfigError::Invalid`] for a zero timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.bucket,
            &FieldMetadata::new("bucket", "KUBEVIRT_UPLOAD_BUCKET", "bucket", "upload"),
        )?;
        require_field(
            &self.access_key_id,
            &FieldMetadata::new(
                "upload access key",
                "KUBEVIRT_UPLOAD_ACCESS_KEY_ID",
                "access_key_id",
                "upload",
            ),
        )?;
        require_field(
            &self.secret_access_key,
            &FieldMetadata::new(
                "upload secret key",
                "KUBEVIRT_UPLOAD_SECRET_ACCESS_KEY",
                "secret_access_key",
                "upload",
            ),
        )?;
        require_field(
            &self.region,
            &FieldMetadata::new("region", "KUBEVIRT_UPLOAD_REGION", "region", "upload"),
        )?;
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "timeout_secs must be greater than zero",
            )));
        }
        Ok(())
    }

    /// Completion timeout for the upload job.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
