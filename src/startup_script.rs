//! Startup-script resolution.
//!
//! The guest's first-boot payload is cloud-config user data on Linux and an
//! `autounattend.xml` answer file on Windows. Operators may override it
//! inline or from a file; otherwise the payload embedded in the binary for
//! the VM's OS family is used.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::generator::OsFamily;

const LINUX_CLOUD_INIT: &str = include_str!("../scripts/cloud-init.yaml");
const WINDOWS_AUTOUNATTEND: &str = include_str!("../scripts/autounattend.xml");

/// Errors raised while resolving a startup-script override.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StartupScriptError {
    /// Raised when both inline and file sources are provided.
    #[error("startup script cannot be provided both inline and via file")]
    BothProvided,
    /// Raised when an inline payload is empty or only whitespace.
    #[error("startup script must not be empty")]
    InlineEmpty,
    /// Raised when a file path is empty or only whitespace.
    #[error("startup script file path must not be empty")]
    FilePathEmpty,
    /// Raised when a file resolves to empty or only whitespace.
    #[error("startup script file must not be empty")]
    FileEmpty,
    /// Raised when reading the file source fails.
    #[error("failed to read startup script file `{path}`: {message}")]
    FileRead {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Built-in payload for `family`.
#[must_use]
pub const fn default_startup_script(family: OsFamily) -> &'static str {
    match family {
        OsFamily::Linux => LINUX_CLOUD_INIT,
        OsFamily::Windows => WINDOWS_AUTOUNATTEND,
    }
}

/// Resolves the startup script for `family`, preferring an override.
///
/// # Errors
///
/// Returns [`StartupScriptError`] when the override is invalid or its file
/// cannot be read.
pub fn startup_script_for(
    family: OsFamily,
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<String, StartupScriptError> {
    Ok(resolve_startup_script(inline, file)?
        .unwrap_or_else(|| default_startup_script(family).to_owned()))
}

/// Resolves a startup-script override from either an inline value or a file.
///
/// Inline and file sources are mutually exclusive. Both values are trimmed for
/// emptiness checks, but the returned payload preserves the original content.
///
/// # Errors
///
/// Returns [`StartupScriptError`] when the inputs are invalid or the file
/// cannot be read.
pub fn resolve_startup_script(
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<Option<String>, StartupScriptError> {
    if inline.is_some() && file.is_some() {
        return Err(StartupScriptError::BothProvided);
    }

    if let Some(payload) = inline {
        if payload.trim().is_empty() {
            return Err(StartupScriptError::InlineEmpty);
        }
        return Ok(Some(payload.to_owned()));
    }

    let Some(path) = file else {
        return Ok(None);
    };

    if path.trim().is_empty() {
        return Err(StartupScriptError::FilePathEmpty);
    }

    let expanded = expand_tilde(path);
    let content =
        read_to_string_ambient(&expanded).map_err(|message| StartupScriptError::FileRead {
            path: expanded.clone(),
            message,
        })?;

    if content.trim().is_empty() {
        return Err(StartupScriptError::FileEmpty);
    }

    Ok(Some(content))
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let path_buf = Utf8Path::new(path);

    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}
