//! Reads and writes the build artifact handed from `build` to `upload`.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::context::BuildArtifact;

/// Errors raised while persisting an artifact.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ArtifactError {
    /// The file could not be read or written.
    #[error("failed to access artifact `{path}`: {message}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// The file does not hold a valid artifact.
    #[error("invalid artifact `{path}`: {message}")]
    Parse {
        /// Path that failed.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

fn open_parent(path: &Utf8Path) -> Result<(Dir, &Utf8Path), String> {
    let file_name = path
        .file_name()
        .map(Utf8Path::new)
        .ok_or_else(|| format!("path has no file name: {path}"))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| err.to_string())?;
    Ok((dir, file_name))
}

/// Serialises `artifact` as pretty JSON.
///
/// # Errors
///
/// Returns [`ArtifactError::Parse`] when serialisation fails.
pub fn render(artifact: &BuildArtifact) -> Result<String, ArtifactError> {
    serde_json::to_string_pretty(artifact).map_err(|err| ArtifactError::Parse {
        path: String::from("<stdout>"),
        message: err.to_string(),
    })
}

/// Writes `artifact` to `path` as JSON.
///
/// # Errors
///
/// Returns [`ArtifactError::Io`] when the file cannot be written.
pub fn save(artifact: &BuildArtifact, path: &Utf8Path) -> Result<(), ArtifactError> {
    let io_error = |message: String| ArtifactError::Io {
        path: path.to_string(),
        message,
    };
    let payload = render(artifact)?;
    let (dir, file_name) = open_parent(path).map_err(io_error)?;
    dir.write(file_name, payload)
        .map_err(|err| io_error(err.to_string()))
}

/// Reads an artifact written by [`save`].
///
/// # Errors
///
/// Returns [`ArtifactError::Io`] when the file cannot be read and
/// [`ArtifactError::Parse`] when it is not a valid artifact.
pub fn load(path: &Utf8Path) -> Result<BuildArtifact, ArtifactError> {
    let io_error = |message: String| ArtifactError::Io {
        path: path.to_string(),
        message,
    };
    let (dir, file_name) = open_parent(path).map_err(io_error)?;
    let content = dir
        .read_to_string(file_name)
        .map_err(|err| io_error(err.to_string()))?;
    serde_json::from_str(&content).map_err(|err| ArtifactError::Parse {
        path: path.to_string(),
        message: err.to_string(),
    })
}
