//! Command-line interface definitions for the `kubevirt-builder` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use camino::Utf8PathBuf;
use clap::Parser;

/// Top-level CLI for the `kubevirt-builder` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kubevirt-builder",
    about = "Build virtual machine images on KubeVirt and ship them to object storage",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Deploy, provision, generify, and export a VM image.
    #[command(name = "build", about = "Deploy, provision, and export a VM image")]
    Build(BuildCommand),
    /// Copy a finished export into object storage.
    #[command(name = "upload", about = "Upload an exported image to object storage")]
    Upload(UploadCommand),
}

/// Arguments for the `kubevirt-builder build` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct BuildCommand {
    /// Also write the build artifact JSON to this file.
    ///
    /// The artifact is always printed on stdout; the file form is what
    /// `kubevirt-builder upload --artifact` reads.
    #[arg(long, value_name = "PATH")]
    pub(crate) artifact_out: Option<Utf8PathBuf>,
}

/// Arguments for the `kubevirt-builder upload` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct UploadCommand {
    /// Artifact written by `kubevirt-builder build --artifact-out`.
    #[arg(long, value_name = "PATH")]
    pub(crate) artifact: Utf8PathBuf,
}
