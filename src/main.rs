//! Binary entry point for the `kubevirt-builder` CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use kubevirt_builder::artifact::{self, ArtifactError};
use kubevirt_builder::{
    BuildError, BuildOrchestrator, BuilderConfig, ClusterConfig, ClusterError, ConfigError,
    ConsoleUi, ProcessCommandRunner, RestCluster, UploadConfig, UploadError, UploadOrchestrator,
};

use cli::{BuildCommand, Cli, UploadCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("cluster client error: {0}")]
    Cluster(#[from] ClusterError),
    #[error("build failed: {0}")]
    Build(#[from] BuildError),
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Build(BuildCommand { artifact_out }) => build(artifact_out.as_deref()).await,
        Cli::Upload(UploadCommand { artifact }) => upload(&artifact).await,
    }
}

fn cluster() -> Result<Arc<RestCluster>, CliError> {
    let config = ClusterConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(Arc::new(RestCluster::new(&config)?))
}

async fn build(artifact_out: Option<&Utf8Path>) -> Result<(), CliError> {
    let config = BuilderConfig::load_without_cli_args()?;
    config.validate()?;

    let orchestrator = BuildOrchestrator::new(cluster()?, Arc::new(ProcessCommandRunner));
    let artifact = orchestrator.execute(&config, Arc::new(ConsoleUi)).await?;

    if let Some(path) = artifact_out {
        artifact::save(&artifact, path)?;
    }
    writeln!(io::stdout(), "{}", artifact::render(&artifact)?).ok();
    Ok(())
}

async fn upload(artifact_path: &Utf8Path) -> Result<(), CliError> {
    let artifact = artifact::load(artifact_path)?;
    let config = UploadConfig::load_without_cli_args()?;
    config.validate()?;

    let orchestrator = UploadOrchestrator::new(cluster()?, config);
    let destination = orchestrator.upload(&ConsoleUi, &artifact).await?;
    writeln!(io::stdout(), "{destination}").ok();
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::Config(ConfigError::Invalid(String::from(
            "unsupported communicator `telnet`; expected ssh or winrm",
        )));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(
            rendered.starts_with("configuration error: invalid configuration:"),
            "rendered: {rendered}"
        );
    }

    #[tokio::test]
    async fn upload_reads_the_artifact_before_touching_the_cluster() {
        let err = upload(Utf8Path::new("/nonexistent/kubevirt-builder/artifact.json"))
            .await
            .expect_err("missing artifact");
        assert!(matches!(err, CliError::Artifact(ArtifactError::Io { .. })), "{err}");
    }
}
