//! Waits for the forwarded communicator port and runs the provisioner.

use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info};

use crate::config::{BuilderConfig, Communicator, ConfigError};
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::pipeline::{Step, StepAction, StepFuture};

use super::conclude;

const SHELL: &str = "sh";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_PROBE_WINDOW: Duration = Duration::from_secs(1);

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs `program` with `args` and extra environment variables,
    /// capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Spawn`] if the command cannot be started.
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(String, String)],
    ) -> Result<CommandOutput, ProvisionError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(String, String)],
    ) -> Result<CommandOutput, ProvisionError> {
        let output = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(key, value)| (key, value)))
            .output()
            .map_err(|err| ProvisionError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Errors raised while provisioning the guest.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// The forwarded port never accepted a usable connection.
    #[error("guest communicator on 127.0.0.1:{port} not reachable after {timeout:?}")]
    Timeout {
        /// Local port polled.
        port: u16,
        /// Connect timeout that elapsed.
        timeout: Duration,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The provisioner command exited unsuccessfully.
    #[error("provisioner `{command}` exited with status {status_text}: {stderr}")]
    Failed {
        /// Command line that was run.
        command: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
}

impl ProvisionError {
    /// Returns true when the guest never became reachable.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Provisioning knobs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionSettings {
    /// Protocol exposed to the provisioner.
    pub communicator: Communicator,
    /// How long the forwarded port may take to become usable.
    pub connect_timeout: Duration,
    /// Delay between connection attempts.
    pub poll_interval: Duration,
    /// How long a fresh connection must stay open to count as usable.
    pub probe_window: Duration,
    /// Shell command run once the guest is reachable.
    pub command: Option<String>,
}

impl ProvisionSettings {
    /// Settings for the configured communicator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown communicator.
    pub fn from_config(config: &BuilderConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            communicator: config.communicator()?,
            connect_timeout: config.connect_timeout(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            probe_window: DEFAULT_PROBE_WINDOW,
            command: config
                .provisioner_command
                .clone()
                .filter(|command| !command.trim().is_empty()),
        })
    }
}

/// Attempts one connection. The tunnel accepts locally before dialling the
/// guest, so a connection the relay closes straight away means the guest
/// side is not listening yet. A banner or silence both count as usable.
async fn probe(port: u16, window: Duration) -> bool {
    let mut stream = match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(port, error = %err, "communicator port refused connection");
            return false;
        }
    };
    let mut byte = [0_u8; 1];
    match timeout(window, stream.read(&mut byte)).await {
        Ok(Ok(0) | Err(_)) => false,
        Ok(Ok(_)) | Err(_) => true,
    }
}

async fn wait_for_port(port: u16, settings: &ProvisionSettings) -> Result<(), ProvisionError> {
    let deadline = Instant::now() + settings.connect_timeout;
    loop {
        if probe(port, settings.probe_window).await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ProvisionError::Timeout {
                port,
                timeout: settings.connect_timeout,
            });
        }
        sleep(settings.poll_interval).await;
    }
}

/// Waits for the guest and runs the configured provisioner command.
pub struct ProvisionStep<R> {
    runner: Arc<R>,
    settings: ProvisionSettings,
}

impl<R: CommandRunner> ProvisionStep<R> {
    /// Creates the step.
    #[must_use]
    pub const fn new(runner: Arc<R>, settings: ProvisionSettings) -> Self {
        Self { runner, settings }
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<(), BuildError> {
        let port = ctx.tunnel_port()?;
        ctx.ui().say(&format!(
            "waiting for {} on 127.0.0.1:{port}...",
            self.settings.communicator
        ));
        wait_for_port(port, &self.settings).await?;

        let Some(command) = self.settings.command.clone() else {
            ctx.ui().message("no provisioner command configured");
            return Ok(());
        };

        let credentials = ctx.guest_credentials()?;
        let env = vec![
            (String::from("BUILDER_HOST"), Ipv4Addr::LOCALHOST.to_string()),
            (String::from("BUILDER_PORT"), port.to_string()),
            (
                String::from("BUILDER_COMMUNICATOR"),
                self.settings.communicator.to_string(),
            ),
            (String::from("BUILDER_USERNAME"), credentials.username.clone()),
            (String::from("BUILDER_PASSWORD"), credentials.password.clone()),
        ];
        let args = vec![OsString::from("-c"), OsString::from(&command)];

        ctx.ui().say(&format!("running provisioner `{command}`..."));
        info!(command = %command, port, "running provisioner");
        let runner = Arc::clone(&self.runner);
        let output = tokio::task::spawn_blocking(move || runner.run(SHELL, &args, &env))
            .await
            .map_err(|err| ProvisionError::Spawn {
                program: SHELL.to_owned(),
                message: err.to_string(),
            })??;

        for line in output.stdout.lines() {
            ctx.ui().message(line);
        }
        if !output.is_success() {
            return Err(ProvisionError::Failed {
                command,
                status: output.code,
                status_text: output
                    .code
                    .map_or_else(|| String::from("unknown"), |code| code.to_string()),
                stderr: output.stderr.trim().to_owned(),
            }
            .into());
        }

        ctx.ui().say("provisioning step has completed");
        Ok(())
    }
}

impl<R: CommandRunner> Step for ProvisionStep<R> {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let result = self.execute(ctx).await;
            conclude(ctx, result)
        })
    }

    fn cleanup<'a>(
        &'a mut self,
        _ctx: &'a mut BuildContext,
    ) -> StepFuture<'a, Result<(), BuildError>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn settings() -> ProvisionSettings {
        ProvisionSettings {
            communicator: Communicator::Ssh,
            connect_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
            probe_window: Duration::from_millis(50),
            command: None,
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind probe listener");
        listener.local_addr().expect("local addr").port()
    }

    #[rstest]
    #[tokio::test]
    async fn banner_makes_the_port_usable() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            stream.write_all(b"SSH-2.0-test\r\n").await.ok();
        });

        wait_for_port(port, &settings()).await.expect("port usable");
        server.await.ok();
    }

    #[rstest]
    #[tokio::test]
    async fn silent_open_connection_is_usable() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            sleep(Duration::from_millis(200)).await;
            drop(stream);
        });

        wait_for_port(port, &settings()).await.expect("port usable");
        server.abort();
    }

    #[rstest]
    #[tokio::test]
    async fn immediately_closed_connections_time_out() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let err = wait_for_port(port, &settings())
            .await
            .expect_err("relay never reaches the guest");
        assert!(err.is_timeout());
        server.abort();
    }

    #[rstest]
    #[tokio::test]
    async fn closed_port_times_out() {
        let port = free_port().await;
        let err = wait_for_port(port, &settings())
            .await
            .expect_err("nothing listens");
        assert_eq!(
            err,
            ProvisionError::Timeout {
                port,
                timeout: Duration::from_millis(300),
            }
        );
    }

    #[rstest]
    fn process_runner_passes_environment() {
        let output = ProcessCommandRunner
            .run(
                SHELL,
                &[OsString::from("-c"), OsString::from("printf %s \"$BUILDER_PORT\"")],
                &[(String::from("BUILDER_PORT"), String::from("2222"))],
            )
            .expect("sh runs");
        assert!(output.is_success());
        assert_eq!(output.stdout, "2222");
    }
}
