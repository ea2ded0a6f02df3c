//! Sequential step execution with reverse-order cleanup.
//!
//! Steps run in order against a shared [`BuildContext`]. When a step halts
//! the runner stops; either way every step that ran is cleaned up, last
//! first.

use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

use crate::context::BuildContext;
use crate::error::BuildError;

/// Boxed future returned by [`Step`] methods.
pub type StepFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of [`Step::run`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepAction {
    /// Proceed to the next step.
    Continue,
    /// Stop the pipeline; the step has recorded why in the context.
    Halt,
}

/// One stage of the build.
pub trait Step: Send {
    /// Name used in logs and reports.
    fn name(&self) -> &'static str;

    /// Performs the step. Failures are recorded in `ctx` and reported as
    /// [`StepAction::Halt`].
    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a, StepAction>;

    /// Releases what `run` acquired. Must be a no-op when the resource is
    /// absent from `ctx`.
    fn cleanup<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a, Result<(), BuildError>>;
}

/// What a pipeline run did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunReport {
    /// Names of the steps whose `run` executed, in order.
    pub executed: Vec<&'static str>,
    /// Whether a step halted the pipeline.
    pub halted: bool,
}

/// Executes an ordered list of steps.
pub struct Runner {
    steps: Vec<Box<dyn Step>>,
}

impl Runner {
    /// Creates a runner over `steps`.
    #[must_use]
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    /// Runs every step until one halts, then cleans up the executed prefix
    /// in reverse. Cleanup failures are logged and shown, never recorded as
    /// the build error.
    pub async fn run(&mut self, ctx: &mut BuildContext) -> RunReport {
        let mut report = RunReport::default();
        let mut executed = 0_usize;

        for step in &mut self.steps {
            info!(step = step.name(), "running step");
            executed += 1;
            report.executed.push(step.name());
            if step.run(ctx).await == StepAction::Halt {
                warn!(step = step.name(), "step halted the build");
                report.halted = true;
                if ctx.error().is_none() {
                    ctx.record_error(BuildError::Halted {
                        step: step.name().to_owned(),
                    });
                }
                break;
            }
        }

        for step in self.steps.iter_mut().take(executed).rev() {
            if let Err(err) = step.cleanup(ctx).await {
                warn!(step = step.name(), error = %err, "cleanup failed");
                ctx.ui()
                    .error(&format!("cleanup of {} failed: {err}", step.name()));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests;
