//! Blocks until a watched object satisfies a readiness predicate.
//!
//! [`wait_for_condition`] opens a watch scoped to one object and feeds every
//! event to a predicate until it reports success, reports a terminal failure,
//! or the deadline passes. The predicates for VM readiness, export readiness,
//! and job completion live here too.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::cluster::{Cluster, ClusterError, ObjectRef, WatchEvent};
use crate::resources::Resource;
use crate::resources::batch::Job;
use crate::resources::kubevirt::{ExportPhase, VirtualMachine, VirtualMachineExport};
use crate::ui::Ui;

/// Failure reported by a predicate; ends the wait without retry.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct TerminalCondition(pub String);

/// Errors returned by [`wait_for_condition`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    /// The predicate was not satisfied before the deadline.
    #[error("timed out after {timeout:?} waiting for {kind} {target}")]
    Timeout {
        /// Kind of the watched object.
        kind: &'static str,
        /// Watched object.
        target: String,
        /// Configured timeout.
        timeout: Duration,
    },
    /// The object reached a state it cannot recover from.
    #[error("{kind} {target} failed: {reason}")]
    Terminal {
        /// Kind of the watched object.
        kind: &'static str,
        /// Watched object.
        target: String,
        /// Failure reported by the predicate.
        reason: String,
    },
    /// The object was deleted while waiting.
    #[error("{kind} {target} was deleted while waiting")]
    Deleted {
        /// Kind of the watched object.
        kind: &'static str,
        /// Watched object.
        target: String,
    },
    /// The event stream ended before the predicate was satisfied.
    #[error("watch on {kind} {target} closed unexpectedly")]
    Closed {
        /// Kind of the watched object.
        kind: &'static str,
        /// Watched object.
        target: String,
    },
    /// The watch could not be opened or delivered an error event.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl WaitError {
    /// Returns true for deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true for predicate-reported failures.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}

/// Watches `target` until `predicate` accepts an event.
///
/// The matching event is returned. `Deleted` events end the wait before the
/// predicate sees them.
///
/// # Errors
///
/// Returns [`WaitError::Timeout`] when `timeout` elapses,
/// [`WaitError::Terminal`] when the predicate fails, [`WaitError::Deleted`]
/// or [`WaitError::Closed`] when the stream can no longer succeed, and
/// [`WaitError::Cluster`] for watch failures.
pub async fn wait_for_condition<C, R, F>(
    cluster: &C,
    target: &ObjectRef,
    timeout: Duration,
    mut predicate: F,
) -> Result<WatchEvent<R>, WaitError>
where
    C: Cluster,
    R: Resource,
    F: FnMut(&WatchEvent<R>) -> Result<bool, TerminalCondition>,
{
    let deadline = Instant::now() + timeout;
    let timed_out = |_| WaitError::Timeout {
        kind: R::KIND,
        target: target.to_string(),
        timeout,
    };

    let mut subscription = timeout_at(deadline, cluster.watch::<R>(target))
        .await
        .map_err(timed_out)??;

    loop {
        let Some(received) = timeout_at(deadline, subscription.next())
            .await
            .map_err(timed_out)?
        else {
            return Err(WaitError::Closed {
                kind: R::KIND,
                target: target.to_string(),
            });
        };
        let event = received?;

        if matches!(event, WatchEvent::Deleted(_)) {
            return Err(WaitError::Deleted {
                kind: R::KIND,
                target: target.to_string(),
            });
        }

        match predicate(&event) {
            Ok(true) => return Ok(event),
            Ok(false) => debug!(kind = R::KIND, %target, "condition not yet met"),
            Err(TerminalCondition(reason)) => {
                return Err(WaitError::Terminal {
                    kind: R::KIND,
                    target: target.to_string(),
                    reason,
                });
            }
        }
    }
}

/// Accepts a VM once it reports `Ready=True`.
///
/// Each change of the first condition is reported to `ui`.
pub fn vm_ready(
    ui: &dyn Ui,
) -> impl FnMut(&WatchEvent<VirtualMachine>) -> Result<bool, TerminalCondition> + '_ {
    let mut last_reported: Option<String> = None;
    move |event| {
        let conditions = event.object().conditions();
        if let Some(first) = conditions.first() {
            let summary = format!(
                "{}={} {}",
                first.type_,
                first.status,
                first.message.as_deref().unwrap_or_default()
            )
            .trim_end()
            .to_owned();
            if last_reported.as_deref() != Some(summary.as_str()) {
                ui.message(&summary);
                last_reported = Some(summary);
            }
        }
        Ok(conditions.iter().any(|condition| condition.is_true("Ready")))
    }
}

/// Accepts an export in phase `Ready`; `Skipped` and `Terminated` are
/// terminal.
///
/// # Errors
///
/// Returns [`TerminalCondition`] for a phase the export cannot leave.
pub fn export_ready(event: &WatchEvent<VirtualMachineExport>) -> Result<bool, TerminalCondition> {
    match event.object().phase() {
        Some(ExportPhase::Ready) => Ok(true),
        Some(phase @ (ExportPhase::Skipped | ExportPhase::Terminated)) => Err(TerminalCondition(
            format!("export entered phase {phase:?}"),
        )),
        Some(ExportPhase::Pending | ExportPhase::Unknown) | None => Ok(false),
    }
}

/// Accepts a job once it reports `Complete=True`; `Failed` and
/// `FailureTarget` are terminal.
///
/// # Errors
///
/// Returns [`TerminalCondition`] when the job failed.
pub fn job_complete(event: &WatchEvent<Job>) -> Result<bool, TerminalCondition> {
    let conditions = event.object().conditions();
    if let Some(failed) = conditions
        .iter()
        .find(|condition| condition.is_true("Failed") || condition.is_true("FailureTarget"))
    {
        return Err(TerminalCondition(format!(
            "job condition {}: {}",
            failed.type_,
            failed
                .message
                .as_deref()
                .or(failed.reason.as_deref())
                .unwrap_or("no message")
        )));
    }
    Ok(conditions.iter().any(|condition| condition.is_true("Complete")))
}
