//! Batch (`batch/v1`) jobs.

use serde::{Deserialize, Serialize};

use super::core::PodTemplateSpec;
use super::{Condition, ObjectMeta, impl_resource};

/// Run-to-completion workload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Job {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Desired behaviour.
    #[serde(default)]
    pub spec: JobSpec,
    /// Observed status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

impl_resource!(Job, "batch/v1", "Job", "jobs", true);

impl Job {
    /// Conditions reported by the job controller, empty before the first update.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }
}

/// Job specification.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Pod template.
    pub template: PodTemplateSpec,
    /// Seconds after completion before the job is reaped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
    /// Retries before the job is marked failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
}

/// Observed job status.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct JobStatus {
    /// `Complete`, `Failed`, `FailureTarget`, ...
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
