//! Jobs submitted to the cluster and everything known about them.
//!
//! A [`Job`] is owned by the [`store::JobStore`]; the [`runner::JobRunner`]
//! drives it from the live log stream and a background reconciliation loop,
//! and [`events`] re-expresses its state as a stream of status events.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod events;
pub mod parse;
pub mod runner;
pub mod store;

/// Lifecycle of a submitted job. Transitions only move forward:
/// `pending -> running -> {completed | failed}`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a job in this status may be moved to `next`. Re-asserting the
    /// current status is allowed and is a no-op.
    pub fn can_become(&self, next: JobStatus) -> bool {
        *self == next || (!self.is_terminal() && next.rank() > self.rank())
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A scheduler job discovered while a pipeline ran.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubJob {
    pub scheduler_job_id: String,
    pub rule_name: String,
    pub state: String,
    pub elapsed: String,
}

/// Container metadata announced by the pipeline. Only a few keys are known;
/// anything else is carried along untouched.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sif: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub owner_id: Option<String>,
    pub status: JobStatus,
    pub phase: String,
    pub target: String,
    pub sub_jobs: Vec<SubJob>,
    pub containers: Vec<ContainerRef>,
    pub work_dir: Option<String>,
    pub steps_done: u32,
    pub steps_total: u32,
    pub progress_percent: u32,
    pub log: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Job {
    pub fn new<S: Into<String>, T: Into<String>>(job_id: S, target: T, owner_id: Option<String>) -> Self {
        Self {
            job_id: job_id.into(),
            owner_id,
            status: JobStatus::Pending,
            phase: "Initializing".into(),
            target: target.into(),
            sub_jobs: vec![],
            containers: vec![],
            work_dir: None,
            steps_done: 0,
            steps_total: 0,
            progress_percent: 0,
            log: String::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Whether `caller` may see this job. Jobs without an owner are visible
    /// to everyone.
    pub fn visible_to(&self, caller: Option<&str>) -> bool {
        match &self.owner_id {
            None => true,
            Some(owner) => caller == Some(owner.as_str()),
        }
    }
}

/// A partial update; `None` fields are left alone.
#[derive(Clone, Debug, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub phase: Option<String>,
    pub work_dir: Option<String>,
    pub steps_done: Option<u32>,
    pub steps_total: Option<u32>,
    pub progress_percent: Option<u32>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_phase<S: Into<String>>(mut self, phase: S) -> Self {
        self.phase = Some(phase.into());
        self
    }
}
