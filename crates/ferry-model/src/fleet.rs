//! Fleet orchestration types
//!
//! These exist only for the lifetime of one orchestration run.

use crate::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a device's job within a fleet run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Not attempted (unreachable, in use, cancelled); retry later
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One device's job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetJob {
    pub device_id: String,
    pub status: JobStatus,

    /// Why the job was skipped or failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Stage the device's record reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_stage: Option<Stage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl FleetJob {
    pub fn pending(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            status: JobStatus::Pending,
            reason: None,
            final_stage: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: JobStatus, reason: Option<String>, final_stage: Option<Stage>) {
        self.status = status;
        self.reason = reason;
        self.final_stage = final_stage;
        self.ended_at = Some(Utc::now());
    }
}

/// Aggregate counts over a fleet run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub running: usize,
}

impl Summary {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a FleetJob>) -> Self {
        let mut summary = Summary::default();
        for job in jobs {
            summary.total += 1;
            match job.status {
                JobStatus::Pending => summary.pending += 1,
                JobStatus::Running => summary.running += 1,
                JobStatus::Succeeded => summary.succeeded += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    /// Whether every job reached a terminal status
    pub fn is_complete(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total: {} succeeded, {} failed, {} skipped, {} running, {} pending",
            self.total, self.succeeded, self.failed, self.skipped, self.running, self.pending
        )
    }
}

/// Final result of a fleet run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetReport {
    pub summary: Summary,
    pub jobs: Vec<FleetJob>,

    /// Highest number of simultaneously running jobs observed
    pub peak_running: usize,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl FleetReport {
    pub fn job(&self, device_id: &str) -> Option<&FleetJob> {
        self.jobs.iter().find(|j| j.device_id == device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut jobs = vec![
            FleetJob::pending("a"),
            FleetJob::pending("b"),
            FleetJob::pending("c"),
            FleetJob::pending("d"),
        ];
        jobs[0].start();
        jobs[1].finish(JobStatus::Succeeded, None, Some(Stage::Completed));
        jobs[2].finish(JobStatus::Skipped, Some("unreachable".to_string()), None);

        let summary = Summary::from_jobs(&jobs);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.pending, 1);
        assert!(!summary.is_complete());

        jobs[0].finish(JobStatus::Failed, Some("rolled back".to_string()), Some(Stage::RolledBack));
        jobs[3].finish(JobStatus::Succeeded, None, Some(Stage::Completed));
        let summary = Summary::from_jobs(&jobs);
        assert!(summary.is_complete());
        assert_eq!(
            summary.to_string(),
            "4 total: 2 succeeded, 1 failed, 1 skipped, 0 running, 0 pending"
        );
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
    }
}
