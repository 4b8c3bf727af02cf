pub mod manager;

use crate::error::{ErrorKind, MergeError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub use manager::JobManager;

/// Lifecycle of one merge job, as published to status and event subscribers.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Staging,
    Merging {
        clip: usize,
        clips: usize,
        percent: u8,
    },
    Done {
        size_bytes: u64,
        duration_secs: f64,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled
        )
    }

    /// Value of the `state` tag.
    pub fn state(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Staging => "staging",
            JobStatus::Merging { .. } => "merging",
            JobStatus::Done { .. } => "done",
            JobStatus::Failed { .. } => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, JobStatus::Done { .. })
    }

    pub fn failed(error: &MergeError) -> Self {
        JobStatus::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Snapshot returned by `GET /jobs/{id}`.
#[derive(Clone, Debug, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub clips: usize,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: JobStatus,
}
