use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{FailureKind, JobError};

/// An event published on a job's stream.
///
/// Exactly one `Completed` or `Failed` event is emitted per job; progress
/// events precede it with `current` monotonically non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    Progress {
        current: u32,
        total: u32,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        shop_name: Option<String>,
    },
    Completed {
        result: serde_json::Value,
    },
    Failed {
        error_kind: FailureKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        completed_stages: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        failed_stage: Option<String>,
    },
}

impl TaskEvent {
    pub fn failed_from(error: &JobError) -> Self {
        TaskEvent::Failed {
            error_kind: error.kind,
            message: error.message.clone(),
            details: error.details.clone(),
            completed_stages: error.completed_stages.clone(),
            failed_stage: error.failed_stage.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskEvent::Progress { .. })
    }

    /// SSE event name for this event.
    pub fn event_name(&self) -> &'static str {
        match self {
            TaskEvent::Progress { .. } => "progress",
            TaskEvent::Completed { .. } => "completed",
            TaskEvent::Failed { .. } => "failed",
        }
    }

    /// Progress position, if this is a progress event.
    pub fn progress_current(&self) -> Option<u32> {
        match self {
            TaskEvent::Progress { current, .. } => Some(*current),
            _ => None,
        }
    }
}

/// Wire envelope for the pub/sub channel: the event plus its job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub job_id: Uuid,
    pub seq: u64,
    #[serde(flatten)]
    pub event: TaskEvent,
}
