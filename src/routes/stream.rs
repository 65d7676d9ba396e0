//! Live task event streaming over SSE.
//!
//! The subscription is opened before the job snapshot is read: if the
//! snapshot is already terminal the stored terminal event is replayed and
//! the stream closes, otherwise live pub/sub events are forwarded until the
//! terminal one arrives. Either way the stream ends after exactly one
//! terminal event.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::jobs;
use crate::models::events::TaskEvent;
use crate::models::job::{AnalysisJob, FailureKind, JobError, JobStatus};
use crate::services::events::EventSubscription;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Reconstruct the terminal event from a persisted job record.
fn terminal_event_for(job: &AnalysisJob) -> Option<TaskEvent> {
    match job.status {
        JobStatus::Completed => Some(TaskEvent::Completed {
            result: job.result.clone().unwrap_or(serde_json::Value::Null),
        }),
        JobStatus::Failed => {
            let error = job
                .error
                .clone()
                .unwrap_or_else(|| JobError::new(FailureKind::Unknown, "job failed"));
            Some(TaskEvent::failed_from(&error))
        }
        _ => None,
    }
}

fn sse_event(event: &TaskEvent) -> Event {
    match Event::default().event(event.event_name()).json_data(event) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode SSE event");
            Event::default().event("error").data("{}")
        }
    }
}

enum StreamState {
    /// Job already terminal at subscribe time: replay once, then close.
    Replay(Box<TaskEvent>),
    /// Forward live events until a terminal one.
    Live(Box<EventSubscription>),
    Done,
}

fn event_stream(initial: StreamState) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(initial, |state| async move {
        match state {
            StreamState::Replay(event) => Some((Ok(sse_event(&event)), StreamState::Done)),
            StreamState::Live(mut subscription) => match subscription.next_event().await {
                Some(event) if event.is_terminal() => {
                    Some((Ok(sse_event(&event)), StreamState::Done))
                }
                Some(event) => Some((Ok(sse_event(&event)), StreamState::Live(subscription))),
                None => None,
            },
            StreamState::Done => None,
        }
    })
}

/// GET /api/v1/tasks/{task_id}/stream — SSE progress and terminal events.
pub async fn stream_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    // Subscribe first so no event can slip between snapshot and subscription.
    let subscription = state
        .events
        .subscribe(task_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Stream error: {e}")))?;

    let job = jobs::get_job(&state.db, task_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {e}")))?
        .ok_or((StatusCode::NOT_FOUND, "Task not found".to_string()))?;

    let initial = match terminal_event_for(&job) {
        Some(event) => {
            tracing::debug!(job_id = %task_id, "late subscriber, replaying terminal event");
            StreamState::Replay(Box::new(event))
        }
        None => StreamState::Live(Box::new(subscription)),
    };

    Ok(Sse::new(event_stream(initial)).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}
