//! Per-job event fan-out.
//!
//! The worker publishes each state transition on a per-job Redis pub/sub
//! channel; subscribers (the SSE endpoint) drain it. Late subscribers are
//! served the terminal event from the persisted job record instead, so the
//! hub itself keeps no long-lived buffers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use uuid::Uuid;

use crate::models::events::{EventEnvelope, TaskEvent};
use crate::services::errors::AnalysisError;

fn channel_for(job_id: Uuid) -> String {
    format!("events:task:{job_id}")
}

/// Progress events must be monotonic per subscriber; pub/sub does not
/// guarantee that under redelivery, so stale ones are dropped on receive.
fn accept_event(last_progress: &mut u32, event: &TaskEvent) -> bool {
    match event.progress_current() {
        Some(current) if current < *last_progress => false,
        Some(current) => {
            *last_progress = current;
            true
        }
        None => true,
    }
}

/// Publishes and subscribes per-job event channels.
#[derive(Clone)]
pub struct EventHub {
    client: redis::Client,
}

impl EventHub {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub async fn publish(
        &self,
        job_id: Uuid,
        seq: u64,
        event: &TaskEvent,
    ) -> Result<(), AnalysisError> {
        let envelope = EventEnvelope {
            job_id,
            seq,
            event: event.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("PUBLISH")
            .arg(channel_for(job_id))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Open a live subscription for a job's channel.
    ///
    /// Callers should subscribe *before* reading the job snapshot so no
    /// event can fall between snapshot and subscription.
    pub async fn subscribe(&self, job_id: Uuid) -> Result<EventSubscription, AnalysisError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel_for(job_id)).await?;
        Ok(EventSubscription {
            pubsub,
            last_progress: 0,
        })
    }
}

/// A live event stream for one job.
pub struct EventSubscription {
    pubsub: redis::aio::PubSub,
    last_progress: u32,
}

impl EventSubscription {
    /// Next event for this job; `None` when the connection closes.
    /// Out-of-order progress events are silently dropped.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        loop {
            let message = self.pubsub.on_message().next().await?;
            let payload: String = match message.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable event payload");
                    continue;
                }
            };
            let envelope: EventEnvelope = match serde_json::from_str(&payload) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed event envelope");
                    continue;
                }
            };
            if accept_event(&mut self.last_progress, &envelope.event) {
                return Some(envelope.event);
            }
        }
    }
}

/// Sequence-stamped publisher bound to one job, shared by the worker's
/// progress sink and terminal transitions.
pub struct JobEventPublisher {
    hub: Arc<EventHub>,
    job_id: Uuid,
    seq: AtomicU64,
}

impl JobEventPublisher {
    pub fn new(hub: Arc<EventHub>, job_id: Uuid) -> Self {
        Self {
            hub,
            job_id,
            seq: AtomicU64::new(0),
        }
    }

    pub async fn publish(&self, event: &TaskEvent) -> Result<(), AnalysisError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.hub.publish(self.job_id, seq, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(current: u32) -> TaskEvent {
        TaskEvent::Progress {
            current,
            total: 5,
            status: "working".to_string(),
            shop_name: None,
        }
    }

    #[test]
    fn stale_progress_is_dropped() {
        let mut last = 0;
        assert!(accept_event(&mut last, &progress(1)));
        assert!(accept_event(&mut last, &progress(2)));
        assert!(!accept_event(&mut last, &progress(1)));
        // Equal progress is delivered (repeated status update).
        assert!(accept_event(&mut last, &progress(2)));
    }

    #[test]
    fn terminal_events_always_accepted() {
        let mut last = 0;
        assert!(accept_event(&mut last, &progress(4)));
        let terminal = TaskEvent::Completed {
            result: serde_json::json!({}),
        };
        assert!(accept_event(&mut last, &terminal));
    }

    #[test]
    fn channel_name_is_job_scoped() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(channel_for(a), channel_for(b));
        assert!(channel_for(a).starts_with("events:task:"));
    }
}
