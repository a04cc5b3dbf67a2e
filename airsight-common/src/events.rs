//! Pipeline event types and EventBus
//!
//! Scheduler jobs and the model registry publish lifecycle events here so the
//! scheduler collaborator can surface alerts without polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Pipeline event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A scheduler entry point started
    JobStarted {
        run_id: Uuid,
        job: String,
        timestamp: DateTime<Utc>,
    },

    /// A scheduler entry point finished (successfully or not)
    JobFinished {
        run_id: Uuid,
        job: String,
        ok: bool,
        processed: usize,
        rejected: usize,
        timestamp: DateTime<Utc>,
    },

    /// A newly trained model became the active version
    ModelSwapped {
        pollutant: String,
        version: i64,
        r2: f64,
        rmse: f64,
        timestamp: DateTime<Utc>,
    },

    /// Training was skipped for lack of data; the prior model stays active
    TrainingSkipped {
        pollutant: String,
        available_rows: usize,
        required_rows: usize,
        timestamp: DateTime<Utc>,
    },

    /// Training or persistence failed; the prior model stays active
    ModelAlert {
        pollutant: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Event type name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::JobStarted { .. } => "JobStarted",
            PipelineEvent::JobFinished { .. } => "JobFinished",
            PipelineEvent::ModelSwapped { .. } => "ModelSwapped",
            PipelineEvent::TrainingSkipped { .. } => "TrainingSkipped",
            PipelineEvent::ModelAlert { .. } => "ModelAlert",
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally: publishing never blocks, slow
/// subscribers observe lag, dropped receivers are cleaned up automatically.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PipelineEvent,
    ) -> Result<usize, broadcast::error::SendError<PipelineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let event_type = event.event_type();
        if self.tx.send(event).is_err() {
            tracing::trace!(event_type, "No subscribers for pipeline event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        bus.emit(PipelineEvent::TrainingSkipped {
            pollutant: "PM2.5".to_string(),
            available_rows: 999,
            required_rows: 1000,
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            PipelineEvent::TrainingSkipped { available_rows, .. } => {
                assert_eq!(available_rows, 999)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_errors_but_lossy_does_not_panic() {
        let bus = EventBus::new(10);
        let event = PipelineEvent::ModelAlert {
            pollutant: "NO2".to_string(),
            message: "swap failed".to_string(),
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 10);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = PipelineEvent::JobStarted {
            run_id: Uuid::nil(),
            job: "harmonization".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "JobStarted");
        assert_eq!(json["job"], "harmonization");
    }
}
