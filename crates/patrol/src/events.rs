//! Real-time domain events.
//!
//! The engine only knows the [`EventPublisher`] trait. Publication goes
//! through an [`Emitter`], which spawns it and bounds it with a timeout so a
//! slow subscriber can never hold up a scan or an alert transition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::{Alert, Assignment, ScanEvent, Shift, ShiftSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PatrolEvent {
    #[serde(rename = "scan.recorded")]
    ScanRecorded { scan: ScanEvent },

    #[serde(rename = "alert.opened")]
    AlertOpened { alert: Alert },

    #[serde(rename = "alert.acked")]
    AlertAcked { alert: Alert },

    #[serde(rename = "alert.closed")]
    AlertClosed { alert: Alert },

    #[serde(rename = "shift.started")]
    ShiftStarted { shift: Shift },

    #[serde(rename = "shift.ended")]
    ShiftEnded { summary: ShiftSummary },

    #[serde(rename = "assignment.created")]
    AssignmentCreated { assignment: Assignment },
}

impl PatrolEvent {
    /// Wire name, also used as the SSE event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ScanRecorded { .. } => "scan.recorded",
            Self::AlertOpened { .. } => "alert.opened",
            Self::AlertAcked { .. } => "alert.acked",
            Self::AlertClosed { .. } => "alert.closed",
            Self::ShiftStarted { .. } => "shift.started",
            Self::ShiftEnded { .. } => "shift.ended",
            Self::AssignmentCreated { .. } => "assignment.created",
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: PatrolEvent) -> Result<(), PublishError>;
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<PatrolEvent>,
}

impl BroadcastPublisher {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PatrolEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: PatrolEvent) -> Result<(), PublishError> {
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            debug!("No event subscribers");
        }
        Ok(())
    }
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _event: PatrolEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Fire-and-forget wrapper around a publisher.
#[derive(Clone)]
pub struct Emitter {
    publisher: Arc<dyn EventPublisher>,
    timeout: Duration,
}

impl Emitter {
    pub fn new(publisher: Arc<dyn EventPublisher>, timeout: Duration) -> Self {
        Self { publisher, timeout }
    }

    /// Spawn the publication and return immediately. Must be called from
    /// within a Tokio runtime.
    pub fn emit(&self, event: PatrolEvent) {
        let publisher = Arc::clone(&self.publisher);
        let timeout = self.timeout;
        tokio::spawn(async move {
            let name = event.name();
            match tokio::time::timeout(timeout, publisher.publish(event)).await {
                Ok(Ok(())) => debug!(event = name, "Event published"),
                Ok(Err(e)) => warn!(event = name, error = %e, "Failed to publish event"),
                Err(_) => warn!(
                    event = name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Event publication timed out"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertKind, AlertMeta, AlertStatus, AuditStamp};
    use chrono::Utc;
    use uuid::Uuid;

    fn alert() -> Alert {
        Alert {
            id: Uuid::new_v4(),
            kind: AlertKind::Panic,
            severity: AlertKind::Panic.default_severity(),
            status: AlertStatus::Open,
            shift_id: None,
            guard_id: Some("g-1".to_string()),
            meta: AlertMeta::default(),
            geo: None,
            note: None,
            opened: AuditStamp::new("g-1", Utc::now(), None),
            acked: None,
            closed: None,
        }
    }

    struct StuckPublisher;

    #[async_trait]
    impl EventPublisher for StuckPublisher {
        async fn publish(&self, _event: PatrolEvent) -> Result<(), PublishError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn test_event_tag_uses_dotted_name() {
        let event = PatrolEvent::AlertOpened { alert: alert() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "alert.opened");
        assert_eq!(event.name(), "alert.opened");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let bus = BroadcastPublisher::new(8);
        let mut rx = bus.subscribe();
        let emitter = Emitter::new(Arc::new(bus.clone()), Duration::from_millis(100));

        emitter.emit(PatrolEvent::AlertOpened { alert: alert() });

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event should arrive")
            .unwrap();
        assert_eq!(received.name(), "alert.opened");
    }

    #[tokio::test]
    async fn test_stuck_publisher_does_not_block_caller() {
        let emitter = Emitter::new(Arc::new(StuckPublisher), Duration::from_millis(10));
        let started = std::time::Instant::now();
        emitter.emit(PatrolEvent::AlertOpened { alert: alert() });
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = BroadcastPublisher::default();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus
            .publish(PatrolEvent::AlertClosed { alert: alert() })
            .await
            .is_ok());
    }
}
