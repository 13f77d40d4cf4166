//! Outbound notifications to guards and supervisors.

use chrono::Utc;
use std::collections::HashMap;

use notify::{Notifier, NotifyEvent, Severity};

use crate::types::{Alert, AlertSeverity, Assignment, Round};

/// Fire-and-forget delivery; implementations log failures instead of
/// returning them.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    fn notify(&self, guard_id: &str, message: &str);
    fn alert_raised(&self, alert: &Alert);
    fn assignment_created(&self, assignment: &Assignment, round: &Round);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, _guard_id: &str, _message: &str) {}
    fn alert_raised(&self, _alert: &Alert) {}
    fn assignment_created(&self, _assignment: &Assignment, _round: &Round) {}
}

impl NotificationSink for Notifier {
    fn notify(&self, guard_id: &str, message: &str) {
        Notifier::notify(
            self,
            NotifyEvent::GuardMessage {
                guard_id: guard_id.to_string(),
                message: message.to_string(),
                timestamp: Utc::now(),
            },
        );
    }

    fn alert_raised(&self, alert: &Alert) {
        Notifier::notify(self, alert_event(alert));
    }

    fn assignment_created(&self, assignment: &Assignment, round: &Round) {
        Notifier::notify(
            self,
            NotifyEvent::AssignmentCreated {
                guard_id: assignment.guard_id.clone(),
                round_name: round.name.clone(),
                date: assignment.date,
                start_time: assignment.start_time.format("%H:%M").to_string(),
                end_time: assignment.end_time.format("%H:%M").to_string(),
                timestamp: Utc::now(),
            },
        );
    }
}

fn alert_event(alert: &Alert) -> NotifyEvent {
    let severity = match alert.severity {
        AlertSeverity::Critical | AlertSeverity::High => Severity::Critical,
        AlertSeverity::Medium => Severity::Warning,
        AlertSeverity::Low => Severity::Info,
    };

    let mut context = HashMap::new();
    if let Some(shift_id) = alert.shift_id {
        context.insert("shift".to_string(), shift_id.to_string());
    }
    if let Some(code) = &alert.meta.cp_code {
        context.insert("checkpoint".to_string(), code.clone());
    }
    if let Some(geo) = &alert.geo {
        context.insert("location".to_string(), format!("{:.5},{:.5}", geo.lat, geo.lng));
    }

    let message = alert.note.clone().unwrap_or_else(|| match &alert.meta.cp_code {
        Some(code) => format!("Checkpoint {code} was not scanned in time"),
        None => format!("{} alert raised", alert.kind.as_str()),
    });

    NotifyEvent::AlertRaised {
        alert_id: alert.id.to_string(),
        kind: alert.kind.as_str().to_string(),
        severity,
        guard_id: alert.guard_id.clone(),
        message,
        context,
        timestamp: alert.opened.at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertKind, AlertMeta, AlertStatus, AuditStamp, Geo};
    use uuid::Uuid;

    #[test]
    fn test_alert_event_maps_severity_and_context() {
        let alert = Alert {
            id: Uuid::new_v4(),
            kind: AlertKind::Immobility,
            severity: AlertSeverity::High,
            status: AlertStatus::Open,
            shift_id: Some(Uuid::nil()),
            guard_id: Some("g-4".to_string()),
            meta: AlertMeta::default(),
            geo: Some(Geo {
                lat: -33.4489,
                lng: -70.6693,
                accuracy: None,
            }),
            note: None,
            opened: AuditStamp::new("g-4", Utc::now(), None),
            acked: None,
            closed: None,
        };

        match alert_event(&alert) {
            NotifyEvent::AlertRaised {
                severity,
                context,
                message,
                ..
            } => {
                assert_eq!(severity, Severity::Critical);
                assert_eq!(context["location"], "-33.44890,-70.66930");
                assert_eq!(message, "immobility alert raised");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disabled_notifier_accepts_calls() {
        let notifier = Notifier::disabled();
        NotificationSink::notify(&notifier, "g-1", "hello");
    }
}
