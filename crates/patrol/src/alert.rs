//! Alert lifecycle: open → ack → closed.
//!
//! Field alerts (panic, fall, immobility, incident) are raised by people and
//! never deduplicated. Missed-checkpoint alerts are owned by the reconciler
//! and go through the store's insert-if-absent.

use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::Services;
use crate::error::{PatrolError, Result};
use crate::events::PatrolEvent;
use crate::store::Transition;
use crate::types::{
    Alert, AlertKind, AlertMeta, AlertQuery, AlertSeverity, AlertStatus, AuditStamp, Geo, Page,
    ProgressEntry, Shift,
};

/// Actor recorded on automatic transitions.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaiseAlert {
    pub kind: AlertKind,
    #[serde(default)]
    pub severity: Option<AlertSeverity>,
    #[serde(default)]
    pub shift_id: Option<Uuid>,
    #[serde(default)]
    pub guard_id: Option<String>,
    #[serde(default)]
    pub geo: Option<Geo>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Clone)]
pub struct AlertManager {
    services: Services,
}

impl AlertManager {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Open a field alert on behalf of `by`.
    pub async fn raise(&self, input: RaiseAlert, by: &str) -> Result<Alert> {
        if input.kind == AlertKind::MissedCheckpoint {
            return Err(PatrolError::validation(
                "missed_checkpoint alerts are opened by the reconciler",
            ));
        }

        let mut guard_id = input.guard_id;
        if let Some(shift_id) = input.shift_id {
            let shift = self
                .services
                .store
                .get_shift(shift_id)
                .await?
                .ok_or_else(|| PatrolError::not_found("shift", shift_id))?;
            guard_id.get_or_insert(shift.guard_id);
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            kind: input.kind,
            severity: input
                .severity
                .unwrap_or_else(|| input.kind.default_severity()),
            status: AlertStatus::Open,
            shift_id: input.shift_id,
            guard_id,
            meta: AlertMeta::default(),
            geo: input.geo,
            note: input.note,
            opened: AuditStamp::new(by, self.services.clock.now(), None),
            acked: None,
            closed: None,
        };
        self.services.store.insert_alert(&alert).await?;

        info!(
            alert_id = %alert.id,
            kind = alert.kind.as_str(),
            severity = alert.severity.as_str(),
            by,
            "Alert raised"
        );
        self.opened(&alert);
        Ok(alert)
    }

    /// Open a missed-checkpoint alert unless a live one already exists for
    /// the same shift and checkpoint. Returns the alert when created.
    pub async fn open_missed(&self, shift: &Shift, entry: &ProgressEntry) -> Result<Option<Alert>> {
        let kind = AlertKind::MissedCheckpoint;
        let alert = Alert {
            id: Uuid::new_v4(),
            kind,
            severity: kind.default_severity(),
            status: AlertStatus::Open,
            shift_id: Some(shift.id),
            guard_id: Some(shift.guard_id.clone()),
            meta: AlertMeta {
                cp_code: Some(entry.checkpoint_code.clone()),
                checkpoint_id: Some(entry.checkpoint_id),
                expected_at: entry.expected_at,
            },
            geo: None,
            note: None,
            opened: AuditStamp::new(SYSTEM_ACTOR, self.services.clock.now(), None),
            acked: None,
            closed: None,
        };

        if !self
            .services
            .store
            .insert_missed_alert_if_absent(&alert)
            .await?
        {
            debug!(
                shift_id = %shift.id,
                checkpoint = %entry.checkpoint_code,
                "Missed-checkpoint alert already open"
            );
            return Ok(None);
        }
        info!(
            alert_id = %alert.id,
            shift_id = %shift.id,
            checkpoint = %entry.checkpoint_code,
            "Missed-checkpoint alert opened"
        );
        self.opened(&alert);
        self.services.sink.notify(
            &shift.guard_id,
            &format!("Checkpoint {} is overdue", entry.checkpoint_code),
        );
        Ok(Some(alert))
    }

    /// Acknowledge. Repeating on an acknowledged alert is a no-op; a closed
    /// alert cannot be acknowledged.
    pub async fn ack(&self, id: Uuid, by: &str) -> Result<Alert> {
        let stamp = AuditStamp::new(by, self.services.clock.now(), None);
        let Transition { alert, changed } = self
            .services
            .store
            .ack_alert(id, &stamp)
            .await?
            .ok_or_else(|| PatrolError::not_found("alert", id))?;

        if alert.status == AlertStatus::Closed {
            return Err(PatrolError::conflict(
                "ALERT_CLOSED",
                format!("alert {id} is already closed"),
            ));
        }
        if changed {
            info!(alert_id = %id, by, "Alert acknowledged");
            self.services
                .emitter
                .emit(PatrolEvent::AlertAcked { alert: alert.clone() });
        }
        Ok(alert)
    }

    /// Close. Closing a closed alert returns it unchanged.
    pub async fn close(&self, id: Uuid, by: &str, note: Option<String>) -> Result<Alert> {
        let stamp = AuditStamp::new(by, self.services.clock.now(), note);
        let Transition { alert, changed } = self
            .services
            .store
            .close_alert(id, &stamp)
            .await?
            .ok_or_else(|| PatrolError::not_found("alert", id))?;

        if changed {
            info!(alert_id = %id, by, kind = alert.kind.as_str(), "Alert closed");
            self.services
                .emitter
                .emit(PatrolEvent::AlertClosed { alert: alert.clone() });
        }
        Ok(alert)
    }

    pub async fn get(&self, id: Uuid) -> Result<Alert> {
        self.services
            .store
            .get_alert(id)
            .await?
            .ok_or_else(|| PatrolError::not_found("alert", id))
    }

    pub async fn list(&self, query: &AlertQuery) -> Result<Page<Alert>> {
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(PatrolError::validation("from must not be after to"));
            }
        }
        Ok(self.services.store.list_alerts(query).await?)
    }

    fn opened(&self, alert: &Alert) {
        self.services.sink.alert_raised(alert);
        self.services
            .emitter
            .emit(PatrolEvent::AlertOpened { alert: alert.clone() });
    }
}
