//! In-process store backed by hash maps behind a single `RwLock`.
//!
//! Compound operations (check + insert) happen under one write guard, which
//! gives the same atomicity the SQLite backend gets from unique indexes.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{within_window, PatrolStore, ScanInsert, StoreError, StoreResult, Transition};
use crate::types::{
    Alert, AlertKind, AlertQuery, AlertStatus, Assignment, AssignmentStatus, AuditStamp,
    Checkpoint, Page, Plan, ProgressEntry, ProgressStatus, Round, ScanEvent, Shift, ShiftStatus,
    Zone,
};

#[derive(Default)]
struct Inner {
    zones: HashMap<Uuid, Zone>,
    checkpoints: HashMap<Uuid, Checkpoint>,
    plans: HashMap<Uuid, Plan>,
    rounds: HashMap<Uuid, Round>,
    shifts: HashMap<Uuid, Shift>,
    scans: HashMap<Uuid, Vec<ScanEvent>>,
    alerts: HashMap<Uuid, Alert>,
    assignments: HashMap<Uuid, Assignment>,
}

impl Inner {
    fn progress_mut(&mut self, shift_id: Uuid, checkpoint_id: Uuid) -> Option<&mut ProgressEntry> {
        self.shifts
            .get_mut(&shift_id)?
            .progress
            .iter_mut()
            .find(|p| p.checkpoint_id == checkpoint_id)
    }
}

/// Memory-resident [`PatrolStore`]. Used in tests and single-node demos.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatrolStore for MemoryStore {
    async fn insert_zone(&self, zone: &Zone) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.zones.values().any(|z| z.code == zone.code) {
            return Err(StoreError::Conflict(format!("zone code {} taken", zone.code)));
        }
        inner.zones.insert(zone.id, zone.clone());
        Ok(())
    }

    async fn get_zone(&self, id: Uuid) -> StoreResult<Option<Zone>> {
        Ok(self.inner.read().await.zones.get(&id).cloned())
    }

    async fn list_zones(&self) -> StoreResult<Vec<Zone>> {
        let mut zones: Vec<Zone> = self.inner.read().await.zones.values().cloned().collect();
        zones.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(zones)
    }

    async fn set_zone_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .zones
            .get_mut(&id)
            .map(|zone| zone.active = active)
            .is_some())
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.checkpoints.values().any(|c| c.code == checkpoint.code) {
            return Err(StoreError::Conflict(format!(
                "checkpoint code {} taken",
                checkpoint.code
            )));
        }
        inner.checkpoints.insert(checkpoint.id, checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, id: Uuid) -> StoreResult<Option<Checkpoint>> {
        Ok(self.inner.read().await.checkpoints.get(&id).cloned())
    }

    async fn find_checkpoint_by_code(&self, code: &str) -> StoreResult<Option<Checkpoint>> {
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .values()
            .find(|c| c.code == code)
            .cloned())
    }

    async fn list_checkpoints(&self, zone_id: Uuid) -> StoreResult<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .inner
            .read()
            .await
            .checkpoints
            .values()
            .filter(|c| c.zone_id == zone_id)
            .cloned()
            .collect();
        checkpoints.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.code.cmp(&b.code)));
        Ok(checkpoints)
    }

    async fn set_checkpoint_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .checkpoints
            .get_mut(&id)
            .map(|c| c.active = active)
            .is_some())
    }

    async fn insert_plan(&self, plan: &Plan) -> StoreResult<()> {
        self.inner.write().await.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.plans.get_mut(&plan.id) {
            Some(stored) => {
                *stored = plan.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_plan(&self, id: Uuid) -> StoreResult<Option<Plan>> {
        Ok(self.inner.read().await.plans.get(&id).cloned())
    }

    async fn list_plans(&self) -> StoreResult<Vec<Plan>> {
        let mut plans: Vec<Plan> = self.inner.read().await.plans.values().cloned().collect();
        plans.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(plans)
    }

    async fn insert_round(&self, round: &Round) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .rounds
            .insert(round.id, round.clone());
        Ok(())
    }

    async fn get_round(&self, id: Uuid) -> StoreResult<Option<Round>> {
        Ok(self.inner.read().await.rounds.get(&id).cloned())
    }

    async fn list_rounds(&self) -> StoreResult<Vec<Round>> {
        let mut rounds: Vec<Round> = self.inner.read().await.rounds.values().cloned().collect();
        rounds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rounds)
    }

    async fn insert_shift(&self, shift: &Shift) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if shift.is_active()
            && inner
                .shifts
                .values()
                .any(|s| s.guard_id == shift.guard_id && s.is_active())
        {
            return Err(StoreError::Conflict(format!(
                "guard {} already has an active shift",
                shift.guard_id
            )));
        }
        inner.shifts.insert(shift.id, shift.clone());
        Ok(())
    }

    async fn get_shift(&self, id: Uuid) -> StoreResult<Option<Shift>> {
        Ok(self.inner.read().await.shifts.get(&id).cloned())
    }

    async fn active_shift_for_guard(&self, guard_id: &str) -> StoreResult<Option<Shift>> {
        Ok(self
            .inner
            .read()
            .await
            .shifts
            .values()
            .find(|s| s.guard_id == guard_id && s.is_active())
            .cloned())
    }

    async fn list_shifts(&self, status: Option<ShiftStatus>) -> StoreResult<Vec<Shift>> {
        let mut shifts: Vec<Shift> = self
            .inner
            .read()
            .await
            .shifts
            .values()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        shifts.sort_by(|a, b| a.start_at.cmp(&b.start_at));
        Ok(shifts)
    }

    async fn complete_shift(&self, id: Uuid, end_at: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.shifts.get_mut(&id) {
            Some(shift) if shift.is_active() => {
                shift.status = ShiftStatus::Completed;
                shift.end_at = Some(end_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_progress_scanned(
        &self,
        shift_id: Uuid,
        checkpoint_id: Uuid,
        status: ProgressStatus,
        scanned_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(match inner.progress_mut(shift_id, checkpoint_id) {
            Some(entry) if !entry.status.is_scanned() => {
                entry.status = status;
                entry.scanned_at = Some(scanned_at);
                true
            }
            _ => false,
        })
    }

    async fn mark_progress_missed(
        &self,
        shift_id: Uuid,
        checkpoint_id: Uuid,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(match inner.progress_mut(shift_id, checkpoint_id) {
            Some(entry) if entry.status == ProgressStatus::Pending => {
                entry.status = ProgressStatus::Missed;
                true
            }
            _ => false,
        })
    }

    async fn backfill_expected_at(
        &self,
        shift_id: Uuid,
        checkpoint_id: Uuid,
        expected_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(match inner.progress_mut(shift_id, checkpoint_id) {
            Some(entry) if entry.expected_at.is_none() => {
                entry.expected_at = Some(expected_at);
                true
            }
            _ => false,
        })
    }

    async fn insert_scan_unless_duplicate(
        &self,
        scan: &ScanEvent,
        window: Duration,
    ) -> StoreResult<ScanInsert> {
        let mut inner = self.inner.write().await;
        let scans = inner.scans.entry(scan.shift_id).or_default();
        if let Some(prior) = scans.iter().find(|s| {
            s.checkpoint_id == scan.checkpoint_id
                && within_window(s.timestamp, scan.timestamp, window)
        }) {
            return Ok(ScanInsert::Duplicate(prior.clone()));
        }
        let at = scans.partition_point(|s| s.timestamp <= scan.timestamp);
        scans.insert(at, scan.clone());
        Ok(ScanInsert::Inserted)
    }

    async fn list_scans(&self, shift_id: Uuid) -> StoreResult<Vec<ScanEvent>> {
        Ok(self
            .inner
            .read()
            .await
            .scans
            .get(&shift_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_alert(&self, alert: &Alert) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .alerts
            .insert(alert.id, alert.clone());
        Ok(())
    }

    async fn insert_missed_alert_if_absent(&self, alert: &Alert) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let exists = inner.alerts.values().any(|a| {
            a.kind == AlertKind::MissedCheckpoint
                && a.status.is_live()
                && a.shift_id == alert.shift_id
                && a.meta.cp_code == alert.meta.cp_code
        });
        if exists {
            return Ok(false);
        }
        inner.alerts.insert(alert.id, alert.clone());
        Ok(true)
    }

    async fn get_alert(&self, id: Uuid) -> StoreResult<Option<Alert>> {
        Ok(self.inner.read().await.alerts.get(&id).cloned())
    }

    async fn ack_alert(&self, id: Uuid, stamp: &AuditStamp) -> StoreResult<Option<Transition>> {
        let mut inner = self.inner.write().await;
        let Some(alert) = inner.alerts.get_mut(&id) else {
            return Ok(None);
        };
        let changed = alert.status == AlertStatus::Open;
        if changed {
            alert.status = AlertStatus::Ack;
            alert.acked = Some(stamp.clone());
        }
        Ok(Some(Transition {
            alert: alert.clone(),
            changed,
        }))
    }

    async fn close_alert(&self, id: Uuid, stamp: &AuditStamp) -> StoreResult<Option<Transition>> {
        let mut inner = self.inner.write().await;
        let Some(alert) = inner.alerts.get_mut(&id) else {
            return Ok(None);
        };
        let changed = alert.status.is_live();
        if changed {
            alert.status = AlertStatus::Closed;
            alert.closed = Some(stamp.clone());
        }
        Ok(Some(Transition {
            alert: alert.clone(),
            changed,
        }))
    }

    async fn live_missed_alerts(&self, shift_id: Uuid) -> StoreResult<Vec<Alert>> {
        Ok(self
            .inner
            .read()
            .await
            .alerts
            .values()
            .filter(|a| {
                a.kind == AlertKind::MissedCheckpoint
                    && a.status.is_live()
                    && a.shift_id == Some(shift_id)
            })
            .cloned()
            .collect())
    }

    async fn list_alerts(&self, query: &AlertQuery) -> StoreResult<Page<Alert>> {
        let mut matching: Vec<Alert> = self
            .inner
            .read()
            .await
            .alerts
            .values()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.opened.at.cmp(&a.opened.at).then_with(|| a.id.cmp(&b.id)));

        let total = matching.len();
        let limit = query.effective_limit();
        let items = matching
            .into_iter()
            .skip(query.offset())
            .take(limit as usize)
            .collect();

        Ok(Page {
            items,
            total,
            page: query.page.max(1),
            limit,
        })
    }

    async fn insert_assignment_if_absent(
        &self,
        assignment: &Assignment,
    ) -> StoreResult<(Assignment, bool)> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.assignments.values().find(|a| {
            a.date == assignment.date
                && a.guard_id == assignment.guard_id
                && a.round_id == assignment.round_id
        }) {
            return Ok((existing.clone(), false));
        }
        inner
            .assignments
            .insert(assignment.id, assignment.clone());
        Ok((assignment.clone(), true))
    }

    async fn get_assignment(&self, id: Uuid) -> StoreResult<Option<Assignment>> {
        Ok(self.inner.read().await.assignments.get(&id).cloned())
    }

    async fn list_assignments(
        &self,
        date: NaiveDate,
        guard_id: Option<&str>,
    ) -> StoreResult<Vec<Assignment>> {
        let mut rows: Vec<Assignment> = self
            .inner
            .read()
            .await
            .assignments
            .values()
            .filter(|a| a.date == date && guard_id.is_none_or(|g| a.guard_id == g))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.guard_id
                .cmp(&b.guard_id)
                .then_with(|| a.start_time.cmp(&b.start_time))
                .then_with(|| a.round_id.cmp(&b.round_id))
        });
        Ok(rows)
    }

    async fn set_assignment_status(
        &self,
        id: Uuid,
        status: AssignmentStatus,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .assignments
            .get_mut(&id)
            .map(|a| a.status = status)
            .is_some())
    }
}
