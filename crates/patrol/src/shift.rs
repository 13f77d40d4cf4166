//! Shift lifecycle: open against a zone or an assignment, end with a summary.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::Services;
use crate::error::{PatrolError, Result};
use crate::events::PatrolEvent;
use crate::store::StoreError;
use crate::types::{
    seconds, AssignmentStatus, ProgressEntry, ProgressStatus, ScanEvent, Shift, ShiftStatus,
    ShiftSummary, SlaStatus,
};

#[derive(Clone)]
pub struct ShiftManager {
    services: Services,
}

impl ShiftManager {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Open a shift covering every active checkpoint of the zone.
    pub async fn start(&self, zone_id: Uuid, guard_id: &str) -> Result<Shift> {
        let store = &self.services.store;
        let zone = store
            .get_zone(zone_id)
            .await?
            .ok_or_else(|| PatrolError::not_found("zone", zone_id))?;
        if !zone.active {
            return Err(PatrolError::validation(format!("zone {} is inactive", zone.code)));
        }
        self.ensure_no_active_shift(guard_id).await?;

        let start_at = self.services.clock.now();
        let progress: Vec<ProgressEntry> = store
            .list_checkpoints(zone_id)
            .await?
            .into_iter()
            .filter(|c| c.active)
            .map(|c| ProgressEntry {
                checkpoint_id: c.id,
                checkpoint_code: c.code,
                order: c.order,
                offset_seconds: c.expected_offset_seconds,
                expected_at: Some(start_at + seconds(c.expected_offset_seconds)),
                grace_seconds: c.grace_seconds,
                status: ProgressStatus::Pending,
                scanned_at: None,
            })
            .collect();
        if progress.is_empty() {
            return Err(PatrolError::EmptyZone(zone_id));
        }

        let shift = Shift {
            id: Uuid::new_v4(),
            zone_id,
            guard_id: guard_id.to_string(),
            plan_id: None,
            assignment_id: None,
            status: ShiftStatus::Active,
            start_at,
            end_at: None,
            progress,
        };
        self.insert(&shift).await?;
        Ok(shift)
    }

    /// Open a shift from an assignment's point snapshot.
    pub async fn start_assignment(&self, assignment_id: Uuid, guard_id: &str) -> Result<Shift> {
        let store = &self.services.store;
        let assignment = store
            .get_assignment(assignment_id)
            .await?
            .ok_or_else(|| PatrolError::not_found("assignment", assignment_id))?;
        if assignment.guard_id != guard_id {
            return Err(PatrolError::Forbidden(format!(
                "assignment {assignment_id} belongs to another guard"
            )));
        }
        if assignment.status == AssignmentStatus::Completed {
            return Err(PatrolError::conflict(
                "ASSIGNMENT_COMPLETED",
                format!("assignment {assignment_id} is already completed"),
            ));
        }
        let plan = store
            .get_plan(assignment.plan_id)
            .await?
            .ok_or_else(|| PatrolError::not_found("plan", assignment.plan_id))?;
        self.ensure_no_active_shift(guard_id).await?;

        let start_at = self.services.clock.now();
        let mut points = assignment.points.clone();
        points.sort_by_key(|p| (p.order, p.offset_seconds));
        let progress: Vec<ProgressEntry> = points
            .into_iter()
            .map(|p| ProgressEntry {
                checkpoint_id: p.checkpoint_id,
                checkpoint_code: p.code,
                order: p.order,
                offset_seconds: p.offset_seconds,
                expected_at: Some(start_at + seconds(p.offset_seconds)),
                grace_seconds: p.grace_seconds,
                status: ProgressStatus::Pending,
                scanned_at: None,
            })
            .collect();
        if progress.is_empty() {
            return Err(PatrolError::EmptyZone(plan.zone_id));
        }

        let shift = Shift {
            id: Uuid::new_v4(),
            zone_id: plan.zone_id,
            guard_id: guard_id.to_string(),
            plan_id: Some(plan.id),
            assignment_id: Some(assignment_id),
            status: ShiftStatus::Active,
            start_at,
            end_at: None,
            progress,
        };
        self.insert(&shift).await?;
        store
            .set_assignment_status(assignment_id, AssignmentStatus::InProgress)
            .await?;
        Ok(shift)
    }

    /// Complete the shift and summarize it. Ending a finished shift returns
    /// the same summary again.
    pub async fn end(&self, shift_id: Uuid) -> Result<ShiftSummary> {
        let store = &self.services.store;
        let shift = self.get(shift_id).await?;

        let mut changed = false;
        if shift.is_active() {
            changed = store
                .complete_shift(shift_id, self.services.clock.now())
                .await?;
        }
        let shift = if changed { self.get(shift_id).await? } else { shift };

        let scans = store.list_scans(shift_id).await?;
        let summary = summarize(&shift, &scans);

        if changed {
            if let Some(assignment_id) = shift.assignment_id {
                if let Err(e) = store
                    .set_assignment_status(assignment_id, AssignmentStatus::Completed)
                    .await
                {
                    warn!(assignment_id = %assignment_id, error = %e, "Failed to complete assignment");
                }
            }
            info!(
                shift_id = %shift_id,
                guard_id = %shift.guard_id,
                scanned = summary.scanned.len(),
                missed = summary.missed.len(),
                "Shift ended"
            );
            self.services.emitter.emit(PatrolEvent::ShiftEnded {
                summary: summary.clone(),
            });
        } else {
            debug!(shift_id = %shift_id, "Shift already ended");
        }
        Ok(summary)
    }

    pub async fn get(&self, shift_id: Uuid) -> Result<Shift> {
        self.services
            .store
            .get_shift(shift_id)
            .await?
            .ok_or_else(|| PatrolError::not_found("shift", shift_id))
    }

    pub async fn list(&self, status: Option<ShiftStatus>) -> Result<Vec<Shift>> {
        Ok(self.services.store.list_shifts(status).await?)
    }

    pub async fn active_for_guard(&self, guard_id: &str) -> Result<Option<Shift>> {
        Ok(self.services.store.active_shift_for_guard(guard_id).await?)
    }

    async fn ensure_no_active_shift(&self, guard_id: &str) -> Result<()> {
        if self.active_for_guard(guard_id).await?.is_some() {
            return Err(PatrolError::DuplicateActiveShift(guard_id.to_string()));
        }
        Ok(())
    }

    async fn insert(&self, shift: &Shift) -> Result<()> {
        // The pre-check can race; the store's unique rule decides
        match self.services.store.insert_shift(shift).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(PatrolError::DuplicateActiveShift(shift.guard_id.clone()))
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            shift_id = %shift.id,
            guard_id = %shift.guard_id,
            zone_id = %shift.zone_id,
            checkpoints = shift.progress.len(),
            "Shift started"
        );
        self.services.emitter.emit(PatrolEvent::ShiftStarted {
            shift: shift.clone(),
        });
        Ok(())
    }
}

/// Read-time summary. Unscanned checkpoints are reported as missed without
/// touching stored progress.
fn summarize(shift: &Shift, scans: &[ScanEvent]) -> ShiftSummary {
    // First scan per checkpoint decides its SLA bucket
    let mut first: HashMap<Uuid, (DateTime<Utc>, SlaStatus)> = HashMap::new();
    for scan in scans {
        first
            .entry(scan.checkpoint_id)
            .and_modify(|(at, sla)| {
                if scan.timestamp < *at {
                    *at = scan.timestamp;
                    *sla = scan.sla_status;
                }
            })
            .or_insert((scan.timestamp, scan.sla_status));
    }

    let mut scanned = Vec::new();
    let mut missed = Vec::new();
    let mut on_time = 0;
    let mut late = 0;
    for entry in &shift.progress {
        match first.get(&entry.checkpoint_id) {
            Some((_, SlaStatus::OnTime)) => {
                on_time += 1;
                scanned.push(entry.checkpoint_id);
            }
            Some((_, SlaStatus::Late)) => {
                late += 1;
                scanned.push(entry.checkpoint_id);
            }
            None => missed.push(entry.checkpoint_id),
        }
    }

    ShiftSummary {
        shift_id: shift.id,
        guard_id: shift.guard_id.clone(),
        status: shift.status,
        start_at: shift.start_at,
        end_at: shift.end_at,
        expected: shift.progress.len(),
        scanned,
        missed,
        on_time,
        late,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::registry::{NewCheckpoint, NewZone};
    use crate::store::MemoryStore;
    use crate::Engine;
    use chrono::Duration;
    use std::sync::Arc;

    async fn setup() -> (Engine, Arc<ManualClock>, Uuid) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let engine = Engine::builder(Arc::new(MemoryStore::new()))
            .clock(clock.clone())
            .build();
        let zone = engine
            .registry
            .create_zone(NewZone {
                name: "Warehouse".to_string(),
                code: "WH".to_string(),
            })
            .await
            .unwrap();
        for (order, code) in [(2, "WH-B"), (1, "WH-A")] {
            engine
                .registry
                .create_checkpoint(
                    zone.id,
                    NewCheckpoint {
                        name: code.to_string(),
                        code: code.to_string(),
                        order,
                        expected_offset_seconds: i64::from(order) * 600,
                        grace_seconds: 120,
                    },
                )
                .await
                .unwrap();
        }
        (engine, clock, zone.id)
    }

    #[tokio::test]
    async fn test_start_builds_ordered_progress() {
        let (engine, clock, zone_id) = setup().await;
        let shift = engine.shifts.start(zone_id, "g-1").await.unwrap();

        let codes: Vec<&str> = shift
            .progress
            .iter()
            .map(|p| p.checkpoint_code.as_str())
            .collect();
        assert_eq!(codes, ["WH-A", "WH-B"]);
        assert_eq!(
            shift.progress[0].expected_at,
            Some(clock.now() + Duration::seconds(600))
        );
        assert_eq!(shift.expected_order().len(), 2);
    }

    #[tokio::test]
    async fn test_second_active_shift_rejected() {
        let (engine, _, zone_id) = setup().await;
        engine.shifts.start(zone_id, "g-1").await.unwrap();
        let err = engine.shifts.start(zone_id, "g-1").await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_ACTIVE_SHIFT");

        // A different guard is fine
        assert!(engine.shifts.start(zone_id, "g-2").await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_zone_rejected() {
        let (engine, _, _) = setup().await;
        let empty = engine
            .registry
            .create_zone(NewZone {
                name: "Empty".to_string(),
                code: "E".to_string(),
            })
            .await
            .unwrap();
        let err = engine.shifts.start(empty.id, "g-1").await.unwrap_err();
        assert_eq!(err.code(), "EMPTY_ZONE");
    }

    #[tokio::test]
    async fn test_end_unknown_shift_not_found() {
        let (engine, _, _) = setup().await;
        let err = engine.shifts.end(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_end_frees_guard_for_new_shift() {
        let (engine, clock, zone_id) = setup().await;
        let shift = engine.shifts.start(zone_id, "g-1").await.unwrap();
        clock.advance(Duration::hours(1));

        let summary = engine.shifts.end(shift.id).await.unwrap();
        assert_eq!(summary.status, ShiftStatus::Completed);
        assert_eq!(summary.expected, 2);
        assert_eq!(summary.missed.len(), 2);
        assert_eq!(summary.end_at, Some(clock.now()));

        assert!(engine.shifts.start(zone_id, "g-1").await.is_ok());
        let completed = engine
            .shifts
            .list(Some(ShiftStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
    }
}
