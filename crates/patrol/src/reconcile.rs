//! Missed-checkpoint reconciliation.
//!
//! Runs periodically over every active shift:
//! - backfills `expected_at` on entries that lack it
//! - opens one alert per overdue pending entry, then marks it missed
//! - opens the alert for a missed entry that never got one
//! - closes live missed-checkpoint alerts whose checkpoint has since been scanned
//!
//! Every write is conditional, so a second run over unchanged data writes
//! nothing, and a scan landing mid-run is never overwritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::alert::{AlertManager, SYSTEM_ACTOR};
use crate::engine::Services;
use crate::error::Result;
use crate::types::{seconds, AlertKind, AlertQuery, ProgressStatus, Shift, ShiftStatus};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub run_at: Option<DateTime<Utc>>,
    /// Active shifts inspected
    pub shifts_scanned: usize,
    /// Entries that received an `expected_at`
    pub backfilled: usize,
    /// Entries moved from pending to missed
    pub missed: usize,
    pub alerts_opened: usize,
    pub alerts_closed: usize,
    /// Shifts whose reconciliation failed
    pub failures: usize,
}

impl ReconcileReport {
    fn absorb(&mut self, other: &ShiftOutcome) {
        self.backfilled += other.backfilled;
        self.missed += other.missed;
        self.alerts_opened += other.opened;
        self.alerts_closed += other.closed;
    }

    /// True when the pass changed nothing.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.backfilled == 0 && self.missed == 0 && self.alerts_opened == 0 && self.alerts_closed == 0
    }
}

#[derive(Debug, Default)]
struct ShiftOutcome {
    backfilled: usize,
    missed: usize,
    opened: usize,
    closed: usize,
}

pub struct MissedCheckpointReconciler {
    services: Services,
    alerts: AlertManager,
}

impl MissedCheckpointReconciler {
    pub fn new(services: Services, alerts: AlertManager) -> Self {
        Self { services, alerts }
    }

    /// Reconcile every active shift. A failing shift is logged and counted;
    /// it never aborts the pass.
    pub async fn run(&self) -> Result<ReconcileReport> {
        let now = self.services.clock.now();
        let shifts = self
            .services
            .store
            .list_shifts(Some(ShiftStatus::Active))
            .await?;

        let mut report = ReconcileReport {
            run_at: Some(now),
            shifts_scanned: shifts.len(),
            ..ReconcileReport::default()
        };

        for shift in &shifts {
            match self.reconcile_shift(shift, now).await {
                Ok(outcome) => report.absorb(&outcome),
                Err(e) => {
                    report.failures += 1;
                    warn!(shift_id = %shift.id, error = %e, "Failed to reconcile shift");
                }
            }
        }

        if report.is_quiet() {
            debug!(shifts = report.shifts_scanned, "Reconcile pass found nothing to do");
        } else {
            info!(
                shifts = report.shifts_scanned,
                backfilled = report.backfilled,
                missed = report.missed,
                opened = report.alerts_opened,
                closed = report.alerts_closed,
                failures = report.failures,
                "Reconcile pass complete"
            );
        }
        Ok(report)
    }

    async fn reconcile_shift(&self, shift: &Shift, now: DateTime<Utc>) -> Result<ShiftOutcome> {
        let store = &self.services.store;
        let mut outcome = ShiftOutcome::default();

        let plan = match shift.plan_id {
            Some(plan_id) => store.get_plan(plan_id).await?,
            None => None,
        };
        let threshold = seconds(
            plan.as_ref()
                .and_then(|p| p.missing_threshold_seconds)
                .unwrap_or(self.services.config.missing_threshold_seconds),
        );

        // Codes that already carry a missed-checkpoint alert, in any status
        let mut alerted: Option<HashSet<String>> = None;

        for entry in &shift.progress {
            let expected_at = match entry.expected_at {
                Some(at) => at,
                None => {
                    let plan_offset = plan
                        .as_ref()
                        .and_then(|p| p.entry_for(entry.checkpoint_id))
                        .and_then(|e| e.offset_seconds);
                    let offset = match plan_offset {
                        Some(offset) => offset,
                        None => store
                            .get_checkpoint(entry.checkpoint_id)
                            .await?
                            .map_or(entry.offset_seconds, |c| c.expected_offset_seconds),
                    };
                    let at = shift.start_at + seconds(offset);
                    if store
                        .backfill_expected_at(shift.id, entry.checkpoint_id, at)
                        .await?
                    {
                        outcome.backfilled += 1;
                    }
                    at
                }
            };

            let mut missed_entry = entry.clone();
            missed_entry.expected_at = Some(expected_at);

            match entry.status {
                ProgressStatus::Pending if expected_at + threshold < now => {
                    // Alert before mark: an interrupted run leaves the entry
                    // pending for the next tick
                    if self.alerts.open_missed(shift, &missed_entry).await?.is_some() {
                        outcome.opened += 1;
                    }
                    if !store.mark_progress_missed(shift.id, entry.checkpoint_id).await? {
                        // Scanned between our read and the update; the close
                        // pass below clears the alert
                        continue;
                    }
                    outcome.missed += 1;
                    debug!(
                        shift_id = %shift.id,
                        checkpoint = %entry.checkpoint_code,
                        %expected_at,
                        "Checkpoint marked missed"
                    );
                }
                ProgressStatus::Missed => {
                    if alerted.is_none() {
                        alerted = Some(self.alerted_codes(shift).await?);
                    }
                    if alerted
                        .as_ref()
                        .is_some_and(|codes| codes.contains(&entry.checkpoint_code))
                    {
                        continue;
                    }
                    if self.alerts.open_missed(shift, &missed_entry).await?.is_some() {
                        outcome.opened += 1;
                        warn!(
                            shift_id = %shift.id,
                            checkpoint = %entry.checkpoint_code,
                            "Opened alert for missed checkpoint left without one"
                        );
                    }
                }
                _ => {}
            }
        }

        outcome.closed = self.close_scanned(shift).await?;
        Ok(outcome)
    }

    /// Checkpoint codes that ever had a missed-checkpoint alert on `shift`.
    async fn alerted_codes(&self, shift: &Shift) -> Result<HashSet<String>> {
        let mut codes = HashSet::new();
        let mut query = AlertQuery {
            shift_id: Some(shift.id),
            kind: Some(AlertKind::MissedCheckpoint),
            page: 1,
            limit: AlertQuery::MAX_LIMIT,
            ..AlertQuery::default()
        };
        loop {
            let page = self.services.store.list_alerts(&query).await?;
            let fetched = page.items.len();
            codes.extend(page.items.into_iter().filter_map(|a| a.meta.cp_code));
            if fetched == 0 || query.offset() + fetched >= page.total {
                return Ok(codes);
            }
            query.page += 1;
        }
    }

    /// Close live missed-checkpoint alerts whose checkpoint now holds a scan.
    async fn close_scanned(&self, shift: &Shift) -> Result<usize> {
        let store = &self.services.store;
        let live = store.live_missed_alerts(shift.id).await?;
        if live.is_empty() {
            return Ok(0);
        }

        // Re-read so scans that landed during this pass count
        let current = store.get_shift(shift.id).await?.unwrap_or_else(|| shift.clone());
        let scanned: HashSet<&str> = current
            .progress
            .iter()
            .filter(|p| p.status.is_scanned())
            .map(|p| p.checkpoint_code.as_str())
            .collect();

        let mut closed = 0;
        for alert in live {
            let Some(code) = alert.meta.cp_code.as_deref() else {
                continue;
            };
            if !scanned.contains(code) {
                continue;
            }
            let alert = self
                .alerts
                .close(alert.id, SYSTEM_ACTOR, Some(format!("checkpoint {code} scanned")))
                .await?;
            if alert.closed.as_ref().is_some_and(|s| s.by == SYSTEM_ACTOR) {
                closed += 1;
            }
        }
        Ok(closed)
    }
}
