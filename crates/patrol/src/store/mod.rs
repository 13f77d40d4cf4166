//! Persistence boundary for the engine.
//!
//! Every mutation of state shared between request handlers and background
//! jobs is a targeted, conditional operation. Uniqueness rules (one active
//! shift per guard, one live missed-checkpoint alert per shift and checkpoint,
//! one assignment per day, guard and round) are enforced by the backend in
//! the same step as the insert.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    Alert, AlertQuery, Assignment, AssignmentStatus, AuditStamp, Checkpoint, Page, Plan,
    ProgressStatus, Round, ScanEvent, Shift, ShiftStatus, Zone,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness rule rejected the write
    #[error("{0}")]
    Conflict(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of an atomic scan insert.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanInsert {
    Inserted,
    /// A scan of the same checkpoint in the same shift falls inside the window
    Duplicate(ScanEvent),
}

/// Result of a conditional alert state change.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Alert as stored after the call
    pub alert: Alert,
    /// False when the alert was already in (or past) the requested state
    pub changed: bool,
}

/// Two scan timestamps are duplicates when closer than `window`.
#[must_use]
pub fn within_window(a: DateTime<Utc>, b: DateTime<Utc>, window: Duration) -> bool {
    (a - b).abs() < window
}

#[async_trait]
pub trait PatrolStore: Send + Sync {
    // ------------------------------------------------------------------ zones
    async fn insert_zone(&self, zone: &Zone) -> StoreResult<()>;
    async fn get_zone(&self, id: Uuid) -> StoreResult<Option<Zone>>;
    async fn list_zones(&self) -> StoreResult<Vec<Zone>>;
    async fn set_zone_active(&self, id: Uuid, active: bool) -> StoreResult<bool>;

    // ------------------------------------------------------------ checkpoints
    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()>;
    async fn get_checkpoint(&self, id: Uuid) -> StoreResult<Option<Checkpoint>>;
    async fn find_checkpoint_by_code(&self, code: &str) -> StoreResult<Option<Checkpoint>>;
    /// All checkpoints of a zone, active or not, ordered by route position.
    async fn list_checkpoints(&self, zone_id: Uuid) -> StoreResult<Vec<Checkpoint>>;
    async fn set_checkpoint_active(&self, id: Uuid, active: bool) -> StoreResult<bool>;

    // ------------------------------------------------------------ plans/rounds
    async fn insert_plan(&self, plan: &Plan) -> StoreResult<()>;
    async fn update_plan(&self, plan: &Plan) -> StoreResult<bool>;
    async fn get_plan(&self, id: Uuid) -> StoreResult<Option<Plan>>;
    async fn list_plans(&self) -> StoreResult<Vec<Plan>>;
    async fn insert_round(&self, round: &Round) -> StoreResult<()>;
    async fn get_round(&self, id: Uuid) -> StoreResult<Option<Round>>;
    async fn list_rounds(&self) -> StoreResult<Vec<Round>>;

    // ----------------------------------------------------------------- shifts
    /// Fails with [`StoreError::Conflict`] when the guard already has an active shift.
    async fn insert_shift(&self, shift: &Shift) -> StoreResult<()>;
    async fn get_shift(&self, id: Uuid) -> StoreResult<Option<Shift>>;
    async fn active_shift_for_guard(&self, guard_id: &str) -> StoreResult<Option<Shift>>;
    async fn list_shifts(&self, status: Option<ShiftStatus>) -> StoreResult<Vec<Shift>>;
    /// Active → completed. Returns false when the shift was not active.
    async fn complete_shift(&self, id: Uuid, end_at: DateTime<Utc>) -> StoreResult<bool>;
    /// Record a scan outcome on a pending or missed progress entry. An entry
    /// that already holds a scan keeps it; returns false in that case.
    async fn set_progress_scanned(
        &self,
        shift_id: Uuid,
        checkpoint_id: Uuid,
        status: ProgressStatus,
        scanned_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    /// Pending → missed. Returns false when the entry was no longer pending.
    async fn mark_progress_missed(&self, shift_id: Uuid, checkpoint_id: Uuid)
        -> StoreResult<bool>;
    /// Sets `expected_at` only when it is still unset.
    async fn backfill_expected_at(
        &self,
        shift_id: Uuid,
        checkpoint_id: Uuid,
        expected_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // ------------------------------------------------------------------ scans
    async fn insert_scan_unless_duplicate(
        &self,
        scan: &ScanEvent,
        window: Duration,
    ) -> StoreResult<ScanInsert>;
    /// Scans of a shift ordered by timestamp.
    async fn list_scans(&self, shift_id: Uuid) -> StoreResult<Vec<ScanEvent>>;

    // ----------------------------------------------------------------- alerts
    async fn insert_alert(&self, alert: &Alert) -> StoreResult<()>;
    /// Insert unless a live missed-checkpoint alert exists for the same
    /// shift and checkpoint code. Returns whether the row was created.
    async fn insert_missed_alert_if_absent(&self, alert: &Alert) -> StoreResult<bool>;
    async fn get_alert(&self, id: Uuid) -> StoreResult<Option<Alert>>;
    /// Open → ack.
    async fn ack_alert(&self, id: Uuid, stamp: &AuditStamp) -> StoreResult<Option<Transition>>;
    /// Open/ack → closed.
    async fn close_alert(&self, id: Uuid, stamp: &AuditStamp) -> StoreResult<Option<Transition>>;
    /// Open or acknowledged missed-checkpoint alerts of a shift.
    async fn live_missed_alerts(&self, shift_id: Uuid) -> StoreResult<Vec<Alert>>;
    /// Newest first.
    async fn list_alerts(&self, query: &AlertQuery) -> StoreResult<Page<Alert>>;

    // ------------------------------------------------------------ assignments
    /// Returns the stored row and whether this call created it.
    async fn insert_assignment_if_absent(
        &self,
        assignment: &Assignment,
    ) -> StoreResult<(Assignment, bool)>;
    async fn get_assignment(&self, id: Uuid) -> StoreResult<Option<Assignment>>;
    async fn list_assignments(
        &self,
        date: NaiveDate,
        guard_id: Option<&str>,
    ) -> StoreResult<Vec<Assignment>>;
    async fn set_assignment_status(&self, id: Uuid, status: AssignmentStatus)
        -> StoreResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_symmetric_and_exclusive() {
        let base = Utc::now();
        let window = Duration::seconds(20);
        assert!(within_window(base, base + Duration::seconds(19), window));
        assert!(within_window(base + Duration::seconds(19), base, window));
        assert!(!within_window(base, base + Duration::seconds(20), window));
    }
}
