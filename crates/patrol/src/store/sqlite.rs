//! SQLite-backed [`PatrolStore`].
//!
//! Uniqueness rules live in the schema as (partial) unique indexes and are
//! exercised with `INSERT OR IGNORE`, so concurrent writers can never create
//! a second active shift, a second live missed-checkpoint alert or a second
//! assignment for the same day, guard and round. Statements run on a single
//! connection guarded by a mutex, always on tokio's blocking pool.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::{PatrolStore, ScanInsert, StoreError, StoreResult, Transition};
use crate::types::{
    Alert, AlertKind, AlertMeta, AlertQuery, AlertSeverity, AlertStatus, Assignment,
    AssignmentPoint, AssignmentStatus, AuditStamp, Checkpoint, Geo, Page, Plan, ProgressEntry,
    ProgressStatus, Round, ScanEvent, ScanSource, Shift, ShiftStatus, SlaStatus, Zone,
};

const SCHEMA: &str = r"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

CREATE TABLE IF NOT EXISTS zones (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  code TEXT NOT NULL UNIQUE,
  active INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
  id TEXT PRIMARY KEY,
  zone_id TEXT NOT NULL,
  name TEXT NOT NULL,
  code TEXT NOT NULL UNIQUE,
  position INTEGER NOT NULL,
  expected_offset_seconds INTEGER NOT NULL,
  grace_seconds INTEGER NOT NULL,
  active INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS checkpoints_by_zone ON checkpoints(zone_id, position);

CREATE TABLE IF NOT EXISTS plans (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rounds (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  zone_id TEXT NOT NULL,
  plan_id TEXT NOT NULL,
  active INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS shifts (
  id TEXT PRIMARY KEY,
  zone_id TEXT NOT NULL,
  guard_id TEXT NOT NULL,
  plan_id TEXT,
  assignment_id TEXT,
  status TEXT NOT NULL,
  start_at INTEGER NOT NULL,
  end_at INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS shifts_one_active_per_guard
  ON shifts(guard_id) WHERE status = 'active';

CREATE TABLE IF NOT EXISTS shift_progress (
  shift_id TEXT NOT NULL,
  checkpoint_id TEXT NOT NULL,
  checkpoint_code TEXT NOT NULL,
  position INTEGER NOT NULL,
  offset_seconds INTEGER NOT NULL,
  expected_at INTEGER,
  grace_seconds INTEGER NOT NULL,
  status TEXT NOT NULL,
  scanned_at INTEGER,
  PRIMARY KEY (shift_id, checkpoint_id)
);

CREATE TABLE IF NOT EXISTS scans (
  id TEXT PRIMARY KEY,
  shift_id TEXT NOT NULL,
  checkpoint_id TEXT NOT NULL,
  checkpoint_code TEXT NOT NULL,
  guard_id TEXT NOT NULL,
  ts INTEGER NOT NULL,
  received_at INTEGER NOT NULL,
  lat REAL,
  lng REAL,
  accuracy REAL,
  note TEXT,
  sla_status TEXT NOT NULL,
  source TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS scans_by_shift ON scans(shift_id, checkpoint_id, ts);

CREATE TABLE IF NOT EXISTS alerts (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  severity TEXT NOT NULL,
  status TEXT NOT NULL,
  shift_id TEXT,
  guard_id TEXT,
  cp_code TEXT,
  checkpoint_id TEXT,
  expected_at INTEGER,
  lat REAL,
  lng REAL,
  accuracy REAL,
  note TEXT,
  opened_by TEXT NOT NULL,
  opened_at INTEGER NOT NULL,
  acked_by TEXT,
  acked_at INTEGER,
  closed_by TEXT,
  closed_at INTEGER,
  closed_note TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS alerts_one_live_missed
  ON alerts(shift_id, cp_code)
  WHERE kind = 'missed_checkpoint' AND status IN ('open', 'ack');
CREATE INDEX IF NOT EXISTS alerts_by_opened ON alerts(opened_at);

CREATE TABLE IF NOT EXISTS assignments (
  id TEXT PRIMARY KEY,
  date TEXT NOT NULL,
  guard_id TEXT NOT NULL,
  round_id TEXT NOT NULL,
  plan_id TEXT NOT NULL,
  points TEXT NOT NULL,
  start_time TEXT NOT NULL,
  end_time TEXT NOT NULL,
  status TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  UNIQUE (date, guard_id, round_id)
);
";

const ALERT_COLUMNS: &str = "id, kind, severity, status, shift_id, guard_id, cp_code, \
    checkpoint_id, expected_at, lat, lng, accuracy, note, opened_by, opened_at, acked_by, \
    acked_at, closed_by, closed_at, closed_note";

const SCAN_COLUMNS: &str = "id, shift_id, checkpoint_id, checkpoint_code, guard_id, ts, \
    received_at, lat, lng, accuracy, note, sla_status, source";

const CHECKPOINT_COLUMNS: &str = "id, zone_id, name, code, position, expected_offset_seconds, \
    grace_seconds, active, created_at";

const ASSIGNMENT_COLUMNS: &str =
    "id, date, guard_id, round_id, plan_id, points, start_time, end_time, status, created_at";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Durable [`PatrolStore`] on a single SQLite database file.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened patrol database");
        Self::from_connection(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Backend("connection mutex poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join: {e}")))?
    }

    fn load_shift(conn: &Connection, id: Uuid) -> StoreResult<Option<Shift>> {
        let shift = conn
            .query_row(
                "SELECT id, zone_id, guard_id, plan_id, assignment_id, status, start_at, end_at \
                 FROM shifts WHERE id = ?1",
                params![id.to_string()],
                shift_from_row,
            )
            .optional()?;
        let Some(mut shift) = shift else {
            return Ok(None);
        };
        shift.progress = Self::load_progress(conn, shift.id)?;
        Ok(Some(shift))
    }

    fn load_shifts(conn: &Connection, sql: &str, args: &[Value]) -> StoreResult<Vec<Shift>> {
        let mut stmt = conn.prepare(sql)?;
        let mut shifts = stmt
            .query_map(params_from_iter(args.iter()), shift_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for shift in &mut shifts {
            shift.progress = Self::load_progress(conn, shift.id)?;
        }
        Ok(shifts)
    }

    fn load_progress(conn: &Connection, shift_id: Uuid) -> StoreResult<Vec<ProgressEntry>> {
        let mut stmt = conn.prepare(
            "SELECT checkpoint_id, checkpoint_code, position, offset_seconds, expected_at, \
             grace_seconds, status, scanned_at \
             FROM shift_progress WHERE shift_id = ?1 ORDER BY position, checkpoint_code",
        )?;
        let rows = stmt
            .query_map(params![shift_id.to_string()], |row| {
                Ok(ProgressEntry {
                    checkpoint_id: uuid_at(row, 0)?,
                    checkpoint_code: row.get(1)?,
                    order: row.get(2)?,
                    offset_seconds: row.get(3)?,
                    expected_at: opt_time_at(row, 4)?,
                    grace_seconds: row.get(5)?,
                    status: enum_at(row, 6, ProgressStatus::parse)?,
                    scanned_at: opt_time_at(row, 7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn load_alert(conn: &Connection, id: Uuid) -> StoreResult<Option<Alert>> {
        Ok(conn
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                params![id.to_string()],
                alert_from_row,
            )
            .optional()?)
    }

    fn load_assignment_by_key(
        conn: &Connection,
        assignment: &Assignment,
    ) -> StoreResult<Option<Assignment>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM assignments \
                     WHERE date = ?1 AND guard_id = ?2 AND round_id = ?3"
                ),
                params![
                    assignment.date.format(DATE_FORMAT).to_string(),
                    assignment.guard_id,
                    assignment.round_id.to_string()
                ],
                raw_assignment_from_row,
            )
            .optional()?;
        row.map(RawAssignment::decode).transpose()
    }
}

#[async_trait]
impl PatrolStore for SqliteStore {
    async fn insert_zone(&self, zone: &Zone) -> StoreResult<()> {
        let zone = zone.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO zones (id, name, code, active, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    zone.id.to_string(),
                    zone.name,
                    zone.code,
                    zone.active,
                    micros(zone.created_at)
                ],
            )
            .map_err(|e| conflict_or(e, format!("zone code {} taken", zone.code)))?;
            Ok(())
        })
        .await
    }

    async fn get_zone(&self, id: Uuid) -> StoreResult<Option<Zone>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, code, active, created_at FROM zones WHERE id = ?1",
                    params![id.to_string()],
                    zone_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_zones(&self) -> StoreResult<Vec<Zone>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, code, active, created_at FROM zones ORDER BY code")?;
            let zones = stmt
                .query_map([], zone_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(zones)
        })
        .await
    }

    async fn set_zone_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE zones SET active = ?2 WHERE id = ?1",
                params![id.to_string(), active],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let checkpoint = checkpoint.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO checkpoints ({CHECKPOINT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    checkpoint.id.to_string(),
                    checkpoint.zone_id.to_string(),
                    checkpoint.name,
                    checkpoint.code,
                    checkpoint.order,
                    checkpoint.expected_offset_seconds,
                    checkpoint.grace_seconds,
                    checkpoint.active,
                    micros(checkpoint.created_at)
                ],
            )
            .map_err(|e| conflict_or(e, format!("checkpoint code {} taken", checkpoint.code)))?;
            Ok(())
        })
        .await
    }

    async fn get_checkpoint(&self, id: Uuid) -> StoreResult<Option<Checkpoint>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1"),
                    params![id.to_string()],
                    checkpoint_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn find_checkpoint_by_code(&self, code: &str) -> StoreResult<Option<Checkpoint>> {
        let code = code.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE code = ?1"),
                    params![code],
                    checkpoint_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_checkpoints(&self, zone_id: Uuid) -> StoreResult<Vec<Checkpoint>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE zone_id = ?1 \
                 ORDER BY position, code"
            ))?;
            let rows = stmt
                .query_map(params![zone_id.to_string()], checkpoint_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn set_checkpoint_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE checkpoints SET active = ?2 WHERE id = ?1",
                params![id.to_string(), active],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn insert_plan(&self, plan: &Plan) -> StoreResult<()> {
        let body = serde_json::to_string(plan)?;
        let (id, name) = (plan.id.to_string(), plan.name.clone());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO plans (id, name, body) VALUES (?1, ?2, ?3)",
                params![id, name, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_plan(&self, plan: &Plan) -> StoreResult<bool> {
        let body = serde_json::to_string(plan)?;
        let (id, name) = (plan.id.to_string(), plan.name.clone());
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE plans SET name = ?2, body = ?3 WHERE id = ?1",
                params![id, name, body],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn get_plan(&self, id: Uuid) -> StoreResult<Option<Plan>> {
        let body: Option<String> = self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT body FROM plans WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    async fn list_plans(&self) -> StoreResult<Vec<Plan>> {
        let bodies: Vec<String> = self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT body FROM plans ORDER BY name")?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    async fn insert_round(&self, round: &Round) -> StoreResult<()> {
        let round = round.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rounds (id, name, zone_id, plan_id, active) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    round.id.to_string(),
                    round.name,
                    round.zone_id.to_string(),
                    round.plan_id.to_string(),
                    round.active
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_round(&self, id: Uuid) -> StoreResult<Option<Round>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, zone_id, plan_id, active FROM rounds WHERE id = ?1",
                    params![id.to_string()],
                    round_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_rounds(&self) -> StoreResult<Vec<Round>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, zone_id, plan_id, active FROM rounds ORDER BY name")?;
            let rows = stmt
                .query_map([], round_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn insert_shift(&self, shift: &Shift) -> StoreResult<()> {
        let shift = shift.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO shifts (id, zone_id, guard_id, plan_id, assignment_id, status, start_at, end_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    shift.id.to_string(),
                    shift.zone_id.to_string(),
                    shift.guard_id,
                    shift.plan_id.map(|id| id.to_string()),
                    shift.assignment_id.map(|id| id.to_string()),
                    shift.status.as_str(),
                    micros(shift.start_at),
                    shift.end_at.map(micros)
                ],
            )
            .map_err(|e| {
                conflict_or(e, format!("guard {} already has an active shift", shift.guard_id))
            })?;
            for entry in &shift.progress {
                tx.execute(
                    "INSERT INTO shift_progress (shift_id, checkpoint_id, checkpoint_code, position, \
                     offset_seconds, expected_at, grace_seconds, status, scanned_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        shift.id.to_string(),
                        entry.checkpoint_id.to_string(),
                        entry.checkpoint_code,
                        entry.order,
                        entry.offset_seconds,
                        entry.expected_at.map(micros),
                        entry.grace_seconds,
                        entry.status.as_str(),
                        entry.scanned_at.map(micros)
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_shift(&self, id: Uuid) -> StoreResult<Option<Shift>> {
        self.with_conn(move |conn| Self::load_shift(conn, id)).await
    }

    async fn active_shift_for_guard(&self, guard_id: &str) -> StoreResult<Option<Shift>> {
        let guard_id = guard_id.to_string();
        self.with_conn(move |conn| {
            let mut shifts = Self::load_shifts(
                conn,
                "SELECT id, zone_id, guard_id, plan_id, assignment_id, status, start_at, end_at \
                 FROM shifts WHERE guard_id = ?1 AND status = 'active'",
                &[Value::Text(guard_id)],
            )?;
            Ok(shifts.pop())
        })
        .await
    }

    async fn list_shifts(&self, status: Option<ShiftStatus>) -> StoreResult<Vec<Shift>> {
        self.with_conn(move |conn| {
            let base = "SELECT id, zone_id, guard_id, plan_id, assignment_id, status, start_at, end_at \
                        FROM shifts";
            match status {
                Some(status) => Self::load_shifts(
                    conn,
                    &format!("{base} WHERE status = ?1 ORDER BY start_at"),
                    &[Value::Text(status.as_str().to_string())],
                ),
                None => Self::load_shifts(conn, &format!("{base} ORDER BY start_at"), &[]),
            }
        })
        .await
    }

    async fn complete_shift(&self, id: Uuid, end_at: DateTime<Utc>) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE shifts SET status = 'completed', end_at = ?2 \
                 WHERE id = ?1 AND status = 'active'",
                params![id.to_string(), micros(end_at)],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn set_progress_scanned(
        &self,
        shift_id: Uuid,
        checkpoint_id: Uuid,
        status: ProgressStatus,
        scanned_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE shift_progress SET status = ?3, scanned_at = ?4 \
                 WHERE shift_id = ?1 AND checkpoint_id = ?2 AND status IN ('pending', 'missed')",
                params![
                    shift_id.to_string(),
                    checkpoint_id.to_string(),
                    status.as_str(),
                    micros(scanned_at)
                ],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn mark_progress_missed(
        &self,
        shift_id: Uuid,
        checkpoint_id: Uuid,
    ) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE shift_progress SET status = 'missed' \
                 WHERE shift_id = ?1 AND checkpoint_id = ?2 AND status = 'pending'",
                params![shift_id.to_string(), checkpoint_id.to_string()],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn backfill_expected_at(
        &self,
        shift_id: Uuid,
        checkpoint_id: Uuid,
        expected_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE shift_progress SET expected_at = ?3 \
                 WHERE shift_id = ?1 AND checkpoint_id = ?2 AND expected_at IS NULL",
                params![
                    shift_id.to_string(),
                    checkpoint_id.to_string(),
                    micros(expected_at)
                ],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn insert_scan_unless_duplicate(
        &self,
        scan: &ScanEvent,
        window: Duration,
    ) -> StoreResult<ScanInsert> {
        let ts = micros(scan.timestamp);
        let span = window.num_microseconds().unwrap_or(i64::MAX);
        let scan = scan.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let prior = tx
                .query_row(
                    &format!(
                        "SELECT {SCAN_COLUMNS} FROM scans \
                         WHERE shift_id = ?1 AND checkpoint_id = ?2 AND ts > ?3 AND ts < ?4 \
                         ORDER BY ts LIMIT 1"
                    ),
                    params![
                        scan.shift_id.to_string(),
                        scan.checkpoint_id.to_string(),
                        ts.saturating_sub(span),
                        ts.saturating_add(span)
                    ],
                    scan_from_row,
                )
                .optional()?;
            if let Some(prior) = prior {
                return Ok(ScanInsert::Duplicate(prior));
            }
            let (lat, lng, accuracy) = geo_columns(scan.geo.as_ref());
            tx.execute(
                &format!(
                    "INSERT INTO scans ({SCAN_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    scan.id.to_string(),
                    scan.shift_id.to_string(),
                    scan.checkpoint_id.to_string(),
                    scan.checkpoint_code,
                    scan.guard_id,
                    ts,
                    micros(scan.received_at),
                    lat,
                    lng,
                    accuracy,
                    scan.note,
                    scan.sla_status.as_str(),
                    scan.source.as_str()
                ],
            )?;
            tx.commit()?;
            Ok(ScanInsert::Inserted)
        })
        .await
    }

    async fn list_scans(&self, shift_id: Uuid) -> StoreResult<Vec<ScanEvent>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCAN_COLUMNS} FROM scans WHERE shift_id = ?1 ORDER BY ts, id"
            ))?;
            let rows = stmt
                .query_map(params![shift_id.to_string()], scan_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn insert_alert(&self, alert: &Alert) -> StoreResult<()> {
        let alert = alert.clone();
        self.with_conn(move |conn| {
            write_alert(conn, &alert, false)?;
            Ok(())
        })
        .await
    }

    async fn insert_missed_alert_if_absent(&self, alert: &Alert) -> StoreResult<bool> {
        let alert = alert.clone();
        self.with_conn(move |conn| write_alert(conn, &alert, true).map(|n| n == 1)).await
    }

    async fn get_alert(&self, id: Uuid) -> StoreResult<Option<Alert>> {
        self.with_conn(move |conn| Self::load_alert(conn, id)).await
    }

    async fn ack_alert(&self, id: Uuid, stamp: &AuditStamp) -> StoreResult<Option<Transition>> {
        let stamp = stamp.clone();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE alerts SET status = 'ack', acked_by = ?2, acked_at = ?3 \
                 WHERE id = ?1 AND status = 'open'",
                params![id.to_string(), stamp.by, micros(stamp.at)],
            )?;
            Ok(Self::load_alert(conn, id)?.map(|alert| Transition {
                alert,
                changed: n == 1,
            }))
        })
        .await
    }

    async fn close_alert(&self, id: Uuid, stamp: &AuditStamp) -> StoreResult<Option<Transition>> {
        let stamp = stamp.clone();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE alerts SET status = 'closed', closed_by = ?2, closed_at = ?3, closed_note = ?4 \
                 WHERE id = ?1 AND status IN ('open', 'ack')",
                params![id.to_string(), stamp.by, micros(stamp.at), stamp.note],
            )?;
            Ok(Self::load_alert(conn, id)?.map(|alert| Transition {
                alert,
                changed: n == 1,
            }))
        })
        .await
    }

    async fn live_missed_alerts(&self, shift_id: Uuid) -> StoreResult<Vec<Alert>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ALERT_COLUMNS} FROM alerts \
                 WHERE shift_id = ?1 AND kind = 'missed_checkpoint' AND status IN ('open', 'ack')"
            ))?;
            let rows = stmt
                .query_map(params![shift_id.to_string()], alert_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn list_alerts(&self, query: &AlertQuery) -> StoreResult<Page<Alert>> {
        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        if let Some(status) = query.status {
            args.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(severity) = query.severity {
            args.push(Value::Text(severity.as_str().to_string()));
            clauses.push(format!("severity = ?{}", args.len()));
        }
        if let Some(kind) = query.kind {
            args.push(Value::Text(kind.as_str().to_string()));
            clauses.push(format!("kind = ?{}", args.len()));
        }
        if let Some(shift_id) = query.shift_id {
            args.push(Value::Text(shift_id.to_string()));
            clauses.push(format!("shift_id = ?{}", args.len()));
        }
        if let Some(from) = query.from {
            args.push(Value::Integer(micros(from)));
            clauses.push(format!("opened_at >= ?{}", args.len()));
        }
        if let Some(to) = query.to {
            args.push(Value::Integer(micros(to)));
            clauses.push(format!("opened_at <= ?{}", args.len()));
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let limit = query.effective_limit();
        let offset = query.offset();
        let page = query.page.max(1);

        self.with_conn(move |conn| {
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM alerts{filter}"),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )?;

            let mut page_args = args.clone();
            page_args.push(Value::Integer(i64::from(limit)));
            let limit_idx = page_args.len();
            page_args.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
            let offset_idx = page_args.len();

            let mut stmt = conn.prepare(&format!(
                "SELECT {ALERT_COLUMNS} FROM alerts{filter} \
                 ORDER BY opened_at DESC, id LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
            ))?;
            let items = stmt
                .query_map(params_from_iter(page_args.iter()), alert_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Page {
                items,
                total: usize::try_from(total).unwrap_or_default(),
                page,
                limit,
            })
        })
        .await
    }

    async fn insert_assignment_if_absent(
        &self,
        assignment: &Assignment,
    ) -> StoreResult<(Assignment, bool)> {
        let points = serde_json::to_string(&assignment.points)?;
        let assignment = assignment.clone();
        self.with_conn(move |conn| {
            let n = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO assignments ({ASSIGNMENT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    assignment.id.to_string(),
                    assignment.date.format(DATE_FORMAT).to_string(),
                    assignment.guard_id,
                    assignment.round_id.to_string(),
                    assignment.plan_id.to_string(),
                    points,
                    hhmm(assignment.start_time),
                    hhmm(assignment.end_time),
                    assignment.status.as_str(),
                    micros(assignment.created_at)
                ],
            )?;
            if n == 1 {
                return Ok((assignment, true));
            }
            let existing = Self::load_assignment_by_key(conn, &assignment)?.ok_or_else(|| {
                StoreError::Backend("assignment insert ignored but no row found".to_string())
            })?;
            Ok((existing, false))
        })
        .await
    }

    async fn get_assignment(&self, id: Uuid) -> StoreResult<Option<Assignment>> {
        let raw = self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE id = ?1"),
                    params![id.to_string()],
                    raw_assignment_from_row,
                )
                .optional()?)
        })
        .await?;
        raw.map(RawAssignment::decode).transpose()
    }

    async fn list_assignments(
        &self,
        date: NaiveDate,
        guard_id: Option<&str>,
    ) -> StoreResult<Vec<Assignment>> {
        let date = date.format(DATE_FORMAT).to_string();
        let guard_id = guard_id.map(str::to_string);
        let raws = self.with_conn(move |conn| {
            let mut args = vec![Value::Text(date)];
            let mut sql = format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE date = ?1");
            if let Some(guard_id) = guard_id {
                args.push(Value::Text(guard_id));
                sql.push_str(" AND guard_id = ?2");
            }
            sql.push_str(" ORDER BY guard_id, start_time, round_id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), raw_assignment_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;
        raws.into_iter().map(RawAssignment::decode).collect()
    }

    async fn set_assignment_status(
        &self,
        id: Uuid,
        status: AssignmentStatus,
    ) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE assignments SET status = ?2 WHERE id = ?1",
                params![id.to_string(), status.as_str()],
            )?;
            Ok(n == 1)
        })
        .await
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn hhmm(t: NaiveTime) -> String {
    t.format(crate::types::hhmm::FORMAT).to_string()
}

fn conversion_error(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, message.into())
}

fn conflict_or(err: rusqlite::Error, message: String) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict(message)
        }
        _ => StoreError::Sqlite(err),
    }
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, Type::Text, e.to_string()))
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| Uuid::parse_str(&r).map_err(|e| conversion_error(idx, Type::Text, e.to_string())))
        .transpose()
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(raw)
        .ok_or_else(|| conversion_error(idx, Type::Integer, format!("timestamp {raw} out of range")))
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|v| {
        DateTime::from_timestamp_micros(v)
            .ok_or_else(|| conversion_error(idx, Type::Integer, format!("timestamp {v} out of range")))
    })
    .transpose()
}

fn enum_at<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, Type::Text, format!("unknown value {raw}")))
}

fn geo_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Geo>> {
    let lat: Option<f64> = row.get(idx)?;
    let lng: Option<f64> = row.get(idx + 1)?;
    let accuracy: Option<f64> = row.get(idx + 2)?;
    Ok(lat.zip(lng).map(|(lat, lng)| Geo { lat, lng, accuracy }))
}

fn geo_columns(geo: Option<&Geo>) -> (Option<f64>, Option<f64>, Option<f64>) {
    geo.map_or((None, None, None), |g| (Some(g.lat), Some(g.lng), g.accuracy))
}

fn zone_from_row(row: &Row<'_>) -> rusqlite::Result<Zone> {
    Ok(Zone {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        active: row.get(3)?,
        created_at: time_at(row, 4)?,
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: uuid_at(row, 0)?,
        zone_id: uuid_at(row, 1)?,
        name: row.get(2)?,
        code: row.get(3)?,
        order: row.get(4)?,
        expected_offset_seconds: row.get(5)?,
        grace_seconds: row.get(6)?,
        active: row.get(7)?,
        created_at: time_at(row, 8)?,
    })
}

fn round_from_row(row: &Row<'_>) -> rusqlite::Result<Round> {
    Ok(Round {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        zone_id: uuid_at(row, 2)?,
        plan_id: uuid_at(row, 3)?,
        active: row.get(4)?,
    })
}

fn shift_from_row(row: &Row<'_>) -> rusqlite::Result<Shift> {
    Ok(Shift {
        id: uuid_at(row, 0)?,
        zone_id: uuid_at(row, 1)?,
        guard_id: row.get(2)?,
        plan_id: opt_uuid_at(row, 3)?,
        assignment_id: opt_uuid_at(row, 4)?,
        status: enum_at(row, 5, ShiftStatus::parse)?,
        start_at: time_at(row, 6)?,
        end_at: opt_time_at(row, 7)?,
        progress: Vec::new(),
    })
}

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<ScanEvent> {
    Ok(ScanEvent {
        id: uuid_at(row, 0)?,
        shift_id: uuid_at(row, 1)?,
        checkpoint_id: uuid_at(row, 2)?,
        checkpoint_code: row.get(3)?,
        guard_id: row.get(4)?,
        timestamp: time_at(row, 5)?,
        received_at: time_at(row, 6)?,
        geo: geo_at(row, 7)?,
        note: row.get(10)?,
        sla_status: enum_at(row, 11, SlaStatus::parse)?,
        source: enum_at(row, 12, ScanSource::parse)?,
    })
}

fn stamp_at(row: &Row<'_>, by_idx: usize, at_idx: usize) -> rusqlite::Result<Option<AuditStamp>> {
    let by: Option<String> = row.get(by_idx)?;
    let at = opt_time_at(row, at_idx)?;
    Ok(by.zip(at).map(|(by, at)| AuditStamp { by, at, note: None }))
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let closed = stamp_at(row, 17, 18)?.map(|mut stamp| -> rusqlite::Result<AuditStamp> {
        stamp.note = row.get(19)?;
        Ok(stamp)
    });
    Ok(Alert {
        id: uuid_at(row, 0)?,
        kind: enum_at(row, 1, AlertKind::parse)?,
        severity: enum_at(row, 2, AlertSeverity::parse)?,
        status: enum_at(row, 3, AlertStatus::parse)?,
        shift_id: opt_uuid_at(row, 4)?,
        guard_id: row.get(5)?,
        meta: AlertMeta {
            cp_code: row.get(6)?,
            checkpoint_id: opt_uuid_at(row, 7)?,
            expected_at: opt_time_at(row, 8)?,
        },
        geo: geo_at(row, 9)?,
        note: row.get(12)?,
        opened: AuditStamp {
            by: row.get(13)?,
            at: time_at(row, 14)?,
            note: None,
        },
        acked: stamp_at(row, 15, 16)?,
        closed: closed.transpose()?,
    })
}

/// Inserts an alert; with `if_absent` a unique-index hit is reported as 0 rows.
fn write_alert(conn: &Connection, alert: &Alert, if_absent: bool) -> StoreResult<usize> {
    let verb = if if_absent {
        "INSERT OR IGNORE"
    } else {
        "INSERT"
    };
    let (lat, lng, accuracy) = geo_columns(alert.geo.as_ref());
    let n = conn.execute(
        &format!(
            "{verb} INTO alerts ({ALERT_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
        ),
        params![
            alert.id.to_string(),
            alert.kind.as_str(),
            alert.severity.as_str(),
            alert.status.as_str(),
            alert.shift_id.map(|id| id.to_string()),
            alert.guard_id,
            alert.meta.cp_code,
            alert.meta.checkpoint_id.map(|id| id.to_string()),
            alert.meta.expected_at.map(micros),
            lat,
            lng,
            accuracy,
            alert.note,
            alert.opened.by,
            micros(alert.opened.at),
            alert.acked.as_ref().map(|s| s.by.clone()),
            alert.acked.as_ref().map(|s| micros(s.at)),
            alert.closed.as_ref().map(|s| s.by.clone()),
            alert.closed.as_ref().map(|s| micros(s.at)),
            alert.closed.as_ref().and_then(|s| s.note.clone())
        ],
    )?;
    Ok(n)
}

/// Assignment row before JSON and date columns are decoded.
struct RawAssignment {
    id: Uuid,
    date: String,
    guard_id: String,
    round_id: Uuid,
    plan_id: Uuid,
    points: String,
    start_time: String,
    end_time: String,
    status: AssignmentStatus,
    created_at: DateTime<Utc>,
}

impl RawAssignment {
    fn decode(self) -> StoreResult<Assignment> {
        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
            .map_err(|e| StoreError::Corrupt(format!("assignment date {}: {e}", self.date)))?;
        let points: Vec<AssignmentPoint> = serde_json::from_str(&self.points)?;
        let start_time = crate::types::hhmm::parse(&self.start_time)
            .map_err(|e| StoreError::Corrupt(format!("start_time {}: {e}", self.start_time)))?;
        let end_time = crate::types::hhmm::parse(&self.end_time)
            .map_err(|e| StoreError::Corrupt(format!("end_time {}: {e}", self.end_time)))?;
        Ok(Assignment {
            id: self.id,
            date,
            guard_id: self.guard_id,
            round_id: self.round_id,
            plan_id: self.plan_id,
            points,
            start_time,
            end_time,
            status: self.status,
            created_at: self.created_at,
        })
    }
}

fn raw_assignment_from_row(row: &Row<'_>) -> rusqlite::Result<RawAssignment> {
    Ok(RawAssignment {
        id: uuid_at(row, 0)?,
        date: row.get(1)?,
        guard_id: row.get(2)?,
        round_id: uuid_at(row, 3)?,
        plan_id: uuid_at(row, 4)?,
        points: row.get(5)?,
        start_time: row.get(6)?,
        end_time: row.get(7)?,
        status: enum_at(row, 8, AssignmentStatus::parse)?,
        created_at: time_at(row, 9)?,
    })
}
