//! Domain types for patrol topology, shifts, scans, alerts and assignments.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

// ============================================================================
// Topology
// ============================================================================

/// A physical area grouping checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: Uuid,
    pub name: String,
    /// Unique short code
    pub code: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A scannable point inside a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub name: String,
    /// Unique scan token, printed into the checkpoint's QR code
    pub code: String,
    /// Position in the route
    pub order: u32,
    /// Seconds after shift start at which the checkpoint is due
    pub expected_offset_seconds: i64,
    /// Tolerance before a scan counts as late
    pub grace_seconds: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-checkpoint entry of a plan, with optional window/tolerance overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCheckpoint {
    pub checkpoint_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_seconds: Option<i64>,
}

/// A recurring patrol schedule template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub zone_id: Uuid,
    /// 0 = Sunday .. 6 = Saturday
    pub days_of_week: BTreeSet<u8>,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    /// May be earlier than `start_time` when the window crosses midnight
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub checkpoints: Vec<PlanCheckpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_threshold_seconds: Option<i64>,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    /// Whether the plan runs on the given weekday (0 = Sunday).
    #[must_use]
    pub fn runs_on(&self, weekday: u8) -> bool {
        self.days_of_week.contains(&weekday)
    }

    /// Whether the patrol window crosses midnight.
    #[must_use]
    pub fn crosses_midnight(&self) -> bool {
        self.end_time < self.start_time
    }

    #[must_use]
    pub fn entry_for(&self, checkpoint_id: Uuid) -> Option<&PlanCheckpoint> {
        self.checkpoints
            .iter()
            .find(|c| c.checkpoint_id == checkpoint_id)
    }
}

/// A named route bound to a plan; the unit the daily generator assigns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: Uuid,
    pub name: String,
    pub zone_id: Uuid,
    pub plan_id: Uuid,
    pub active: bool,
}

// ============================================================================
// Shifts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftStatus {
    Active,
    Completed,
    Cancelled,
}

impl ShiftStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Progress state of a single checkpoint within a shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Pending,
    Ok,
    Late,
    Missed,
}

impl ProgressStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Late => "late",
            Self::Missed => "missed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "ok" => Some(Self::Ok),
            "late" => Some(Self::Late),
            "missed" => Some(Self::Missed),
            _ => None,
        }
    }

    /// True once a scan has been recorded for the entry.
    #[must_use]
    pub const fn is_scanned(&self) -> bool {
        matches!(self, Self::Ok | Self::Late)
    }
}

impl From<SlaStatus> for ProgressStatus {
    fn from(sla: SlaStatus) -> Self {
        match sla {
            SlaStatus::OnTime => Self::Ok,
            SlaStatus::Late => Self::Late,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    pub checkpoint_id: Uuid,
    pub checkpoint_code: String,
    pub order: u32,
    /// Offset from shift start captured when the shift was opened
    pub offset_seconds: i64,
    /// `None` only for legacy rows; the reconciler backfills it
    pub expected_at: Option<DateTime<Utc>>,
    pub grace_seconds: i64,
    pub status: ProgressStatus,
    pub scanned_at: Option<DateTime<Utc>>,
}

/// One guard's execution of a patrol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shift {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub guard_id: String,
    pub plan_id: Option<Uuid>,
    pub assignment_id: Option<Uuid>,
    pub status: ShiftStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub progress: Vec<ProgressEntry>,
}

impl Shift {
    /// Checkpoint ids in the order they are expected.
    #[must_use]
    pub fn expected_order(&self) -> Vec<Uuid> {
        self.progress.iter().map(|p| p.checkpoint_id).collect()
    }

    #[must_use]
    pub fn progress_for(&self, checkpoint_id: Uuid) -> Option<&ProgressEntry> {
        self.progress
            .iter()
            .find(|p| p.checkpoint_id == checkpoint_id)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ShiftStatus::Active
    }
}

/// Read-time summary returned when a shift ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftSummary {
    pub shift_id: Uuid,
    pub guard_id: String,
    pub status: ShiftStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub expected: usize,
    pub scanned: Vec<Uuid>,
    pub missed: Vec<Uuid>,
    pub on_time: usize,
    pub late: usize,
}

// ============================================================================
// Scans
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    OnTime,
    Late,
}

impl SlaStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OnTime => "on_time",
            Self::Late => "late",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "on_time" => Some(Self::OnTime),
            "late" => Some(Self::Late),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanSource {
    Live,
    Offline,
}

impl ScanSource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Offline => "offline",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "live" => Some(Self::Live),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geo {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// Immutable record of one checkpoint scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEvent {
    pub id: Uuid,
    pub shift_id: Uuid,
    pub checkpoint_id: Uuid,
    pub checkpoint_code: String,
    pub guard_id: String,
    /// When the scan happened on the device
    pub timestamp: DateTime<Utc>,
    /// When the server accepted it
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<Geo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub sla_status: SlaStatus,
    pub source: ScanSource,
}

/// Either a checkpoint id or the scanned QR token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointRef {
    Id(Uuid),
    Code(String),
}

impl CheckpointRef {
    /// Interpret raw client input: a UUID is treated as an id, anything else as a token.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Uuid::parse_str(raw.trim()).map_or_else(|_| Self::Code(raw.trim().to_string()), Self::Id)
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    MissedCheckpoint,
    Incident,
    Panic,
    Immobility,
    Fall,
}

impl AlertKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MissedCheckpoint => "missed_checkpoint",
            Self::Incident => "incident",
            Self::Panic => "panic",
            Self::Immobility => "immobility",
            Self::Fall => "fall",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "missed_checkpoint" => Some(Self::MissedCheckpoint),
            "incident" => Some(Self::Incident),
            "panic" => Some(Self::Panic),
            "immobility" => Some(Self::Immobility),
            "fall" => Some(Self::Fall),
            _ => None,
        }
    }

    /// Severity used when the reporter does not pick one.
    #[must_use]
    pub const fn default_severity(&self) -> AlertSeverity {
        match self {
            Self::Panic | Self::Fall => AlertSeverity::Critical,
            Self::Immobility => AlertSeverity::High,
            Self::MissedCheckpoint | Self::Incident => AlertSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Ack,
    Closed,
}

impl AlertStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Ack => "ack",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "ack" => Some(Self::Ack),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Open and acknowledged alerts still need attention.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Open | Self::Ack)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cp_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_at: Option<DateTime<Utc>>,
}

/// Who did something to an alert, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditStamp {
    pub by: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AuditStamp {
    #[must_use]
    pub fn new(by: impl Into<String>, at: DateTime<Utc>, note: Option<String>) -> Self {
        Self {
            by: by.into(),
            at,
            note,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub shift_id: Option<Uuid>,
    pub guard_id: Option<String>,
    pub meta: AlertMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<Geo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub opened: AuditStamp,
    pub acked: Option<AuditStamp>,
    pub closed: Option<AuditStamp>,
}

/// Filters for alert listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertQuery {
    pub status: Option<AlertStatus>,
    pub severity: Option<AlertSeverity>,
    pub kind: Option<AlertKind>,
    pub shift_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl AlertQuery {
    /// Upper bound on page size.
    pub const MAX_LIMIT: u32 = 200;

    /// Whether `alert` passes every filter (pagination aside).
    #[must_use]
    pub fn matches(&self, alert: &Alert) -> bool {
        self.status.is_none_or(|s| alert.status == s)
            && self.severity.is_none_or(|s| alert.severity == s)
            && self.kind.is_none_or(|k| alert.kind == k)
            && self.shift_id.is_none_or(|id| alert.shift_id == Some(id))
            && self.from.is_none_or(|from| alert.opened.at >= from)
            && self.to.is_none_or(|to| alert.opened.at <= to)
    }

    /// Page size clamped to `1..=MAX_LIMIT`.
    #[must_use]
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.effective_limit() as usize
    }
}

const fn default_page() -> u32 {
    1
}

const fn default_limit() -> u32 {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: u32,
    pub limit: u32,
}

// ============================================================================
// Assignments
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Scheduled,
    InProgress,
    Completed,
}

impl AssignmentStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A plan checkpoint frozen at assignment time, overrides already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentPoint {
    pub checkpoint_id: Uuid,
    pub code: String,
    pub order: u32,
    pub offset_seconds: i64,
    pub grace_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: Uuid,
    pub date: NaiveDate,
    pub guard_id: String,
    pub round_id: Uuid,
    pub plan_id: Uuid,
    pub points: Vec<AssignmentPoint>,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub status: AssignmentStatus,
    pub created_at: DateTime<Utc>,
}

/// Convert whole seconds into a chrono duration.
#[must_use]
pub fn seconds(secs: i64) -> Duration {
    Duration::seconds(secs)
}

/// `HH:MM` (de)serialization for wall-clock times.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(de::Error::custom)
    }

    /// Accepts `HH:MM` and `HH:MM:SS`.
    pub fn parse(raw: &str) -> Result<NaiveTime, chrono::ParseError> {
        NaiveTime::parse_from_str(raw, FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
    }
}
