//! Notification event types for patrol operations.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Severity levels for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Get the Slack attachment color for this severity.
    #[must_use]
    pub const fn color(&self) -> &'static str {
        match self {
            Self::Info => "#3498db",
            Self::Warning => "#f39c12",
            Self::Critical => "#e74c3c",
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// Free-form message addressed to a single guard
    GuardMessage {
        guard_id: String,
        message: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A daily assignment was created for a guard
    AssignmentCreated {
        guard_id: String,
        round_name: String,
        date: NaiveDate,
        start_time: String,
        end_time: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A field or system alert was opened and needs a supervisor
    AlertRaised {
        alert_id: String,
        kind: String,
        severity: Severity,
        guard_id: Option<String>,
        message: String,
        #[serde(default)]
        context: HashMap<String, String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::GuardMessage { guard_id, .. } => format!("Message for {guard_id}"),
            Self::AssignmentCreated {
                round_name, date, ..
            } => format!("New Assignment: {round_name} on {date}"),
            Self::AlertRaised { kind, alert_id, .. } => format!("Alert {kind}: {alert_id}"),
        }
    }

    /// Get the severity for this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::GuardMessage { .. } | Self::AssignmentCreated { .. } => Severity::Info,
            Self::AlertRaised { severity, .. } => *severity,
        }
    }

    /// Guard this event is addressed to or about, if any.
    #[must_use]
    pub fn guard_id(&self) -> Option<&str> {
        match self {
            Self::GuardMessage { guard_id, .. } | Self::AssignmentCreated { guard_id, .. } => {
                Some(guard_id)
            }
            Self::AlertRaised { guard_id, .. } => guard_id.as_deref(),
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::GuardMessage { timestamp, .. }
            | Self::AssignmentCreated { timestamp, .. }
            | Self::AlertRaised { timestamp, .. } => *timestamp,
        }
    }
}
