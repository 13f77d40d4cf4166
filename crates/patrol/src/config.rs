//! Engine tunables.

use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

/// Timing and policy knobs for the engine. Every field has a default so a
/// partial YAML document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatrolConfig {
    /// Two scans of the same checkpoint in one shift closer than this are duplicates
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window_seconds: i64,

    /// Floor applied to every checkpoint's grace period
    #[serde(default)]
    pub default_grace_seconds: i64,

    /// Overdue time after which a pending checkpoint is missed, unless the plan overrides it
    #[serde(default = "default_missing_threshold")]
    pub missing_threshold_seconds: i64,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,

    #[serde(default = "default_assignment_interval")]
    pub assignment_interval_seconds: u64,

    /// Days after today the assignment job also fills in
    #[serde(default = "default_horizon")]
    pub assignment_horizon_days: u32,

    /// Capability a guard must hold to receive assignments
    #[serde(default = "default_guard_capability")]
    pub guard_capability: String,

    /// Upper bound on a single event publication
    #[serde(default = "default_event_timeout")]
    pub event_timeout_ms: u64,

    /// Offset of the site's local day from UTC
    #[serde(default)]
    pub utc_offset_seconds: i32,
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            duplicate_window_seconds: default_duplicate_window(),
            default_grace_seconds: 0,
            missing_threshold_seconds: default_missing_threshold(),
            reconcile_interval_seconds: default_reconcile_interval(),
            assignment_interval_seconds: default_assignment_interval(),
            assignment_horizon_days: default_horizon(),
            guard_capability: default_guard_capability(),
            event_timeout_ms: default_event_timeout(),
            utc_offset_seconds: 0,
        }
    }
}

impl PatrolConfig {
    #[must_use]
    pub fn duplicate_window(&self) -> Duration {
        Duration::seconds(self.duplicate_window_seconds)
    }

    #[must_use]
    pub fn event_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.event_timeout_ms)
    }

    #[must_use]
    pub fn reconcile_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reconcile_interval_seconds.max(1))
    }

    #[must_use]
    pub fn assignment_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.assignment_interval_seconds.max(1))
    }

    /// Site-local offset; out-of-range values fall back to UTC.
    #[must_use]
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_seconds).unwrap_or_else(|| Utc.fix())
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.duplicate_window_seconds < 0 {
            return Err("duplicateWindowSeconds must not be negative".to_string());
        }
        if self.default_grace_seconds < 0 {
            return Err("defaultGraceSeconds must not be negative".to_string());
        }
        if self.missing_threshold_seconds < 0 {
            return Err("missingThresholdSeconds must not be negative".to_string());
        }
        if FixedOffset::east_opt(self.utc_offset_seconds).is_none() {
            return Err(format!(
                "utcOffsetSeconds {} is outside +/-24h",
                self.utc_offset_seconds
            ));
        }
        Ok(())
    }
}

const fn default_duplicate_window() -> i64 {
    20
}

const fn default_missing_threshold() -> i64 {
    600
}

const fn default_reconcile_interval() -> u64 {
    120
}

const fn default_assignment_interval() -> u64 {
    3600
}

const fn default_horizon() -> u32 {
    1
}

fn default_guard_capability() -> String {
    "guardia".to_string()
}

const fn default_event_timeout() -> u64 {
    500
}
