//! Offline outbox upload.
//!
//! Devices queue scans while disconnected and upload them in one batch.
//! Each event goes through the live scan pipeline with its device timestamp
//! as the evaluation instant. One bad event never fails the batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::Services;
use crate::error::{PatrolError, Result};
use crate::scan::{ScanIngestor, ScanRequest};
use crate::types::{CheckpointRef, Geo, ScanSource};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEvent {
    #[serde(default)]
    pub shift_id: Option<Uuid>,
    /// Checkpoint id or scan token
    pub checkpoint_ref: String,
    #[serde(default)]
    pub geo: Option<Geo>,
    #[serde(default)]
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineBatch {
    #[serde(default, alias = "outbox")]
    pub events: Vec<OfflineEvent>,
    /// Client-side progress view; informational only
    #[serde(default)]
    pub progress: Option<serde_json::Value>,
    #[serde(default)]
    pub device: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedCounts {
    pub marks: usize,
    /// Events already on the server (re-uploads)
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    /// Position in the uploaded batch
    pub index: usize,
    pub code: String,
    pub message: String,
}

impl SyncError {
    fn new(index: usize, err: &PatrolError) -> Self {
        Self {
            index,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub saved: SavedCounts,
    pub errors: Vec<SyncError>,
}

#[derive(Clone)]
pub struct OfflineSync {
    services: Services,
    scans: ScanIngestor,
}

impl OfflineSync {
    pub fn new(services: Services, scans: ScanIngestor) -> Self {
        Self { services, scans }
    }

    /// Replay a batch for `guard_id` in timestamp order.
    pub async fn sync(&self, guard_id: &str, batch: OfflineBatch) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut order: Vec<usize> = (0..batch.events.len()).collect();
        order.sort_by_key(|&i| batch.events[i].timestamp);

        // Looked up at most once, and only if some event needs it
        let mut active_shift: Option<Option<Uuid>> = None;

        for index in order {
            let event = &batch.events[index];
            let shift_id = match event.shift_id {
                Some(id) => id,
                None => {
                    if active_shift.is_none() {
                        match self.services.store.active_shift_for_guard(guard_id).await {
                            Ok(shift) => active_shift = Some(shift.map(|s| s.id)),
                            Err(e) => {
                                let e = PatrolError::from(e);
                                warn!(index, error = %e, "Active shift lookup failed");
                                report.errors.push(SyncError::new(index, &e));
                                continue;
                            }
                        }
                    }
                    match active_shift.flatten() {
                        Some(id) => id,
                        None => {
                            report.errors.push(SyncError {
                                index,
                                code: "INVALID_SHIFT".to_string(),
                                message: format!("guard {guard_id} has no active shift"),
                            });
                            continue;
                        }
                    }
                }
            };

            let request = ScanRequest {
                shift_id,
                checkpoint: CheckpointRef::parse(&event.checkpoint_ref),
                guard_id: Some(guard_id.to_string()),
                geo: event.geo,
                note: event.note.clone(),
                timestamp: Some(event.timestamp),
                source: ScanSource::Offline,
            };

            match self.scans.register(request).await {
                Ok(_) => report.saved.marks += 1,
                Err(PatrolError::DuplicateScan(prior)) => {
                    debug!(index, prior_scan = %prior.id, "Offline event already recorded");
                    report.saved.duplicates += 1;
                }
                Err(e) => report.errors.push(SyncError::new(index, &e)),
            }
        }

        report.errors.sort_by_key(|e| e.index);
        info!(
            guard_id,
            events = batch.events.len(),
            marks = report.saved.marks,
            duplicates = report.saved.duplicates,
            errors = report.errors.len(),
            "Offline batch synced"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::{NewCheckpoint, NewZone};
    use crate::store::{MemoryStore, SqliteStore};
    use crate::types::SlaStatus;
    use crate::Engine;
    use chrono::Duration;
    use std::sync::Arc;

    fn event(code: &str, at: DateTime<Utc>) -> OfflineEvent {
        OfflineEvent {
            shift_id: None,
            checkpoint_ref: code.to_string(),
            geo: None,
            note: None,
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn test_events_use_device_time_and_active_shift() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let engine = Engine::builder(Arc::new(MemoryStore::new()))
            .clock(clock.clone())
            .build();
        let zone = engine
            .registry
            .create_zone(NewZone {
                name: "Depot".to_string(),
                code: "D".to_string(),
            })
            .await
            .unwrap();
        engine
            .registry
            .create_checkpoint(
                zone.id,
                NewCheckpoint {
                    name: "Bay".to_string(),
                    code: "D-BAY".to_string(),
                    order: 1,
                    expected_offset_seconds: 60,
                    grace_seconds: 0,
                },
            )
            .await
            .unwrap();
        let shift = engine.shifts.start(zone.id, "g-1").await.unwrap();

        // Uploaded an hour later, scanned on time
        clock.advance(Duration::hours(1));
        let batch = OfflineBatch {
            events: vec![
                event("D-BAY", start + Duration::seconds(30)),
                event("D-BAY", start + Duration::seconds(40)),
            ],
            ..OfflineBatch::default()
        };
        let report = engine.offline.sync("g-1", batch.clone()).await.unwrap();
        assert_eq!(report.saved.marks, 1);
        assert_eq!(report.saved.duplicates, 1);
        assert!(report.errors.is_empty());

        let scans = engine.services().store.list_scans(shift.id).await.unwrap();
        assert_eq!(scans[0].sla_status, SlaStatus::OnTime);
        assert_eq!(scans[0].source, ScanSource::Offline);

        // Re-upload is harmless
        let again = engine.offline.sync("g-1", batch).await.unwrap();
        assert_eq!(again.saved.marks, 0);
        assert_eq!(again.saved.duplicates, 2);
    }

    #[tokio::test]
    async fn test_no_active_shift_reported_per_event() {
        let engine = Engine::builder(Arc::new(MemoryStore::new())).build();
        let batch = OfflineBatch {
            events: vec![event("X", Utc::now())],
            ..OfflineBatch::default()
        };
        let report = engine.offline.sync("g-9", batch).await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, "INVALID_SHIFT");
    }

    #[tokio::test]
    async fn test_store_failure_reported_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patrol.db");
        let engine = Engine::builder(Arc::new(SqliteStore::open(&path).unwrap())).build();
        let zone = engine
            .registry
            .create_zone(NewZone {
                name: "Depot".to_string(),
                code: "D".to_string(),
            })
            .await
            .unwrap();
        engine
            .registry
            .create_checkpoint(
                zone.id,
                NewCheckpoint {
                    name: "Gate".to_string(),
                    code: "D-1".to_string(),
                    order: 1,
                    expected_offset_seconds: 60,
                    grace_seconds: 0,
                },
            )
            .await
            .unwrap();
        engine.shifts.start(zone.id, "g-1").await.unwrap();

        // Progress rows can no longer be read
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE shift_progress;")
            .unwrap();

        let batch = OfflineBatch {
            events: vec![event("D-1", Utc::now()), event("D-2", Utc::now())],
            ..OfflineBatch::default()
        };
        let report = engine.offline.sync("g-1", batch).await.unwrap();
        assert_eq!(report.saved, SavedCounts::default());
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].index, 0);
        assert_eq!(report.errors[1].index, 1);
        assert!(report.errors.iter().all(|e| e.code == "INTERNAL"));
    }

    #[test]
    fn test_outbox_alias() {
        let batch: OfflineBatch = serde_json::from_str(
            r#"{"outbox": [{"checkpointRef": "A-1", "timestamp": "2024-01-01T10:00:00Z"}], "device": {"os": "android"}}"#,
        )
        .unwrap();
        assert_eq!(batch.events.len(), 1);
        assert!(batch.device.is_some());
    }
}
