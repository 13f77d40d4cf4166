//! Scan ingestion and SLA classification.
//!
//! Validation short-circuits in a fixed order: checkpoint, shift, zone,
//! guard, duplicate window. Only then is the scan classified and stored.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::Services;
use crate::error::{PatrolError, Result};
use crate::events::PatrolEvent;
use crate::registry::Registry;
use crate::store::ScanInsert;
use crate::types::{seconds, CheckpointRef, Geo, ScanEvent, ScanSource, SlaStatus};

/// One scan as submitted by a device.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub shift_id: Uuid,
    pub checkpoint: CheckpointRef,
    /// Caller identity; when present it must own the shift
    pub guard_id: Option<String>,
    pub geo: Option<Geo>,
    pub note: Option<String>,
    /// Device time for offline uploads; live scans use the server clock
    pub timestamp: Option<DateTime<Utc>>,
    pub source: ScanSource,
}

impl ScanRequest {
    pub fn live(shift_id: Uuid, checkpoint: CheckpointRef) -> Self {
        Self {
            shift_id,
            checkpoint,
            guard_id: None,
            geo: None,
            note: None,
            timestamp: None,
            source: ScanSource::Live,
        }
    }

    #[must_use]
    pub fn by_guard(mut self, guard_id: impl Into<String>) -> Self {
        self.guard_id = Some(guard_id.into());
        self
    }
}

/// On time while `timestamp - target <= grace`, late after that. A scan is
/// never classified as missed.
#[must_use]
pub fn classify(target: DateTime<Utc>, grace_seconds: i64, timestamp: DateTime<Utc>) -> SlaStatus {
    if timestamp - target > seconds(grace_seconds) {
        SlaStatus::Late
    } else {
        SlaStatus::OnTime
    }
}

#[derive(Clone)]
pub struct ScanIngestor {
    services: Services,
    registry: Registry,
}

impl ScanIngestor {
    pub fn new(services: Services) -> Self {
        Self {
            registry: Registry::new(services.clone()),
            services,
        }
    }

    pub async fn register(&self, request: ScanRequest) -> Result<ScanEvent> {
        let store = &self.services.store;
        let config = &self.services.config;

        let checkpoint = self.registry.resolve_checkpoint(&request.checkpoint).await?;

        let shift = match store.get_shift(request.shift_id).await? {
            Some(shift) if shift.is_active() => shift,
            _ => return Err(PatrolError::InvalidShift(request.shift_id)),
        };

        if checkpoint.zone_id != shift.zone_id {
            return Err(PatrolError::ZoneMismatch {
                checkpoint_zone: checkpoint.zone_id,
                shift_zone: shift.zone_id,
            });
        }

        if let Some(guard_id) = &request.guard_id {
            if *guard_id != shift.guard_id {
                return Err(PatrolError::ShiftMismatch { shift_id: shift.id });
            }
        }

        let received_at = self.services.clock.now();
        let timestamp = request.timestamp.unwrap_or(received_at);

        let entry = shift.progress_for(checkpoint.id);
        let offset = entry.map_or(checkpoint.expected_offset_seconds, |e| e.offset_seconds);
        let grace = entry
            .map_or(checkpoint.grace_seconds, |e| e.grace_seconds)
            .max(config.default_grace_seconds);
        let sla_status = classify(shift.start_at + seconds(offset), grace, timestamp);

        let scan = ScanEvent {
            id: Uuid::new_v4(),
            shift_id: shift.id,
            checkpoint_id: checkpoint.id,
            checkpoint_code: checkpoint.code.clone(),
            guard_id: shift.guard_id.clone(),
            timestamp,
            received_at,
            geo: request.geo,
            note: request.note,
            sla_status,
            source: request.source,
        };

        match store
            .insert_scan_unless_duplicate(&scan, config.duplicate_window())
            .await?
        {
            ScanInsert::Inserted => {}
            ScanInsert::Duplicate(prior) => {
                debug!(
                    shift_id = %shift.id,
                    checkpoint = %checkpoint.code,
                    prior_scan = %prior.id,
                    "Duplicate scan rejected"
                );
                return Err(PatrolError::DuplicateScan(Box::new(prior)));
            }
        }

        if entry.is_none() {
            warn!(
                shift_id = %shift.id,
                checkpoint = %checkpoint.code,
                "Scanned checkpoint is not part of the shift snapshot"
            );
        } else if !store
            .set_progress_scanned(shift.id, checkpoint.id, sla_status.into(), timestamp)
            .await?
        {
            debug!(shift_id = %shift.id, checkpoint = %checkpoint.code, "Progress already scanned");
        }

        info!(
            shift_id = %shift.id,
            guard_id = %shift.guard_id,
            checkpoint = %checkpoint.code,
            sla = sla_status.as_str(),
            source = scan.source.as_str(),
            "Scan recorded"
        );
        self.services
            .emitter
            .emit(PatrolEvent::ScanRecorded { scan: scan.clone() });
        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::registry::{NewCheckpoint, NewZone};
    use crate::store::MemoryStore;
    use crate::types::{ProgressStatus, Shift};
    use crate::Engine;
    use chrono::Duration;
    use std::sync::Arc;

    #[test]
    fn test_classify_boundary() {
        let target = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(classify(target, 60, target + Duration::seconds(60)), SlaStatus::OnTime);
        assert_eq!(classify(target, 60, target + Duration::seconds(61)), SlaStatus::Late);
        assert_eq!(classify(target, 0, target - Duration::hours(1)), SlaStatus::OnTime);
    }

    struct Fixture {
        engine: Engine,
        clock: Arc<ManualClock>,
        shift: Shift,
        other_zone_code: String,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let engine = Engine::builder(Arc::new(MemoryStore::new()))
            .clock(clock.clone())
            .build();
        let zone = engine
            .registry
            .create_zone(NewZone {
                name: "Lobby".to_string(),
                code: "L".to_string(),
            })
            .await
            .unwrap();
        engine
            .registry
            .create_checkpoint(
                zone.id,
                NewCheckpoint {
                    name: "Desk".to_string(),
                    code: "L-DESK".to_string(),
                    order: 1,
                    expected_offset_seconds: 300,
                    grace_seconds: 60,
                },
            )
            .await
            .unwrap();
        let other = engine
            .registry
            .create_zone(NewZone {
                name: "Roof".to_string(),
                code: "R".to_string(),
            })
            .await
            .unwrap();
        engine
            .registry
            .create_checkpoint(
                other.id,
                NewCheckpoint {
                    name: "Hatch".to_string(),
                    code: "R-HATCH".to_string(),
                    order: 1,
                    expected_offset_seconds: 0,
                    grace_seconds: 0,
                },
            )
            .await
            .unwrap();
        let shift = engine.shifts.start(zone.id, "g-1").await.unwrap();
        Fixture {
            engine,
            clock,
            shift,
            other_zone_code: "R-HATCH".to_string(),
        }
    }

    fn code(raw: &str) -> CheckpointRef {
        CheckpointRef::Code(raw.to_string())
    }

    #[tokio::test]
    async fn test_unknown_checkpoint_checked_before_shift() {
        let f = fixture().await;
        let err = f
            .engine
            .scans
            .register(ScanRequest::live(Uuid::new_v4(), code("NOPE")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_CHECKPOINT");

        let err = f
            .engine
            .scans
            .register(ScanRequest::live(Uuid::new_v4(), code("L-DESK")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SHIFT");
    }

    #[tokio::test]
    async fn test_zone_and_guard_mismatch() {
        let f = fixture().await;
        let err = f
            .engine
            .scans
            .register(ScanRequest::live(f.shift.id, code(&f.other_zone_code)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ZONE_MISMATCH");

        let err = f
            .engine
            .scans
            .register(ScanRequest::live(f.shift.id, code("L-DESK")).by_guard("g-2"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SHIFT_MISMATCH");
    }

    #[tokio::test]
    async fn test_late_scan_updates_progress() {
        let f = fixture().await;
        f.clock.advance(Duration::seconds(300 + 61));
        let scan = f
            .engine
            .scans
            .register(ScanRequest::live(f.shift.id, code("L-DESK")).by_guard("g-1"))
            .await
            .unwrap();
        assert_eq!(scan.sla_status, SlaStatus::Late);

        let shift = f.engine.shifts.get(f.shift.id).await.unwrap();
        let entry = &shift.progress[0];
        assert_eq!(entry.status, ProgressStatus::Late);
        assert_eq!(entry.scanned_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn test_duplicate_carries_prior_scan() {
        let f = fixture().await;
        let first = f
            .engine
            .scans
            .register(ScanRequest::live(f.shift.id, code("L-DESK")))
            .await
            .unwrap();
        f.clock.advance(Duration::seconds(19));
        match f
            .engine
            .scans
            .register(ScanRequest::live(f.shift.id, code("L-DESK")))
            .await
        {
            Err(PatrolError::DuplicateScan(prior)) => assert_eq!(prior.id, first.id),
            other => panic!("expected duplicate, got {other:?}"),
        }

        f.clock.advance(Duration::seconds(1));
        assert!(f
            .engine
            .scans
            .register(ScanRequest::live(f.shift.id, code("L-DESK")))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_default_grace_is_a_floor() {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let engine = Engine::builder(Arc::new(MemoryStore::new()))
            .clock(clock.clone())
            .config(crate::PatrolConfig {
                default_grace_seconds: 300,
                ..crate::PatrolConfig::default()
            })
            .build();
        let zone = engine
            .registry
            .create_zone(NewZone {
                name: "Yard".to_string(),
                code: "Y".to_string(),
            })
            .await
            .unwrap();
        engine
            .registry
            .create_checkpoint(
                zone.id,
                NewCheckpoint {
                    name: "Fence".to_string(),
                    code: "Y-FENCE".to_string(),
                    order: 1,
                    expected_offset_seconds: 0,
                    grace_seconds: 10,
                },
            )
            .await
            .unwrap();
        let shift = engine.shifts.start(zone.id, "g-1").await.unwrap();
        clock.advance(Duration::seconds(200));
        let scan = engine
            .scans
            .register(ScanRequest::live(shift.id, code("Y-FENCE")))
            .await
            .unwrap();
        assert_eq!(scan.sla_status, SlaStatus::OnTime);
    }
}
