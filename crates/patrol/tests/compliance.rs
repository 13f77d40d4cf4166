//! End-to-end compliance behaviour on the memory store.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

use patrol::offline::{OfflineBatch, OfflineEvent};
use patrol::registry::{NewCheckpoint, NewPlan, NewRound, NewZone};
use patrol::scan::ScanRequest;
use patrol::types::{
    hhmm, AlertKind, AlertQuery, AlertStatus, CheckpointRef, PlanCheckpoint, ProgressStatus,
    Shift, SlaStatus, Zone,
};
use patrol::{
    BroadcastPublisher, Engine, Guard, ManualClock, MemoryStore, PatrolError, PatrolEvent,
    StaticIdentityProvider,
};

const START: i64 = 1_700_000_000;

struct Harness {
    engine: Engine,
    clock: Arc<ManualClock>,
    bus: BroadcastPublisher,
    zone: Zone,
}

impl Harness {
    async fn new() -> Self {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(START, 0).unwrap(),
        ));
        let bus = BroadcastPublisher::new(64);
        let identity = StaticIdentityProvider::new(vec![
            Guard {
                id: "g-1".to_string(),
                name: "Ana".to_string(),
                active: true,
                capabilities: BTreeSet::from(["guardia".to_string()]),
            },
            Guard {
                id: "sup-1".to_string(),
                name: "Luis".to_string(),
                active: true,
                capabilities: BTreeSet::from(["supervisor".to_string()]),
            },
        ]);
        let engine = Engine::builder(Arc::new(MemoryStore::new()))
            .clock(clock.clone())
            .publisher(Arc::new(bus.clone()))
            .identity(Arc::new(identity))
            .build();

        let zone = engine
            .registry
            .create_zone(NewZone {
                name: "Plant".to_string(),
                code: "P".to_string(),
            })
            .await
            .unwrap();
        // P-1 due at +5 min with 1 min grace, P-2 .. P-4 every 10 min after
        for (order, offset, grace) in [(1, 300, 60), (2, 900, 60), (3, 1500, 60), (4, 2100, 60)] {
            engine
                .registry
                .create_checkpoint(
                    zone.id,
                    NewCheckpoint {
                        name: format!("Point {order}"),
                        code: format!("P-{order}"),
                        order,
                        expected_offset_seconds: offset,
                        grace_seconds: grace,
                    },
                )
                .await
                .unwrap();
        }

        Self {
            engine,
            clock,
            bus,
            zone,
        }
    }

    fn start(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(START, 0).unwrap()
    }

    async fn shift(&self) -> Shift {
        self.engine.shifts.start(self.zone.id, "g-1").await.unwrap()
    }

    async fn scan(&self, shift: &Shift, code: &str) -> patrol::Result<patrol::types::ScanEvent> {
        self.engine
            .scans
            .register(
                ScanRequest::live(shift.id, CheckpointRef::Code(code.to_string())).by_guard("g-1"),
            )
            .await
    }
}

#[tokio::test]
async fn anti_duplicate_window() {
    let h = Harness::new().await;
    let shift = h.shift().await;

    let first = h.scan(&shift, "P-1").await.unwrap();
    h.clock.advance(Duration::seconds(10));
    match h.scan(&shift, "P-1").await {
        Err(PatrolError::DuplicateScan(prior)) => assert_eq!(prior.id, first.id),
        other => panic!("expected DUPLICATE_SCAN, got {other:?}"),
    }

    // Other checkpoints are unaffected
    assert!(h.scan(&shift, "P-2").await.is_ok());

    h.clock.advance(Duration::seconds(10));
    assert!(h.scan(&shift, "P-1").await.is_ok(), "20s apart is not a duplicate");

    let scans = h.engine.services().store.list_scans(shift.id).await.unwrap();
    assert_eq!(scans.len(), 3);
}

#[tokio::test]
async fn sla_boundary() {
    let h = Harness::new().await;
    let shift = h.shift().await;

    // target + grace exactly is still on time
    h.clock.set(h.start() + Duration::seconds(300 + 60));
    let on_time = h.scan(&shift, "P-1").await.unwrap();
    assert_eq!(on_time.sla_status, SlaStatus::OnTime);

    // one second past target + grace is late
    h.clock.set(h.start() + Duration::seconds(900 + 61));
    let late = h.scan(&shift, "P-2").await.unwrap();
    assert_eq!(late.sla_status, SlaStatus::Late);

    let shift = h.engine.shifts.get(shift.id).await.unwrap();
    assert_eq!(shift.progress[0].status, ProgressStatus::Ok);
    assert_eq!(shift.progress[1].status, ProgressStatus::Late);
}

#[tokio::test]
async fn missed_boundary() {
    let h = Harness::new().await;
    let shift = h.shift().await;

    // P-1 expected at +300, default threshold 600
    h.clock.set(h.start() + Duration::seconds(300 + 600));
    let report = h.engine.reconciler.run().await.unwrap();
    assert_eq!(report.missed, 0);

    h.clock.advance(Duration::seconds(1));
    let report = h.engine.reconciler.run().await.unwrap();
    assert_eq!(report.missed, 1);

    let shift = h.engine.shifts.get(shift.id).await.unwrap();
    assert_eq!(shift.progress[0].status, ProgressStatus::Missed);
    assert_eq!(shift.progress[1].status, ProgressStatus::Pending);
}

#[tokio::test]
async fn plan_threshold_overrides_default() {
    let h = Harness::new().await;
    let checkpoints = h.engine.registry.list_checkpoints(h.zone.id).await.unwrap();
    let plan = h
        .engine
        .registry
        .create_plan(NewPlan {
            name: "Tight".to_string(),
            zone_id: h.zone.id,
            days_of_week: (0..=6).collect(),
            start_time: hhmm::parse("22:00").unwrap(),
            end_time: hhmm::parse("06:00").unwrap(),
            checkpoints: vec![PlanCheckpoint {
                checkpoint_id: checkpoints[0].id,
                offset_seconds: Some(120),
                grace_seconds: Some(0),
            }],
            missing_threshold_seconds: Some(60),
        })
        .await
        .unwrap();
    let round = h
        .engine
        .registry
        .create_round(NewRound {
            name: "Night".to_string(),
            plan_id: plan.id,
        })
        .await
        .unwrap();

    let date = h.engine.assignments.today();
    h.engine.assignments.generate(date).await.unwrap();
    let assignment = h
        .engine
        .assignments
        .list(date, Some("g-1"))
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.round_id == round.id)
        .unwrap();

    let shift = h
        .engine
        .shifts
        .start_assignment(assignment.id, "g-1")
        .await
        .unwrap();
    assert_eq!(shift.progress.len(), 1);
    assert_eq!(shift.plan_id, Some(plan.id));

    h.clock.advance(Duration::seconds(120 + 61));
    let report = h.engine.reconciler.run().await.unwrap();
    assert_eq!(report.missed, 1);
    assert_eq!(report.alerts_opened, 1);
}

#[tokio::test]
async fn alert_dedup_across_runs() {
    let h = Harness::new().await;
    let mut events = h.bus.subscribe();
    let shift = h.shift().await;

    h.clock.set(h.start() + Duration::seconds(300 + 601));
    let first = h.engine.reconciler.run().await.unwrap();
    let second = h.engine.reconciler.run().await.unwrap();
    assert_eq!(first.alerts_opened, 1);
    assert_eq!(second.alerts_opened, 0);
    assert_eq!(second.missed, 0);

    let page = h
        .engine
        .alerts
        .list(&AlertQuery {
            shift_id: Some(shift.id),
            kind: Some(AlertKind::MissedCheckpoint),
            status: Some(AlertStatus::Open),
            limit: 50,
            ..AlertQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);

    // shift.started then exactly one alert.opened
    let mut opened = 0;
    while let Ok(Ok(event)) =
        tokio::time::timeout(std::time::Duration::from_millis(100), events.recv()).await
    {
        if matches!(event, PatrolEvent::AlertOpened { .. }) {
            opened += 1;
        }
    }
    assert_eq!(opened, 1);
}

#[tokio::test]
async fn acknowledged_alert_still_dedups() {
    let h = Harness::new().await;
    let shift = h.shift().await;

    h.clock.set(h.start() + Duration::seconds(300 + 601));
    h.engine.reconciler.run().await.unwrap();
    let alert = h
        .engine
        .alerts
        .list(&AlertQuery {
            shift_id: Some(shift.id),
            limit: 50,
            ..AlertQuery::default()
        })
        .await
        .unwrap()
        .items
        .remove(0);
    h.engine.alerts.ack(alert.id, "sup-1").await.unwrap();

    h.clock.advance(Duration::minutes(5));
    let report = h.engine.reconciler.run().await.unwrap();
    assert_eq!(report.alerts_opened, 0);
}

#[tokio::test]
async fn late_scan_auto_closes_alert() {
    let h = Harness::new().await;
    let shift = h.shift().await;

    h.clock.set(h.start() + Duration::seconds(300 + 601));
    h.engine.reconciler.run().await.unwrap();

    let scan = h.scan(&shift, "P-1").await.unwrap();
    assert_eq!(scan.sla_status, SlaStatus::Late);

    let report = h.engine.reconciler.run().await.unwrap();
    assert_eq!(report.alerts_closed, 1);

    let page = h
        .engine
        .alerts
        .list(&AlertQuery {
            shift_id: Some(shift.id),
            limit: 50,
            ..AlertQuery::default()
        })
        .await
        .unwrap();
    let alert = &page.items[0];
    assert_eq!(alert.status, AlertStatus::Closed);
    assert_eq!(alert.closed.as_ref().unwrap().by, "system");

    // Nothing left to do
    assert!(h.engine.reconciler.run().await.unwrap().is_quiet());
}

#[tokio::test]
async fn assignment_generation_is_idempotent() {
    let h = Harness::new().await;
    let checkpoints = h.engine.registry.list_checkpoints(h.zone.id).await.unwrap();
    let plan = h
        .engine
        .registry
        .create_plan(NewPlan {
            name: "Every day".to_string(),
            zone_id: h.zone.id,
            days_of_week: (0..=6).collect(),
            start_time: hhmm::parse("08:00").unwrap(),
            end_time: hhmm::parse("16:00").unwrap(),
            checkpoints: checkpoints
                .iter()
                .map(|c| PlanCheckpoint {
                    checkpoint_id: c.id,
                    offset_seconds: None,
                    grace_seconds: None,
                })
                .collect(),
            missing_threshold_seconds: None,
        })
        .await
        .unwrap();
    h.engine
        .registry
        .create_round(NewRound {
            name: "Day".to_string(),
            plan_id: plan.id,
        })
        .await
        .unwrap();

    let date = NaiveDate::from_ymd_opt(2023, 11, 15).unwrap();
    let (a, b) = tokio::join!(
        h.engine.assignments.generate(date),
        h.engine.assignments.generate(date)
    );
    assert_eq!(a.unwrap().created + b.unwrap().created, 1);

    let third = h.engine.assignments.generate(date).await.unwrap();
    assert_eq!(third.created, 0);
    assert_eq!(third.existing, 1);

    // Only the guard holding the capability is assigned
    let rows = h.engine.assignments.list(date, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].guard_id, "g-1");
    assert_eq!(rows[0].points.len(), 4);
}

#[tokio::test]
async fn offline_partial_success() {
    let h = Harness::new().await;
    let shift = h.shift().await;
    h.clock.advance(Duration::hours(2));

    let at = |secs: i64| h.start() + Duration::seconds(secs);
    let events = vec![
        OfflineEvent {
            shift_id: Some(shift.id),
            checkpoint_ref: "P-1".to_string(),
            geo: None,
            note: None,
            timestamp: at(200),
        },
        OfflineEvent {
            shift_id: Some(shift.id),
            checkpoint_ref: "P-2".to_string(),
            geo: None,
            note: None,
            timestamp: at(800),
        },
        OfflineEvent {
            shift_id: Some(shift.id),
            checkpoint_ref: "P-404".to_string(),
            geo: None,
            note: None,
            timestamp: at(1000),
        },
        OfflineEvent {
            shift_id: None,
            checkpoint_ref: "P-3".to_string(),
            geo: None,
            note: None,
            timestamp: at(1400),
        },
        OfflineEvent {
            shift_id: Some(shift.id),
            checkpoint_ref: "P-4".to_string(),
            geo: None,
            note: Some("door ajar".to_string()),
            timestamp: at(2300),
        },
    ];

    let report = h
        .engine
        .offline
        .sync(
            "g-1",
            OfflineBatch {
                events,
                ..OfflineBatch::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.saved.marks, 4);
    assert_eq!(report.saved.duplicates, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].index, 2);
    assert_eq!(report.errors[0].code, "UNKNOWN_CHECKPOINT");

    let scans = h.engine.services().store.list_scans(shift.id).await.unwrap();
    let slas: Vec<SlaStatus> = scans.iter().map(|s| s.sla_status).collect();
    assert_eq!(
        slas,
        [SlaStatus::OnTime, SlaStatus::OnTime, SlaStatus::OnTime, SlaStatus::Late]
    );
}

#[tokio::test]
async fn end_shift_is_idempotent() {
    let h = Harness::new().await;
    let shift = h.shift().await;

    h.clock.advance(Duration::seconds(310));
    h.scan(&shift, "P-1").await.unwrap();
    h.clock.advance(Duration::hours(1));

    let first = h.engine.shifts.end(shift.id).await.unwrap();
    h.clock.advance(Duration::minutes(30));
    let second = h.engine.shifts.end(shift.id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.expected, 4);
    assert_eq!(first.scanned.len(), 1);
    assert_eq!(first.missed.len(), 3);
    assert_eq!(first.on_time, 1);

    // Summary-only: stored progress was not rewritten to missed
    let stored = h.engine.shifts.get(shift.id).await.unwrap();
    assert_eq!(stored.progress[1].status, ProgressStatus::Pending);

    // Scans against an ended shift are refused
    let err = h.scan(&shift, "P-2").await.unwrap_err();
    assert_eq!(err.code(), "INVALID_SHIFT");
}

#[tokio::test]
async fn running_shift_ignores_plan_edits() {
    let h = Harness::new().await;
    let checkpoints = h.engine.registry.list_checkpoints(h.zone.id).await.unwrap();
    let plan = h
        .engine
        .registry
        .create_plan(NewPlan {
            name: "Snapshot".to_string(),
            zone_id: h.zone.id,
            days_of_week: (0..=6).collect(),
            start_time: hhmm::parse("00:00").unwrap(),
            end_time: hhmm::parse("23:59").unwrap(),
            checkpoints: vec![PlanCheckpoint {
                checkpoint_id: checkpoints[0].id,
                offset_seconds: Some(600),
                grace_seconds: Some(30),
            }],
            missing_threshold_seconds: None,
        })
        .await
        .unwrap();
    h.engine
        .registry
        .create_round(NewRound {
            name: "All day".to_string(),
            plan_id: plan.id,
        })
        .await
        .unwrap();
    let date = h.engine.assignments.today();
    h.engine.assignments.generate(date).await.unwrap();
    let assignment = h.engine.assignments.list(date, Some("g-1")).await.unwrap().remove(0);
    let shift = h
        .engine
        .shifts
        .start_assignment(assignment.id, "g-1")
        .await
        .unwrap();

    h.engine
        .registry
        .update_plan(
            plan.id,
            patrol::registry::PlanPatch {
                checkpoints: Some(vec![PlanCheckpoint {
                    checkpoint_id: checkpoints[0].id,
                    offset_seconds: Some(60),
                    grace_seconds: Some(0),
                }]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Judged against the snapshot (600s + 30s grace), not the edited plan
    h.clock.advance(Duration::seconds(620));
    let scan = h.scan(&shift, "P-1").await.unwrap();
    assert_eq!(scan.sla_status, SlaStatus::OnTime);

    // Plan is in use by the running shift
    let err = h.engine.registry.delete_plan(plan.id).await.unwrap_err();
    assert_eq!(err.code(), "IN_USE");
}
