//! Daily assignment generation.
//!
//! For a given site-local date every guard holding the configured
//! capability is bound to every active round whose plan runs that weekday.
//! Rows are keyed by (date, guard, round) and written with
//! insert-if-absent, so repeated or concurrent runs converge.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::Services;
use crate::error::{PatrolError, Result};
use crate::events::PatrolEvent;
use crate::identity::Guard;
use crate::types::{Assignment, AssignmentPoint, AssignmentStatus, Plan, Round};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    pub date: Option<NaiveDate>,
    /// Guards holding the capability
    pub guards: usize,
    /// Rounds scheduled for the weekday
    pub rounds: usize,
    pub created: usize,
    /// Candidates that already had a row
    pub existing: usize,
    pub failures: usize,
}

pub struct AssignmentGenerator {
    services: Services,
}

impl AssignmentGenerator {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Today in the site's configured UTC offset.
    pub fn today(&self) -> NaiveDate {
        self.services
            .clock
            .now()
            .with_timezone(&self.services.config.local_offset())
            .date_naive()
    }

    /// Generate today and the configured number of following days.
    pub async fn run_horizon(&self) -> Result<Vec<GenerationReport>> {
        let today = self.today();
        let mut reports = Vec::new();
        for day in 0..=self.services.config.assignment_horizon_days {
            reports.push(self.generate(today + Duration::days(i64::from(day))).await?);
        }
        Ok(reports)
    }

    pub async fn generate(&self, date: NaiveDate) -> Result<GenerationReport> {
        let weekday = date.weekday().num_days_from_sunday() as u8;
        let mut report = GenerationReport {
            date: Some(date),
            ..GenerationReport::default()
        };

        let guards = self.eligible_guards(&mut report).await?;
        report.guards = guards.len();

        let scheduled = self.scheduled_rounds(weekday, &mut report).await?;
        report.rounds = scheduled.len();

        for (round, plan, points) in &scheduled {
            for guard in &guards {
                let candidate = Assignment {
                    id: Uuid::new_v4(),
                    date,
                    guard_id: guard.id.clone(),
                    round_id: round.id,
                    plan_id: plan.id,
                    points: points.clone(),
                    start_time: plan.start_time,
                    end_time: plan.end_time,
                    status: AssignmentStatus::Scheduled,
                    created_at: self.services.clock.now(),
                };
                match self
                    .services
                    .store
                    .insert_assignment_if_absent(&candidate)
                    .await
                {
                    Ok((assignment, true)) => {
                        report.created += 1;
                        debug!(
                            assignment_id = %assignment.id,
                            guard_id = %assignment.guard_id,
                            round = %round.name,
                            %date,
                            "Assignment created"
                        );
                        self.services.sink.assignment_created(&assignment, round);
                        self.services
                            .emitter
                            .emit(PatrolEvent::AssignmentCreated { assignment });
                    }
                    Ok((_, false)) => report.existing += 1,
                    Err(e) => {
                        report.failures += 1;
                        warn!(
                            guard_id = %guard.id,
                            round_id = %round.id,
                            error = %e,
                            "Failed to upsert assignment"
                        );
                    }
                }
            }
        }

        if report.created > 0 || report.failures > 0 {
            info!(
                %date,
                guards = report.guards,
                rounds = report.rounds,
                created = report.created,
                existing = report.existing,
                failures = report.failures,
                "Assignments generated"
            );
        }
        Ok(report)
    }

    pub async fn list(&self, date: NaiveDate, guard_id: Option<&str>) -> Result<Vec<Assignment>> {
        Ok(self.services.store.list_assignments(date, guard_id).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Assignment> {
        self.services
            .store
            .get_assignment(id)
            .await?
            .ok_or_else(|| PatrolError::not_found("assignment", id))
    }

    async fn eligible_guards(&self, report: &mut GenerationReport) -> Result<Vec<Guard>> {
        let identity = &self.services.identity;
        let capability = &self.services.config.guard_capability;
        let guards = identity
            .list_active_guards()
            .await
            .map_err(PatrolError::Identity)?;

        let mut eligible = Vec::with_capacity(guards.len());
        for guard in guards {
            match identity.has_capability(&guard.id, capability).await {
                Ok(true) => eligible.push(guard),
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(guard_id = %guard.id, error = %e, "Capability lookup failed");
                }
            }
        }
        Ok(eligible)
    }

    /// Active rounds whose active plan runs on `weekday`, with their point
    /// snapshot resolved once per round.
    async fn scheduled_rounds(
        &self,
        weekday: u8,
        report: &mut GenerationReport,
    ) -> Result<Vec<(Round, Plan, Vec<AssignmentPoint>)>> {
        let store = &self.services.store;
        let mut scheduled = Vec::new();
        for round in store.list_rounds().await? {
            if !round.active {
                continue;
            }
            let plan = match store.get_plan(round.plan_id).await {
                Ok(Some(plan)) if plan.active && plan.runs_on(weekday) => plan,
                Ok(_) => continue,
                Err(e) => {
                    report.failures += 1;
                    warn!(round_id = %round.id, error = %e, "Failed to load plan");
                    continue;
                }
            };
            match self.snapshot(&plan).await {
                Ok(points) => scheduled.push((round, plan, points)),
                Err(e) => {
                    report.failures += 1;
                    warn!(round_id = %round.id, error = %e, "Failed to snapshot plan");
                }
            }
        }
        Ok(scheduled)
    }

    /// Plan checkpoints with overrides resolved. Inactive checkpoints are left out.
    async fn snapshot(&self, plan: &Plan) -> Result<Vec<AssignmentPoint>> {
        let mut points = Vec::with_capacity(plan.checkpoints.len());
        for entry in &plan.checkpoints {
            let Some(checkpoint) = self.services.store.get_checkpoint(entry.checkpoint_id).await?
            else {
                continue;
            };
            if !checkpoint.active {
                continue;
            }
            points.push(AssignmentPoint {
                checkpoint_id: checkpoint.id,
                code: checkpoint.code,
                order: checkpoint.order,
                offset_seconds: entry
                    .offset_seconds
                    .unwrap_or(checkpoint.expected_offset_seconds),
                grace_seconds: entry.grace_seconds.unwrap_or(checkpoint.grace_seconds),
            });
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::{Guard, MockIdentityProvider};
    use crate::registry::{NewCheckpoint, NewPlan, NewRound, NewZone};
    use crate::store::MemoryStore;
    use crate::types::{hhmm, PlanCheckpoint};
    use crate::Engine;
    use chrono::{DateTime, Utc};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn guard(id: &str) -> Guard {
        Guard {
            id: id.to_string(),
            name: id.to_string(),
            active: true,
            capabilities: BTreeSet::from(["guardia".to_string()]),
        }
    }

    // 2023-11-14 is a Tuesday
    fn tuesday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 11, 14).unwrap()
    }

    async fn engine_with(identity: MockIdentityProvider) -> Engine {
        let clock = Arc::new(ManualClock::new(
            DateTime::<Utc>::from_timestamp(1_699_950_000, 0).unwrap(),
        ));
        let engine = Engine::builder(Arc::new(MemoryStore::new()))
            .clock(clock)
            .identity(Arc::new(identity))
            .build();

        let zone = engine
            .registry
            .create_zone(NewZone {
                name: "Campus".to_string(),
                code: "C".to_string(),
            })
            .await
            .unwrap();
        let checkpoint = engine
            .registry
            .create_checkpoint(
                zone.id,
                NewCheckpoint {
                    name: "Library".to_string(),
                    code: "C-LIB".to_string(),
                    order: 1,
                    expected_offset_seconds: 900,
                    grace_seconds: 120,
                },
            )
            .await
            .unwrap();
        let plan = engine
            .registry
            .create_plan(NewPlan {
                name: "Weekday".to_string(),
                zone_id: zone.id,
                days_of_week: BTreeSet::from([1, 2, 3, 4, 5]),
                start_time: hhmm::parse("08:00").unwrap(),
                end_time: hhmm::parse("12:00").unwrap(),
                checkpoints: vec![PlanCheckpoint {
                    checkpoint_id: checkpoint.id,
                    offset_seconds: Some(1800),
                    grace_seconds: None,
                }],
                missing_threshold_seconds: None,
            })
            .await
            .unwrap();
        engine
            .registry
            .create_round(NewRound {
                name: "Morning".to_string(),
                plan_id: plan.id,
            })
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_generate_is_idempotent() {
        let mut identity = MockIdentityProvider::new();
        identity
            .expect_list_active_guards()
            .returning(|| Ok(vec![guard("g-1"), guard("g-2")]));
        identity
            .expect_has_capability()
            .returning(|id, _| Ok(id != "g-2"));
        let engine = engine_with(identity).await;

        let first = engine.assignments.generate(tuesday()).await.unwrap();
        assert_eq!(first.guards, 1);
        assert_eq!(first.created, 1);

        let second = engine.assignments.generate(tuesday()).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.existing, 1);

        let rows = engine.assignments.list(tuesday(), Some("g-1")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].points[0].offset_seconds, 1800);
        assert_eq!(rows[0].points[0].grace_seconds, 120);
    }

    #[tokio::test]
    async fn test_plan_not_scheduled_on_weekend() {
        let mut identity = MockIdentityProvider::new();
        identity
            .expect_list_active_guards()
            .returning(|| Ok(vec![guard("g-1")]));
        identity.expect_has_capability().returning(|_, _| Ok(true));
        let engine = engine_with(identity).await;

        let sunday = NaiveDate::from_ymd_opt(2023, 11, 19).unwrap();
        let report = engine.assignments.generate(sunday).await.unwrap();
        assert_eq!(report.rounds, 0);
        assert_eq!(report.created, 0);
    }

    #[tokio::test]
    async fn test_capability_failure_is_counted() {
        let mut identity = MockIdentityProvider::new();
        identity
            .expect_list_active_guards()
            .returning(|| Ok(vec![guard("g-1"), guard("g-2")]));
        identity.expect_has_capability().returning(|id, _| {
            if id == "g-1" {
                Err("directory timeout".to_string())
            } else {
                Ok(true)
            }
        });
        let engine = engine_with(identity).await;

        let report = engine.assignments.generate(tuesday()).await.unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn test_horizon_covers_today_and_tomorrow() {
        let mut identity = MockIdentityProvider::new();
        identity
            .expect_list_active_guards()
            .returning(|| Ok(vec![guard("g-1")]));
        identity.expect_has_capability().returning(|_, _| Ok(true));
        let engine = engine_with(identity).await;

        // Clock sits on Tuesday 2023-11-14 UTC
        let reports = engine.assignments.run_horizon().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].date, Some(tuesday()));
        assert_eq!(reports.iter().map(|r| r.created).sum::<usize>(), 2);
    }
}
