//! Zone, checkpoint, plan and round registry.
//!
//! Topology is never hard-deleted: checkpoints and plans are deactivated,
//! and only once nothing active depends on them.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::Services;
use crate::error::{PatrolError, Result};
use crate::store::StoreError;
use crate::types::{hhmm, Checkpoint, CheckpointRef, Plan, PlanCheckpoint, Round, ShiftStatus, Zone};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewZone {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCheckpoint {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub expected_offset_seconds: i64,
    #[serde(default)]
    pub grace_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlan {
    pub name: String,
    pub zone_id: Uuid,
    pub days_of_week: BTreeSet<u8>,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    #[serde(default)]
    pub checkpoints: Vec<PlanCheckpoint>,
    #[serde(default)]
    pub missing_threshold_seconds: Option<i64>,
}

/// Partial plan update. Omitted fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPatch {
    pub name: Option<String>,
    pub days_of_week: Option<BTreeSet<u8>>,
    #[serde(default, with = "opt_hhmm")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, with = "opt_hhmm")]
    pub end_time: Option<NaiveTime>,
    pub checkpoints: Option<Vec<PlanCheckpoint>>,
    /// `null` clears the override back to the configured default
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub missing_threshold_seconds: Option<Option<i64>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRound {
    pub name: String,
    pub plan_id: Uuid,
}

/// Topology management.
#[derive(Clone)]
pub struct Registry {
    services: Services,
}

impl Registry {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    // ------------------------------------------------------------------ zones

    pub async fn create_zone(&self, input: NewZone) -> Result<Zone> {
        let name = required("name", &input.name)?;
        let code = required("code", &input.code)?;
        let zone = Zone {
            id: Uuid::new_v4(),
            name,
            code,
            active: true,
            created_at: self.services.clock.now(),
        };
        self.services
            .store
            .insert_zone(&zone)
            .await
            .map_err(|e| taken("ZONE_CODE_TAKEN", e))?;
        info!(zone_id = %zone.id, code = %zone.code, "Zone created");
        Ok(zone)
    }

    pub async fn list_zones(&self) -> Result<Vec<Zone>> {
        Ok(self.services.store.list_zones().await?)
    }

    pub async fn get_zone(&self, id: Uuid) -> Result<Zone> {
        self.services
            .store
            .get_zone(id)
            .await?
            .ok_or_else(|| PatrolError::not_found("zone", id))
    }

    pub async fn set_zone_active(&self, id: Uuid, active: bool) -> Result<Zone> {
        if !self.services.store.set_zone_active(id, active).await? {
            return Err(PatrolError::not_found("zone", id));
        }
        info!(zone_id = %id, active, "Zone activation changed");
        self.get_zone(id).await
    }

    // ------------------------------------------------------------ checkpoints

    pub async fn create_checkpoint(&self, zone_id: Uuid, input: NewCheckpoint) -> Result<Checkpoint> {
        self.get_zone(zone_id).await?;
        let name = required("name", &input.name)?;
        let code = required("code", &input.code)?;
        if input.expected_offset_seconds < 0 {
            return Err(PatrolError::validation("expectedOffsetSeconds must not be negative"));
        }
        if input.grace_seconds < 0 {
            return Err(PatrolError::validation("graceSeconds must not be negative"));
        }

        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            zone_id,
            name,
            code,
            order: input.order,
            expected_offset_seconds: input.expected_offset_seconds,
            grace_seconds: input.grace_seconds,
            active: true,
            created_at: self.services.clock.now(),
        };
        self.services
            .store
            .insert_checkpoint(&checkpoint)
            .await
            .map_err(|e| taken("CHECKPOINT_CODE_TAKEN", e))?;
        info!(
            checkpoint_id = %checkpoint.id,
            zone_id = %zone_id,
            code = %checkpoint.code,
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Every checkpoint of the zone, inactive ones included, in route order.
    pub async fn list_checkpoints(&self, zone_id: Uuid) -> Result<Vec<Checkpoint>> {
        self.get_zone(zone_id).await?;
        Ok(self.services.store.list_checkpoints(zone_id).await?)
    }

    pub async fn get_checkpoint(&self, id: Uuid) -> Result<Checkpoint> {
        self.services
            .store
            .get_checkpoint(id)
            .await?
            .ok_or_else(|| PatrolError::not_found("checkpoint", id))
    }

    /// Resolve an id or scan token to an active checkpoint.
    pub async fn resolve_checkpoint(&self, reference: &CheckpointRef) -> Result<Checkpoint> {
        let found = match reference {
            CheckpointRef::Id(id) => self.services.store.get_checkpoint(*id).await?,
            CheckpointRef::Code(code) => self.services.store.find_checkpoint_by_code(code).await?,
        };
        match found {
            Some(checkpoint) if checkpoint.active => Ok(checkpoint),
            _ => Err(PatrolError::UnknownCheckpoint(match reference {
                CheckpointRef::Id(id) => id.to_string(),
                CheckpointRef::Code(code) => code.clone(),
            })),
        }
    }

    pub async fn deactivate_checkpoint(&self, id: Uuid) -> Result<Checkpoint> {
        let mut checkpoint = self.get_checkpoint(id).await?;
        if !checkpoint.active {
            return Ok(checkpoint);
        }

        let store = &self.services.store;
        let in_active_shift = store
            .list_shifts(Some(ShiftStatus::Active))
            .await?
            .iter()
            .any(|shift| shift.progress_for(id).is_some());
        if in_active_shift {
            return Err(PatrolError::conflict(
                "IN_USE",
                format!("checkpoint {} is part of an active shift", checkpoint.code),
            ));
        }
        let in_active_plan = store
            .list_plans()
            .await?
            .iter()
            .any(|plan| plan.active && plan.entry_for(id).is_some());
        if in_active_plan {
            return Err(PatrolError::conflict(
                "IN_USE",
                format!("checkpoint {} is listed by an active plan", checkpoint.code),
            ));
        }

        store.set_checkpoint_active(id, false).await?;
        checkpoint.active = false;
        info!(checkpoint_id = %id, code = %checkpoint.code, "Checkpoint deactivated");
        Ok(checkpoint)
    }

    // ------------------------------------------------------------------ plans

    pub async fn create_plan(&self, input: NewPlan) -> Result<Plan> {
        let plan = Plan {
            id: Uuid::new_v4(),
            name: required("name", &input.name)?,
            zone_id: input.zone_id,
            days_of_week: input.days_of_week,
            start_time: input.start_time,
            end_time: input.end_time,
            checkpoints: input.checkpoints,
            missing_threshold_seconds: input.missing_threshold_seconds,
            active: true,
            updated_at: self.services.clock.now(),
        };
        self.validate_plan(&plan).await?;
        self.services.store.insert_plan(&plan).await?;
        info!(plan_id = %plan.id, name = %plan.name, "Plan created");
        Ok(plan)
    }

    /// Apply a partial update. The merged plan is validated as a whole.
    pub async fn update_plan(&self, id: Uuid, patch: PlanPatch) -> Result<Plan> {
        let mut plan = self.get_plan(id).await?;
        if let Some(name) = patch.name {
            plan.name = required("name", &name)?;
        }
        if let Some(days) = patch.days_of_week {
            plan.days_of_week = days;
        }
        if let Some(start) = patch.start_time {
            plan.start_time = start;
        }
        if let Some(end) = patch.end_time {
            plan.end_time = end;
        }
        if let Some(checkpoints) = patch.checkpoints {
            plan.checkpoints = checkpoints;
        }
        if let Some(threshold) = patch.missing_threshold_seconds {
            plan.missing_threshold_seconds = threshold;
        }
        if let Some(active) = patch.active {
            plan.active = active;
        }
        plan.updated_at = self.services.clock.now();

        self.validate_plan(&plan).await?;
        if !self.services.store.update_plan(&plan).await? {
            return Err(PatrolError::not_found("plan", id));
        }
        debug!(plan_id = %id, "Plan updated");
        Ok(plan)
    }

    pub async fn get_plan(&self, id: Uuid) -> Result<Plan> {
        self.services
            .store
            .get_plan(id)
            .await?
            .ok_or_else(|| PatrolError::not_found("plan", id))
    }

    pub async fn list_plans(&self) -> Result<Vec<Plan>> {
        Ok(self.services.store.list_plans().await?)
    }

    /// Soft delete: the plan stays readable but stops generating work.
    pub async fn delete_plan(&self, id: Uuid) -> Result<Plan> {
        let mut plan = self.get_plan(id).await?;
        let in_use = self
            .services
            .store
            .list_shifts(Some(ShiftStatus::Active))
            .await?
            .iter()
            .any(|shift| shift.plan_id == Some(id));
        if in_use {
            return Err(PatrolError::conflict(
                "IN_USE",
                format!("plan {} has an active shift", plan.name),
            ));
        }
        if plan.active {
            plan.active = false;
            plan.updated_at = self.services.clock.now();
            self.services.store.update_plan(&plan).await?;
            info!(plan_id = %id, "Plan disabled");
        }
        Ok(plan)
    }

    async fn validate_plan(&self, plan: &Plan) -> Result<()> {
        if plan.start_time == plan.end_time {
            return Err(PatrolError::validation("startTime and endTime must differ"));
        }
        if let Some(day) = plan.days_of_week.iter().find(|d| **d > 6) {
            return Err(PatrolError::validation(format!(
                "daysOfWeek entries must be 0-6, got {day}"
            )));
        }
        if plan.missing_threshold_seconds.is_some_and(|t| t < 0) {
            return Err(PatrolError::validation(
                "missingThresholdSeconds must not be negative",
            ));
        }

        let zone = self.get_zone(plan.zone_id).await?;
        let mut seen = HashSet::new();
        for entry in &plan.checkpoints {
            if !seen.insert(entry.checkpoint_id) {
                return Err(PatrolError::validation(format!(
                    "checkpoint {} listed twice",
                    entry.checkpoint_id
                )));
            }
            if entry.offset_seconds.is_some_and(|o| o < 0) || entry.grace_seconds.is_some_and(|g| g < 0) {
                return Err(PatrolError::validation(format!(
                    "overrides for checkpoint {} must not be negative",
                    entry.checkpoint_id
                )));
            }
            let checkpoint = self
                .services
                .store
                .get_checkpoint(entry.checkpoint_id)
                .await?
                .ok_or_else(|| {
                    PatrolError::validation(format!("checkpoint {} does not exist", entry.checkpoint_id))
                })?;
            if checkpoint.zone_id != zone.id {
                return Err(PatrolError::validation(format!(
                    "checkpoint {} belongs to another zone",
                    checkpoint.code
                )));
            }
        }
        Ok(())
    }

    // ----------------------------------------------------------------- rounds

    pub async fn create_round(&self, input: NewRound) -> Result<Round> {
        let name = required("name", &input.name)?;
        let plan = self.get_plan(input.plan_id).await?;
        let round = Round {
            id: Uuid::new_v4(),
            name,
            zone_id: plan.zone_id,
            plan_id: plan.id,
            active: true,
        };
        self.services.store.insert_round(&round).await?;
        info!(round_id = %round.id, plan_id = %plan.id, "Round created");
        Ok(round)
    }

    pub async fn list_rounds(&self) -> Result<Vec<Round>> {
        Ok(self.services.store.list_rounds().await?)
    }
}

fn required(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PatrolError::validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn taken(code: &'static str, err: StoreError) -> PatrolError {
    match err {
        StoreError::Conflict(message) => PatrolError::conflict(code, message),
        other => other.into(),
    }
}

/// `Option<NaiveTime>` as `HH:MM`.
mod opt_hhmm {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error> {
        match time {
            Some(t) => super::hhmm::serialize(t, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<NaiveTime>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| super::hhmm::parse(&raw).map_err(de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::Engine;
    use std::sync::Arc;

    fn engine() -> Engine {
        Engine::builder(Arc::new(MemoryStore::new())).build()
    }

    fn time(raw: &str) -> NaiveTime {
        hhmm::parse(raw).unwrap()
    }

    async fn zone_with_checkpoint(engine: &Engine) -> (Zone, Checkpoint) {
        let zone = engine
            .registry
            .create_zone(NewZone {
                name: "North".to_string(),
                code: "N".to_string(),
            })
            .await
            .unwrap();
        let checkpoint = engine
            .registry
            .create_checkpoint(
                zone.id,
                NewCheckpoint {
                    name: "Gate".to_string(),
                    code: "N-GATE".to_string(),
                    order: 1,
                    expected_offset_seconds: 300,
                    grace_seconds: 60,
                },
            )
            .await
            .unwrap();
        (zone, checkpoint)
    }

    #[tokio::test]
    async fn test_duplicate_codes_conflict() {
        let engine = engine();
        let (zone, _) = zone_with_checkpoint(&engine).await;

        let err = engine
            .registry
            .create_zone(NewZone {
                name: "Other".to_string(),
                code: "N".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ZONE_CODE_TAKEN");

        let err = engine
            .registry
            .create_checkpoint(
                zone.id,
                NewCheckpoint {
                    name: "Gate again".to_string(),
                    code: "N-GATE".to_string(),
                    order: 2,
                    expected_offset_seconds: 0,
                    grace_seconds: 0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CHECKPOINT_CODE_TAKEN");
    }

    #[tokio::test]
    async fn test_checkpoint_rejects_negative_grace() {
        let engine = engine();
        let (zone, _) = zone_with_checkpoint(&engine).await;
        let err = engine
            .registry
            .create_checkpoint(
                zone.id,
                NewCheckpoint {
                    name: "Dock".to_string(),
                    code: "N-DOCK".to_string(),
                    order: 2,
                    expected_offset_seconds: 0,
                    grace_seconds: -5,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_resolve_by_code_and_id() {
        let engine = engine();
        let (_, checkpoint) = zone_with_checkpoint(&engine).await;

        let by_code = engine
            .registry
            .resolve_checkpoint(&CheckpointRef::Code("N-GATE".to_string()))
            .await
            .unwrap();
        assert_eq!(by_code.id, checkpoint.id);

        let by_id = engine
            .registry
            .resolve_checkpoint(&CheckpointRef::Id(checkpoint.id))
            .await
            .unwrap();
        assert_eq!(by_id.code, "N-GATE");

        let err = engine
            .registry
            .resolve_checkpoint(&CheckpointRef::Code("NOPE".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_CHECKPOINT");
    }

    #[tokio::test]
    async fn test_plan_update_revalidates_times() {
        let engine = engine();
        let (zone, checkpoint) = zone_with_checkpoint(&engine).await;
        let plan = engine
            .registry
            .create_plan(NewPlan {
                name: "Night".to_string(),
                zone_id: zone.id,
                days_of_week: BTreeSet::from([1, 2, 3]),
                start_time: time("22:00"),
                end_time: time("06:00"),
                checkpoints: vec![PlanCheckpoint {
                    checkpoint_id: checkpoint.id,
                    offset_seconds: Some(600),
                    grace_seconds: None,
                }],
                missing_threshold_seconds: None,
            })
            .await
            .unwrap();

        // Only endTime supplied; must be compared with the stored startTime
        let err = engine
            .registry
            .update_plan(
                plan.id,
                PlanPatch {
                    end_time: Some(time("22:00")),
                    ..PlanPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        let updated = engine
            .registry
            .update_plan(
                plan.id,
                PlanPatch {
                    days_of_week: Some(BTreeSet::from([0, 6])),
                    ..PlanPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.runs_on(0));
        assert_eq!(updated.start_time, time("22:00"));
    }

    #[tokio::test]
    async fn test_plan_rejects_foreign_checkpoint_and_bad_day() {
        let engine = engine();
        let (zone, _) = zone_with_checkpoint(&engine).await;
        let other = engine
            .registry
            .create_zone(NewZone {
                name: "South".to_string(),
                code: "S".to_string(),
            })
            .await
            .unwrap();
        let foreign = engine
            .registry
            .create_checkpoint(
                other.id,
                NewCheckpoint {
                    name: "Pier".to_string(),
                    code: "S-PIER".to_string(),
                    order: 1,
                    expected_offset_seconds: 0,
                    grace_seconds: 0,
                },
            )
            .await
            .unwrap();

        let base = NewPlan {
            name: "Day".to_string(),
            zone_id: zone.id,
            days_of_week: BTreeSet::from([1]),
            start_time: time("08:00"),
            end_time: time("16:00"),
            checkpoints: vec![PlanCheckpoint {
                checkpoint_id: foreign.id,
                offset_seconds: None,
                grace_seconds: None,
            }],
            missing_threshold_seconds: None,
        };
        assert!(engine.registry.create_plan(base.clone()).await.is_err());

        let bad_day = NewPlan {
            days_of_week: BTreeSet::from([7]),
            checkpoints: vec![],
            ..base
        };
        assert_eq!(
            engine.registry.create_plan(bad_day).await.unwrap_err().code(),
            "VALIDATION"
        );
    }

    #[tokio::test]
    async fn test_deactivate_checkpoint_listed_by_active_plan() {
        let engine = engine();
        let (zone, checkpoint) = zone_with_checkpoint(&engine).await;
        let plan = engine
            .registry
            .create_plan(NewPlan {
                name: "Day".to_string(),
                zone_id: zone.id,
                days_of_week: BTreeSet::from([1]),
                start_time: time("08:00"),
                end_time: time("16:00"),
                checkpoints: vec![PlanCheckpoint {
                    checkpoint_id: checkpoint.id,
                    offset_seconds: None,
                    grace_seconds: None,
                }],
                missing_threshold_seconds: None,
            })
            .await
            .unwrap();

        let err = engine
            .registry
            .deactivate_checkpoint(checkpoint.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IN_USE");

        engine.registry.delete_plan(plan.id).await.unwrap();
        let deactivated = engine
            .registry
            .deactivate_checkpoint(checkpoint.id)
            .await
            .unwrap();
        assert!(!deactivated.active);

        // Still listed, never hard-deleted
        let listed = engine.registry.list_checkpoints(zone.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].active);
    }

    #[tokio::test]
    async fn test_round_takes_zone_from_plan() {
        let engine = engine();
        let (zone, _) = zone_with_checkpoint(&engine).await;
        let plan = engine
            .registry
            .create_plan(NewPlan {
                name: "Day".to_string(),
                zone_id: zone.id,
                days_of_week: BTreeSet::from([1]),
                start_time: time("08:00"),
                end_time: time("16:00"),
                checkpoints: vec![],
                missing_threshold_seconds: Some(300),
            })
            .await
            .unwrap();
        let round = engine
            .registry
            .create_round(NewRound {
                name: "Perimeter".to_string(),
                plan_id: plan.id,
            })
            .await
            .unwrap();
        assert_eq!(round.zone_id, zone.id);
        assert_eq!(engine.registry.list_rounds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_plan_patch_clears_threshold_with_null() {
        let engine = engine();
        let (zone, _) = zone_with_checkpoint(&engine).await;
        let plan = engine
            .registry
            .create_plan(NewPlan {
                name: "Day".to_string(),
                zone_id: zone.id,
                days_of_week: BTreeSet::from([1]),
                start_time: time("08:00"),
                end_time: time("16:00"),
                checkpoints: vec![],
                missing_threshold_seconds: Some(300),
            })
            .await
            .unwrap();

        let omitted: PlanPatch = serde_json::from_str(r#"{"name": "Day shift"}"#).unwrap();
        assert_eq!(omitted.missing_threshold_seconds, None);
        let renamed = engine.registry.update_plan(plan.id, omitted).await.unwrap();
        assert_eq!(renamed.missing_threshold_seconds, Some(300));

        let set: PlanPatch = serde_json::from_str(r#"{"missingThresholdSeconds": 120}"#).unwrap();
        let tightened = engine.registry.update_plan(plan.id, set).await.unwrap();
        assert_eq!(tightened.missing_threshold_seconds, Some(120));

        let cleared: PlanPatch =
            serde_json::from_str(r#"{"missingThresholdSeconds": null}"#).unwrap();
        assert_eq!(cleared.missing_threshold_seconds, Some(None));
        let reset = engine.registry.update_plan(plan.id, cleared).await.unwrap();
        assert_eq!(reset.missing_threshold_seconds, None);
        assert_eq!(
            engine.registry.get_plan(plan.id).await.unwrap().missing_threshold_seconds,
            None
        );
    }
}
