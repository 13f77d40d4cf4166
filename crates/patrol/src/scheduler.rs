//! Periodic background jobs.
//!
//! A job never overlaps itself: ticks and manual triggers that arrive while
//! a run is in flight are skipped.

use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assignment::AssignmentGenerator;
use crate::error::Result;
use crate::reconcile::MissedCheckpointReconciler;

#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// One run. The returned value is the run's report as JSON.
    async fn run(&self) -> Result<serde_json::Value>;
}

/// Result of a manual trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Completed(serde_json::Value),
    /// The job was already running
    Skipped,
}

struct Slot {
    job: Arc<dyn PeriodicJob>,
    period: Duration,
    running: Arc<Mutex<()>>,
}

impl Slot {
    async fn run_exclusive(&self) -> Option<Result<serde_json::Value>> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!(job = self.job.name(), "Job still running, skipping");
            return None;
        };
        Some(self.job.run().await)
    }
}

pub struct Scheduler {
    slots: Vec<Arc<Slot>>,
    token: CancellationToken,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            token: CancellationToken::new(),
            handles: StdMutex::new(Vec::new()),
        }
    }

    pub fn add(&mut self, job: Arc<dyn PeriodicJob>, period: Duration) {
        self.slots.push(Arc::new(Slot {
            job,
            period,
            running: Arc::new(Mutex::new(())),
        }));
    }

    #[must_use]
    pub fn job_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.job.name()).collect()
    }

    /// Spawn one loop per job. The first tick fires immediately.
    pub fn start(&self) {
        let Ok(mut handles) = self.handles.lock() else {
            warn!("Scheduler handle list poisoned, not starting");
            return;
        };
        if !handles.is_empty() {
            debug!("Scheduler already started");
            return;
        }

        for slot in &self.slots {
            let slot = Arc::clone(slot);
            let token = self.token.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(slot.period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                info!(
                    job = slot.job.name(),
                    period_secs = slot.period.as_secs(),
                    "Job scheduled"
                );
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Some(Err(e)) = slot.run_exclusive().await {
                                warn!(job = slot.job.name(), error = %e, "Job run failed");
                            }
                        }
                    }
                }
                debug!(job = slot.job.name(), "Job loop stopped");
            }));
        }
    }

    /// Run a job now unless it is already running.
    pub async fn trigger(&self, name: &str) -> Option<Result<TriggerOutcome>> {
        let slot = self.slots.iter().find(|s| s.job.name() == name)?;
        Some(match slot.run_exclusive().await {
            Some(Ok(report)) => Ok(TriggerOutcome::Completed(report)),
            Some(Err(e)) => Err(e),
            None => Ok(TriggerOutcome::Skipped),
        })
    }

    /// Stop every loop and wait for in-flight runs to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Job loop ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }
}

pub struct ReconcileJob {
    reconciler: Arc<MissedCheckpointReconciler>,
}

impl ReconcileJob {
    pub const NAME: &'static str = "reconcile";

    pub fn new(reconciler: Arc<MissedCheckpointReconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl PeriodicJob for ReconcileJob {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self) -> Result<serde_json::Value> {
        let report = self.reconciler.run().await?;
        Ok(serde_json::to_value(report).unwrap_or_default())
    }
}

pub struct AssignmentJob {
    generator: Arc<AssignmentGenerator>,
}

impl AssignmentJob {
    pub const NAME: &'static str = "assignments";

    pub fn new(generator: Arc<AssignmentGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl PeriodicJob for AssignmentJob {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self) -> Result<serde_json::Value> {
        let reports = self.generator.run_horizon().await?;
        Ok(serde_json::to_value(reports).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct CountingJob {
        runs: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self) -> Result<serde_json::Value> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(serde_json::json!({ "run": n }))
        }
    }

    #[tokio::test]
    async fn test_trigger_runs_job() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            gate: None,
        });
        let mut scheduler = Scheduler::new();
        scheduler.add(job.clone(), Duration::from_secs(3600));

        let outcome = scheduler.trigger("counting").await.unwrap().unwrap();
        assert_eq!(outcome, TriggerOutcome::Completed(serde_json::json!({ "run": 1 })));
        assert!(scheduler.trigger("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_trigger_skipped_while_running() {
        let gate = Arc::new(Notify::new());
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            gate: Some(gate.clone()),
        });
        let mut scheduler = Scheduler::new();
        scheduler.add(job.clone(), Duration::from_secs(3600));
        let scheduler = Arc::new(scheduler);

        let first = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.trigger("counting").await })
        };
        while job.runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = scheduler.trigger("counting").await.unwrap().unwrap();
        assert_eq!(second, TriggerOutcome::Skipped);

        gate.notify_one();
        let first = first.await.unwrap().unwrap().unwrap();
        assert!(matches!(first, TriggerOutcome::Completed(_)));
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_ticks_until_shutdown() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            gate: None,
        });
        let mut scheduler = Scheduler::new();
        scheduler.add(job.clone(), Duration::from_secs(60));
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(150)).await;
        scheduler.shutdown().await;
        let runs = job.runs.load(Ordering::SeqCst);
        assert_eq!(runs, 3);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), runs);
    }
}
