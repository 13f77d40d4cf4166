//! Composition root.
//!
//! Every collaborator is injected here; components never reach for global
//! state.

use std::sync::Arc;
use std::time::Duration;

use crate::alert::AlertManager;
use crate::assignment::AssignmentGenerator;
use crate::clock::{Clock, SystemClock};
use crate::config::PatrolConfig;
use crate::events::{Emitter, EventPublisher, NoopPublisher};
use crate::identity::{IdentityProvider, StaticIdentityProvider};
use crate::offline::OfflineSync;
use crate::reconcile::MissedCheckpointReconciler;
use crate::registry::Registry;
use crate::scan::ScanIngestor;
use crate::scheduler::{AssignmentJob, ReconcileJob, Scheduler};
use crate::shift::ShiftManager;
use crate::sink::{NoopSink, NotificationSink};
use crate::store::PatrolStore;

/// Collaborators shared by all components.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn PatrolStore>,
    pub clock: Arc<dyn Clock>,
    pub emitter: Emitter,
    pub sink: Arc<dyn NotificationSink>,
    pub identity: Arc<dyn IdentityProvider>,
    pub config: Arc<PatrolConfig>,
}

/// The patrol compliance engine.
#[derive(Clone)]
pub struct Engine {
    pub registry: Registry,
    pub shifts: ShiftManager,
    pub scans: ScanIngestor,
    pub alerts: AlertManager,
    pub reconciler: Arc<MissedCheckpointReconciler>,
    pub assignments: Arc<AssignmentGenerator>,
    pub offline: OfflineSync,
    services: Services,
}

impl Engine {
    pub fn builder(store: Arc<dyn PatrolStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn new(services: Services) -> Self {
        let alerts = AlertManager::new(services.clone());
        let scans = ScanIngestor::new(services.clone());
        Self {
            registry: Registry::new(services.clone()),
            shifts: ShiftManager::new(services.clone()),
            reconciler: Arc::new(MissedCheckpointReconciler::new(
                services.clone(),
                alerts.clone(),
            )),
            assignments: Arc::new(AssignmentGenerator::new(services.clone())),
            offline: OfflineSync::new(services.clone(), scans.clone()),
            scans,
            alerts,
            services,
        }
    }

    #[must_use]
    pub fn services(&self) -> &Services {
        &self.services
    }

    #[must_use]
    pub fn config(&self) -> &PatrolConfig {
        &self.services.config
    }

    /// Scheduler carrying the reconciler and the assignment generator at
    /// their configured intervals. Not started.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        let config = &self.services.config;
        let mut scheduler = Scheduler::new();
        scheduler.add(
            Arc::new(ReconcileJob::new(Arc::clone(&self.reconciler))),
            config.reconcile_interval(),
        );
        scheduler.add(
            Arc::new(AssignmentJob::new(Arc::clone(&self.assignments))),
            config.assignment_interval(),
        );
        scheduler
    }
}

pub struct EngineBuilder {
    store: Arc<dyn PatrolStore>,
    clock: Arc<dyn Clock>,
    publisher: Arc<dyn EventPublisher>,
    sink: Arc<dyn NotificationSink>,
    identity: Arc<dyn IdentityProvider>,
    config: PatrolConfig,
}

impl EngineBuilder {
    fn new(store: Arc<dyn PatrolStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            publisher: Arc::new(NoopPublisher),
            sink: Arc::new(NoopSink),
            identity: Arc::new(StaticIdentityProvider::default()),
            config: PatrolConfig::default(),
        }
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    #[must_use]
    pub fn config(mut self, config: PatrolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Engine {
        let timeout = Duration::from_millis(self.config.event_timeout_ms);
        Engine::new(Services {
            store: self.store,
            clock: self.clock,
            emitter: Emitter::new(self.publisher, timeout),
            sink: self.sink,
            identity: self.identity,
            config: Arc::new(self.config),
        })
    }
}
