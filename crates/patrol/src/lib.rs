//! Patrol compliance engine.
//!
//! Tracks guards as they scan checkpoints during a shift, classifies every
//! scan against its expected time, raises alerts for skipped checkpoints and
//! field emergencies, and generates daily duty assignments.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use patrol::{Engine, MemoryStore};
//! use patrol::registry::{NewCheckpoint, NewZone};
//! use patrol::scan::ScanRequest;
//! use patrol::types::CheckpointRef;
//!
//! # async fn demo() -> patrol::Result<()> {
//! let engine = Engine::builder(Arc::new(MemoryStore::new())).build();
//!
//! let zone = engine
//!     .registry
//!     .create_zone(NewZone { name: "North".into(), code: "N".into() })
//!     .await?;
//! engine
//!     .registry
//!     .create_checkpoint(
//!         zone.id,
//!         NewCheckpoint {
//!             name: "Gate".into(),
//!             code: "N-GATE".into(),
//!             order: 1,
//!             expected_offset_seconds: 600,
//!             grace_seconds: 120,
//!         },
//!     )
//!     .await?;
//!
//! let shift = engine.shifts.start(zone.id, "g-17").await?;
//! engine
//!     .scans
//!     .register(ScanRequest::live(shift.id, CheckpointRef::Code("N-GATE".into())))
//!     .await?;
//! let summary = engine.shifts.end(shift.id).await?;
//! # let _ = summary;
//! # Ok(())
//! # }
//! ```

pub mod alert;
pub mod assignment;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod offline;
pub mod reconcile;
pub mod registry;
pub mod scan;
pub mod scheduler;
pub mod shift;
pub mod sink;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PatrolConfig;
pub use engine::{Engine, EngineBuilder, Services};
pub use error::{ErrorKind, PatrolError, Result};
pub use events::{BroadcastPublisher, EventPublisher, PatrolEvent};
pub use identity::{Guard, IdentityProvider, StaticIdentityProvider};
pub use sink::NotificationSink;
pub use store::{MemoryStore, PatrolStore, SqliteStore, StoreError};
