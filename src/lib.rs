//! # petfence - geofence monitoring for tracked pets
//!
//! petfence decides, continuously and per entity, whether a tracked pet is
//! inside its owner-defined circular safe zone, turns those decisions into
//! debounced ENTER/EXIT transitions, and drives alerts that keep repeating
//! while the pet stays out, even across process restarts.
//!
//! ## Core Concepts
//!
//! - **SafeZone**: a center coordinate and a radius; one per entity
//! - **PositionSample**: a timestamped fix, pushed or pulled
//! - **ContainmentEvaluator**: zone + latest fix → inside/outside and distance
//! - **TransitionTracker**: UNKNOWN/INSIDE/OUTSIDE state machine emitting events on flips
//! - **AlertScheduler**: immediate exit alert plus reminders, backed by durable alarm flags
//! - **StatusPublisher**: IN/OUT/UNKNOWN status and an event log for other observers
//! - **MonitorService**: one evaluation loop per monitored entity
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use petfence::{Coordinate, EntityId, MonitorService, TracingSink};
//! use petfence::storage::InMemoryStores;
//!
//! let stores = InMemoryStores::default();
//! let service = MonitorService::builder()
//!     .in_memory(&stores)
//!     .notifier(Arc::new(TracingSink))
//!     .build()?;
//!
//! let rex = EntityId::new("rex")?;
//! service.set_zone(&rex, Coordinate::new(47.61, -122.33), 150.0).await?;
//! service.start_monitoring(&rex).await?;
//! service.report_position(&rex, 47.62, -122.33, chrono::Utc::now())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod geo;
pub mod position;

// Pipeline
pub mod alerts;
pub mod evaluator;
pub mod feed;
pub mod notify;
pub mod status;
pub mod tracker;
pub mod zones;

// Storage and orchestration
pub mod monitor;
pub mod storage;

pub use alerts::{AlarmState, AlertScheduler};
pub use config::MonitorConfig;
pub use entity::EntityId;
pub use error::{ExecutionError, FenceError, FenceResult, ValidationError};
pub use evaluator::{ContainmentEvaluator, ContainmentState, Evaluation};
pub use events::{EventId, TransitionEvent, TransitionKind};
pub use feed::{PositionFeed, SampleCallback};
pub use geo::{distance_meters, is_inside, Coordinate, SafeZone, EARTH_RADIUS_METERS};
pub use monitor::{EventStream, MonitorService, MonitorServiceBuilder};
pub use notify::{Alert, AlertKind, NotificationSink, NotifyError, RecordingSink, TracingSink};
pub use position::PositionSample;
pub use status::{StatusPublisher, StatusRecord, ZoneStatus};
pub use storage::{AlarmStore, PositionStore, StatusStore, StorageError, ZoneBackend};
pub use tracker::{TrackerState, TransitionTracker};
pub use zones::{ZoneLookup, ZoneStore};
