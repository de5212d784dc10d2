//! Monitoring orchestration.
//!
//! One evaluation loop per monitored entity drives the whole pipeline:
//! feed, evaluator, tracker, then alerts and status. Loops share nothing but
//! the zone cache and the alarm flags, both synchronized per entity key.
//! Observers can follow confirmed transitions through an [`EventStream`].

/// Per-entity loops and the public service facade.
pub mod service;
/// Subscriber stream handle.
pub mod stream;

pub use service::{MonitorService, MonitorServiceBuilder};
pub use stream::{EventStream, SubscriptionId};
