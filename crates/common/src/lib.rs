//! Shared types, error definitions, and observability primitives used
//! across all roost crates.

pub mod error;
pub mod health;
pub mod observe;

pub use {
    error::{Annotate, FromMessage},
    health::{HealthMonitor, HealthReport, HealthStatus},
    observe::{ConnectionKind, EventClass, Observation, ObserverHook, ObserverRegistry, SystemKind},
};
