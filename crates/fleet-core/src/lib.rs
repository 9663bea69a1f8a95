//! Core types, configuration, and backend interfaces for the fleet scheduler.
//!
//! Everything the scheduler needs to know about the outside world passes
//! through [`FleetBackend`] (cluster, VM, and fleet-group calls) and
//! [`EventSink`] (operational events). [`memory::InMemoryBackend`] is a
//! complete in-process stand-in used by tests and the `fleetd simulate` mode.

pub mod backend;
pub mod config;
pub mod error;
pub mod memory;
pub mod types;

pub use backend::{EventSink, FleetBackend, FleetEvent, TracingEventSink};
pub use config::{FleetConfig, parse_duration};
pub use error::{FleetError, FleetResult};
pub use types::*;
