//! fleet-scheduler — places build-agent requests on fleet hosts.
//!
//! One worker task owns all scheduling state. Producers only enqueue.
//!
//! # Architecture
//!
//! ```text
//! SchedulerHandle ──(Command::Schedule / Reserve / Sync)──▶ worker task
//!                                                            ├── ModelLoader   (snapshot per pass, lonely VMs)
//!                                                            ├── FleetSnapshot (best fit, in-pass debits)
//!                                                            ├── Shortfall + FutureReservations
//!                                                            └── ModelUpdater  (scale up / down, purge)
//! ```
//!
//! A pass starts when a request arrives: the fleet is loaded once, every
//! queued command is drained against that snapshot in FIFO order, then the
//! model updater runs. With no request for `poll_interval`, the worker runs
//! a scale-down-only check instead.

pub mod callback;
pub mod error;
pub mod loader;
pub mod scheduler;
pub mod shortfall;

pub use callback::{FnCallback, SchedulingCallback, SchedulingOutcome, callback_fn};
pub use error::SchedulingError;
pub use loader::{LoaderSettings, ModelLoader};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerSettings};
pub use shortfall::{FutureReservations, Shortfall};
