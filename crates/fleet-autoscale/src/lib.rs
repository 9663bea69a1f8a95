//! fleet-autoscale — rightsizes the fleet group after each scheduling pass.
//!
//! # Scaling Algorithm
//!
//! ```text
//! purge      = hosts disconnected for >= disconnected_timeout   (terminate, keep desired)
//! candidates = unused_stale ++ unused_fresh
//! if candidates == usable:            keep one
//! else while free_ratio(rest) < 0.30: keep candidates.head
//! terminate(candidates[..15])                                   (terminate, shrink desired)
//!
//! if some request was discarded:
//!     needed  = max(1, ceil(lacking_cpu / min_cpu), ceil(lacking_mem / min_mem))
//! desired = usable + needed - terminated + disconnected_awaiting_replacement
//! desired = min(desired, max_size)
//! if desired > usable - terminated and desired > group.desired_capacity:
//!     scale_to(desired)                                         (only ever scales up)
//! ```
//!
//! Backend failures are logged and swallowed; the next pass sees the real
//! fleet again and converges.

pub mod disconnected;
pub mod updater;

pub use disconnected::DisconnectedCache;
pub use updater::{Demand, ModelUpdater, ScaleReport, UpdaterSettings, hosts_needed, select_to_terminate};
