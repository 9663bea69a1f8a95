//! Host model and per-pass fleet snapshot.
//!
//! A [`FleetSnapshot`] is rebuilt from authoritative cluster data at the
//! start of every scheduling pass. It owns its [`Host`]s and classifies them
//! once into partitions that drive both placement and scale-down:
//!
//! ```text
//!   all hosts ─┬─ usable (agent connected) ─┬─ fresh ──────── idle near billing boundary ─▶ unused-fresh
//!              │                             └─ not fresh ─── running nothing ────────────▶ unused-stale
//!              └─ agent disconnected (not draining)
//! ```
//!
//! # Components
//!
//! - **`host`**: One VM with its registered and remaining capacity
//! - **`snapshot`**: Partitions, in-pass debits, "used this pass" tracking
//! - **`fit`**: Best-fit ordering and utilization

pub mod fit;
pub mod host;
pub mod snapshot;

pub use fit::{FitOrder, best_fit, utilization};
pub use host::{Host, HostKey};
pub use snapshot::{FleetSnapshot, HostIdx, SnapshotSettings};
