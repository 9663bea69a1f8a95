//! Unmet demand and capacity promised to future work.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use fleet_core::{ReserveRequest, SchedulingRequest};
use tracing::{debug, info};
use uuid::Uuid;

/// Capacity the fleet lacked for requests that found no host.
///
/// A request resubmitted after a capacity failure keeps its id, so each id
/// is counted once.
#[derive(Debug, Default, Clone)]
pub struct Shortfall {
    lacking_cpu: u64,
    lacking_memory: u64,
    counted: HashSet<Uuid>,
}

impl Shortfall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lacking_cpu(&self) -> u64 {
        self.lacking_cpu
    }

    pub fn lacking_memory(&self) -> u64 {
        self.lacking_memory
    }

    /// True while some counted demand is still outstanding.
    pub fn is_overflowing(&self) -> bool {
        !self.counted.is_empty()
    }

    /// Count an unplaced request. Returns false if it was already counted.
    pub fn record_unplaced(&mut self, request: &SchedulingRequest) -> bool {
        if !self.counted.insert(request.id) {
            return false;
        }
        self.lacking_cpu += u64::from(request.cpu);
        self.lacking_memory += u64::from(request.memory);
        true
    }

    /// Reduce the shortfall by a placed request. Once the remainder cannot
    /// hold one minimal container in either dimension, everything resets.
    pub fn record_placed(&mut self, request: &SchedulingRequest, min_cpu: u32, min_memory: u32) {
        self.lacking_cpu = self.lacking_cpu.saturating_sub(u64::from(request.cpu));
        self.lacking_memory = self.lacking_memory.saturating_sub(u64::from(request.memory));
        if self.lacking_cpu < u64::from(min_cpu) || self.lacking_memory < u64::from(min_memory) {
            if self.is_overflowing() {
                debug!(counted = self.counted.len(), "shortfall cleared");
            }
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.lacking_cpu = 0;
        self.lacking_memory = 0;
        self.counted.clear();
    }
}

/// At most one reservation per build key; newer replaces older.
#[derive(Debug, Default, Clone)]
pub struct FutureReservations {
    by_group: HashMap<String, ReserveRequest>,
}

impl FutureReservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, request: ReserveRequest) {
        match self.by_group.get(&request.group) {
            Some(existing) if existing.created_at > request.created_at => {
                debug!(group = %request.group, "ignoring older reservation");
            }
            _ => {
                info!(
                    group = %request.group,
                    cpu = request.cpu,
                    memory = request.memory,
                    "future capacity reserved"
                );
                self.by_group.insert(request.group.clone(), request);
            }
        }
    }

    /// Drop the reservation this request was promised against, if any.
    pub fn release_for(&mut self, request: &SchedulingRequest) -> bool {
        let matches = self
            .by_group
            .get(&request.group)
            .is_some_and(|r| r.result_ids.iter().any(|id| *id == request.result_id));
        if matches {
            self.by_group.remove(&request.group);
            info!(group = %request.group, result_id = %request.result_id, "reservation consumed");
        }
        matches
    }

    /// Remove reservations older than `timeout`. Returns how many expired.
    pub fn expire(&mut self, now: u64, timeout: Duration) -> usize {
        let before = self.by_group.len();
        self.by_group
            .retain(|_, r| now.saturating_sub(r.created_at) <= timeout.as_secs());
        let expired = before - self.by_group.len();
        if expired > 0 {
            debug!(expired, "future reservations expired");
        }
        expired
    }

    /// Sum of live reservations as (cpu, memory).
    pub fn totals(&self) -> (u64, u64) {
        self.by_group
            .values()
            .fold((0, 0), |(cpu, mem), r| (cpu + r.cpu, mem + r.memory))
    }

    pub fn len(&self) -> usize {
        self.by_group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_group.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cpu: u32, memory: u32) -> SchedulingRequest {
        SchedulingRequest::new("PLAN-JOB", "PLAN-JOB-1", cpu, memory)
    }

    fn reservation(group: &str, ids: &[&str], memory: u64, created_at: u64) -> ReserveRequest {
        ReserveRequest {
            group: group.to_string(),
            result_ids: ids.iter().map(|s| s.to_string()).collect(),
            cpu: memory / 4,
            memory,
            created_at,
        }
    }

    #[test]
    fn unplaced_request_counted_once() {
        let mut shortfall = Shortfall::new();
        let req = request(2048, 8000);
        assert!(shortfall.record_unplaced(&req));
        assert!(!shortfall.record_unplaced(&req));
        assert_eq!(shortfall.lacking_cpu(), 2048);
        assert_eq!(shortfall.lacking_memory(), 8000);
        assert!(shortfall.is_overflowing());
    }

    #[test]
    fn placement_reduces_then_resets() {
        let mut shortfall = Shortfall::new();
        shortfall.record_unplaced(&request(10_000, 40_000));

        shortfall.record_placed(&request(1024, 4000), 1024, 4000);
        assert_eq!(shortfall.lacking_cpu(), 8976);
        assert_eq!(shortfall.lacking_memory(), 36_000);
        assert!(shortfall.is_overflowing());

        shortfall.record_placed(&request(8000, 4000), 1024, 4000);
        assert_eq!(shortfall.lacking_cpu(), 0);
        assert_eq!(shortfall.lacking_memory(), 0);
        assert!(!shortfall.is_overflowing());
    }

    #[test]
    fn placement_never_goes_negative() {
        let mut shortfall = Shortfall::new();
        shortfall.record_unplaced(&request(100, 100));
        shortfall.record_placed(&request(5000, 5000), 0, 0);
        assert_eq!(shortfall.lacking_cpu(), 0);
        assert_eq!(shortfall.lacking_memory(), 0);
    }

    #[test]
    fn newest_reservation_wins() {
        let mut res = FutureReservations::new();
        res.reserve(reservation("PLAN", &["r1"], 4000, 100));
        res.reserve(reservation("PLAN", &["r2"], 8000, 200));
        res.reserve(reservation("PLAN", &["r3"], 1000, 150));
        assert_eq!(res.len(), 1);
        assert_eq!(res.totals(), (2000, 8000));
    }

    #[test]
    fn placement_releases_matching_reservation() {
        let mut res = FutureReservations::new();
        res.reserve(reservation("PLAN-JOB", &["PLAN-JOB-1", "PLAN-JOB-2"], 4000, 100));
        res.reserve(reservation("OTHER", &["PLAN-JOB-1"], 4000, 100));

        let mut unrelated = request(1, 1);
        unrelated.result_id = "PLAN-JOB-9".to_string();
        assert!(!res.release_for(&unrelated));

        assert!(res.release_for(&request(1, 1)));
        assert_eq!(res.len(), 1);
        assert_eq!(res.totals(), (1000, 4000));
    }

    #[test]
    fn reservations_expire() {
        let mut res = FutureReservations::new();
        let timeout = Duration::from_secs(40 * 60);
        res.reserve(reservation("OLD", &["a"], 4000, 1000));
        res.reserve(reservation("NEW", &["b"], 2000, 3000));

        assert_eq!(res.expire(1000 + 40 * 60, timeout), 0);
        assert_eq!(res.expire(1000 + 40 * 60 + 1, timeout), 1);
        assert_eq!(res.totals(), (500, 2000));
    }
}
