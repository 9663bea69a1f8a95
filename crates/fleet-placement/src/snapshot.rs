//! Per-pass fleet snapshot with precomputed host partitions.

use std::collections::HashSet;
use std::time::Duration;

use fleet_core::FleetGroupInfo;
use fleet_core::config::HostsConfig;
use tracing::debug;

use crate::fit::{FitOrder, utilization};
use crate::host::Host;

/// Index of a host within a [`FleetSnapshot`].
pub type HostIdx = usize;

/// Thresholds used to classify hosts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotSettings {
    pub stale_period: Duration,
    pub minutes_before_billing_cycle: u32,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        (&HostsConfig::default()).into()
    }
}

impl From<&HostsConfig> for SnapshotSettings {
    fn from(config: &HostsConfig) -> Self {
        Self {
            stale_period: config.stale_period,
            minutes_before_billing_cycle: config.minutes_before_billing_cycle,
        }
    }
}

/// The fleet as observed at `taken_at`.
///
/// Partitions are computed once in [`FleetSnapshot::new`]. Only remaining
/// capacity and the "used this pass" set change afterwards.
#[derive(Debug, Clone)]
pub struct FleetSnapshot {
    cluster: String,
    group: FleetGroupInfo,
    taken_at: u64,
    hosts: Vec<Host>,
    usable: Vec<HostIdx>,
    agent_disconnected: Vec<HostIdx>,
    fresh: Vec<HostIdx>,
    unused_stale: Vec<HostIdx>,
    /// Fresh, idle, and inside the billing window at `taken_at`.
    idle_fresh: Vec<HostIdx>,
    used: HashSet<HostIdx>,
}

impl FleetSnapshot {
    pub fn new(
        cluster: impl Into<String>,
        group: FleetGroupInfo,
        hosts: Vec<Host>,
        settings: SnapshotSettings,
        taken_at: u64,
    ) -> Self {
        let mut usable = Vec::new();
        let mut agent_disconnected = Vec::new();
        let mut fresh = Vec::new();
        let mut unused_stale = Vec::new();
        let mut idle_fresh = Vec::new();

        for (idx, host) in hosts.iter().enumerate() {
            if !host.agent_connected {
                if !host.is_draining() {
                    agent_disconnected.push(idx);
                }
                continue;
            }
            usable.push(idx);
            if host.is_fresh(taken_at, settings.stale_period) {
                fresh.push(idx);
                if host.running_nothing()
                    && host.reaching_end_of_billing_cycle(taken_at, settings.minutes_before_billing_cycle)
                {
                    idle_fresh.push(idx);
                }
            } else if host.running_nothing() {
                unused_stale.push(idx);
            }
        }

        let snapshot = Self {
            cluster: cluster.into(),
            group,
            taken_at,
            hosts,
            usable,
            agent_disconnected,
            fresh,
            unused_stale,
            idle_fresh,
            used: HashSet::new(),
        };
        debug!(
            cluster = %snapshot.cluster,
            hosts = snapshot.hosts.len(),
            usable = snapshot.usable.len(),
            fresh = snapshot.fresh.len(),
            disconnected = snapshot.agent_disconnected.len(),
            unused_stale = snapshot.unused_stale.len(),
            "fleet snapshot built"
        );
        snapshot
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn group(&self) -> &FleetGroupInfo {
        &self.group
    }

    pub fn taken_at(&self) -> u64 {
        self.taken_at
    }

    pub fn host(&self, idx: HostIdx) -> &Host {
        &self.hosts[idx]
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn usable(&self) -> impl Iterator<Item = &Host> {
        self.usable.iter().map(|&i| &self.hosts[i])
    }

    pub fn usable_count(&self) -> usize {
        self.usable.len()
    }

    pub fn agent_disconnected(&self) -> impl Iterator<Item = &Host> {
        self.agent_disconnected.iter().map(|&i| &self.hosts[i])
    }

    pub fn agent_disconnected_count(&self) -> usize {
        self.agent_disconnected.len()
    }

    pub fn fresh(&self) -> impl Iterator<Item = &Host> {
        self.fresh.iter().map(|&i| &self.hosts[i])
    }

    pub fn unused_stale(&self) -> impl Iterator<Item = &Host> {
        self.unused_stale.iter().map(|&i| &self.hosts[i])
    }

    /// Idle fresh hosts near their billing boundary that received no work
    /// this pass.
    pub fn unused_fresh(&self) -> impl Iterator<Item = &Host> {
        self.idle_fresh
            .iter()
            .filter(|&&i| !self.used.contains(&i))
            .map(|&i| &self.hosts[i])
    }

    pub fn is_used(&self, idx: HostIdx) -> bool {
        self.used.contains(&idx)
    }

    /// The preferred fresh host able to run the request.
    pub fn best_fit(&self, cpu: u32, memory: u32, order: FitOrder) -> Option<HostIdx> {
        self.fresh
            .iter()
            .copied()
            .filter(|&i| self.hosts[i].can_run(cpu, memory))
            .min_by(|&a, &b| order.compare(&self.hosts[a], &self.hosts[b]))
    }

    /// Record a placement: the host is used this pass and its remaining
    /// capacity shrinks.
    pub fn place(&mut self, idx: HostIdx, cpu: u32, memory: u32) {
        self.used.insert(idx);
        self.hosts[idx].debit(cpu, memory);
    }

    /// Whether some fresh host's registered capacity could hold the
    /// request once emptied. `None` when there is no fresh host.
    pub fn fits_on_any(&self, cpu: u32, memory: u32) -> Option<bool> {
        if self.fresh.is_empty() {
            return None;
        }
        Some(
            self.fresh()
                .any(|h| cpu <= h.registered_cpu && memory <= h.registered_memory),
        )
    }

    /// Largest registered CPU and memory among fresh hosts.
    pub fn largest_fresh(&self) -> Option<(u32, u32)> {
        self.fresh().fold(None, |acc, h| {
            let (cpu, mem) = acc.unwrap_or((0, 0));
            Some((cpu.max(h.registered_cpu), mem.max(h.registered_memory)))
        })
    }

    /// Utilization of the fresh hosts.
    pub fn utilization(&self) -> f64 {
        utilization(self.fresh())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::HostStatus;

    const NOW: u64 = 10_000_000;
    const DAY: u64 = 86_400;

    fn make_host(id: &str, remaining: u32, age: u64) -> Host {
        Host {
            node_id: format!("ci-{id}"),
            instance_id: id.to_string(),
            instance_type: "test".to_string(),
            registered_cpu: 100,
            registered_memory: 100,
            remaining_cpu: remaining,
            remaining_memory: remaining,
            launch_time: NOW - age,
            agent_connected: true,
            in_fleet_group: true,
            status: HostStatus::Active,
        }
    }

    fn group() -> FleetGroupInfo {
        FleetGroupInfo {
            name: "agents".to_string(),
            min_size: 0,
            max_size: 10,
            desired_capacity: 0,
            member_instance_ids: Vec::new(),
            suspended_processes: Vec::new(),
        }
    }

    fn snapshot(hosts: Vec<Host>) -> FleetSnapshot {
        FleetSnapshot::new("cluster", group(), hosts, SnapshotSettings::default(), NOW)
    }

    fn ids<'a>(hosts: impl Iterator<Item = &'a Host>) -> Vec<&'a str> {
        hosts.map(|h| h.instance_id.as_str()).collect()
    }

    #[test]
    fn partitions_classify_hosts() {
        let mut disconnected = make_host("disc", 100, 3600);
        disconnected.agent_connected = false;
        let mut draining_disc = make_host("drain-disc", 100, 3600);
        draining_disc.agent_connected = false;
        draining_disc.status = HostStatus::Draining;
        let mut draining = make_host("draining", 100, 3600);
        draining.status = HostStatus::Draining;
        let mut detached = make_host("detached", 50, 3600);
        detached.in_fleet_group = false;

        let snap = snapshot(vec![
            make_host("busy", 40, 3600),
            make_host("stale", 100, 8 * DAY),
            make_host("stale-busy", 10, 8 * DAY),
            make_host("idle-end", 100, 55 * 60),
            make_host("idle-early", 100, 20 * 60),
            disconnected,
            draining_disc,
            draining,
            detached,
        ]);

        assert_eq!(snap.usable_count(), 7);
        assert_eq!(ids(snap.agent_disconnected()), vec!["disc"]);
        assert_eq!(ids(snap.fresh()), vec!["busy", "idle-end", "idle-early"]);
        assert_eq!(ids(snap.unused_stale()), vec!["stale", "draining"]);
        assert_eq!(ids(snap.unused_fresh()), vec!["idle-end"]);
    }

    #[test]
    fn best_fit_only_considers_fresh_hosts() {
        let snap = snapshot(vec![make_host("stale", 30, 8 * DAY), make_host("fresh", 60, 3600)]);
        let idx = snap.best_fit(20, 20, FitOrder::Tightest).unwrap();
        assert_eq!(snap.host(idx).instance_id, "fresh");
        assert!(snap.best_fit(70, 70, FitOrder::Tightest).is_none());
    }

    #[test]
    fn place_debits_and_marks_used() {
        let mut snap = snapshot(vec![make_host("idle-end", 100, 55 * 60)]);
        assert_eq!(ids(snap.unused_fresh()), vec!["idle-end"]);

        let idx = snap.best_fit(30, 30, FitOrder::Tightest).unwrap();
        snap.place(idx, 30, 30);

        assert!(snap.is_used(idx));
        assert_eq!(snap.host(idx).remaining_memory, 70);
        assert_eq!(snap.unused_fresh().count(), 0);
        assert!((snap.utilization() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn utilization_counts_only_fresh_hosts() {
        let stale = make_host("stale", 0, 8 * DAY);
        let snap = snapshot(vec![stale, make_host("fresh", 100, 3600)]);
        assert_eq!(snap.utilization(), 0.0);
    }

    #[test]
    fn request_bound_comes_from_fresh_hosts() {
        let mut big = make_host("big", 100, 3600);
        big.registered_memory = 400;
        big.agent_connected = false;
        let snap = snapshot(vec![make_host("a", 100, 3600), big]);
        assert_eq!(snap.largest_fresh(), Some((100, 100)));
        assert_eq!(snap.fits_on_any(100, 100), Some(true));
        assert_eq!(snap.fits_on_any(50, 200), Some(false));

        let empty = snapshot(vec![make_host("stale", 100, 8 * DAY)]);
        assert_eq!(empty.largest_fresh(), None);
        assert_eq!(empty.fits_on_any(50, 200), None);
    }

    #[test]
    fn zero_billing_window_disables_unused_fresh() {
        let settings = SnapshotSettings {
            stale_period: Duration::from_secs(7 * DAY),
            minutes_before_billing_cycle: 0,
        };
        let snap = FleetSnapshot::new("c", group(), vec![make_host("idle", 100, 59 * 60)], settings, NOW);
        assert_eq!(snap.unused_fresh().count(), 0);
    }
}
