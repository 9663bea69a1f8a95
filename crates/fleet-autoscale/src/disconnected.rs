//! Tracks how long each host's container agent has been disconnected.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use fleet_placement::{FleetSnapshot, Host, HostKey};

/// First-observed timestamps of currently disconnected hosts.
///
/// Agents under load often drop out briefly and recover, so a host is only
/// purged after staying disconnected for the whole timeout.
#[derive(Debug, Default, Clone)]
pub struct DisconnectedCache {
    first_seen: HashMap<HostKey, u64>,
}

impl DisconnectedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync with a snapshot: forget recovered hosts and stamp newly
    /// disconnected ones with the snapshot time. Returns how many hosts
    /// were newly observed.
    pub fn refresh(&mut self, snapshot: &FleetSnapshot) -> usize {
        let current: HashSet<HostKey> = snapshot.agent_disconnected().map(Host::key).collect();
        self.first_seen.retain(|key, _| current.contains(key));

        let mut added = 0;
        for key in current {
            self.first_seen.entry(key).or_insert_with(|| {
                added += 1;
                snapshot.taken_at()
            });
        }
        added
    }

    /// Disconnected hosts in `snapshot` first seen at least `timeout` ago.
    pub fn expired<'a>(&self, snapshot: &'a FleetSnapshot, timeout: Duration) -> Vec<&'a Host> {
        let now = snapshot.taken_at();
        snapshot
            .agent_disconnected()
            .filter(|h| {
                self.first_seen
                    .get(&h.key())
                    .is_some_and(|&seen| now.saturating_sub(seen) >= timeout.as_secs())
            })
            .collect()
    }

    pub fn first_seen(&self, key: &HostKey) -> Option<u64> {
        self.first_seen.get(key).copied()
    }

    pub fn forget(&mut self, key: &HostKey) {
        self.first_seen.remove(key);
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{FleetGroupInfo, HostStatus};
    use fleet_placement::SnapshotSettings;

    const MIN: u64 = 60;

    fn make_host(id: &str, connected: bool) -> Host {
        Host {
            node_id: format!("ci-{id}"),
            instance_id: id.to_string(),
            instance_type: "test".to_string(),
            registered_cpu: 100,
            registered_memory: 100,
            remaining_cpu: 50,
            remaining_memory: 50,
            launch_time: 1_000,
            agent_connected: connected,
            in_fleet_group: true,
            status: HostStatus::Active,
        }
    }

    fn snapshot_at(taken_at: u64, hosts: Vec<Host>) -> FleetSnapshot {
        let group = FleetGroupInfo {
            name: "agents".to_string(),
            min_size: 0,
            max_size: 10,
            desired_capacity: hosts.len() as u32,
            member_instance_ids: hosts.iter().map(|h| h.instance_id.clone()).collect(),
            suspended_processes: Vec::new(),
        };
        FleetSnapshot::new("c", group, hosts, SnapshotSettings::default(), taken_at)
    }

    #[test]
    fn refresh_stamps_new_and_keeps_first_seen() {
        let mut cache = DisconnectedCache::new();
        let t0 = 100_000;

        let added = cache.refresh(&snapshot_at(t0, vec![make_host("a", false), make_host("b", true)]));
        assert_eq!(added, 1);
        assert_eq!(cache.first_seen(&make_host("a", false).key()), Some(t0));

        let added = cache.refresh(&snapshot_at(t0 + 5 * MIN, vec![make_host("a", false), make_host("b", false)]));
        assert_eq!(added, 1);
        assert_eq!(cache.first_seen(&make_host("a", false).key()), Some(t0));
        assert_eq!(cache.first_seen(&make_host("b", false).key()), Some(t0 + 5 * MIN));
    }

    #[test]
    fn recovered_hosts_are_forgotten() {
        let mut cache = DisconnectedCache::new();
        cache.refresh(&snapshot_at(0, vec![make_host("a", false)]));
        cache.refresh(&snapshot_at(60, vec![make_host("a", true)]));
        assert!(cache.is_empty());

        // Reconnect then disconnect again restarts the clock.
        cache.refresh(&snapshot_at(120, vec![make_host("a", false)]));
        assert_eq!(cache.first_seen(&make_host("a", false).key()), Some(120));
    }

    #[test]
    fn expired_respects_timeout() {
        let timeout = Duration::from_secs(20 * MIN);
        let mut cache = DisconnectedCache::new();
        let t0 = 50_000;

        cache.refresh(&snapshot_at(t0, vec![make_host("a", false)]));
        let later = snapshot_at(t0 + 19 * MIN, vec![make_host("a", false)]);
        cache.refresh(&later);
        assert!(cache.expired(&later, timeout).is_empty());

        let at_timeout = snapshot_at(t0 + 20 * MIN, vec![make_host("a", false)]);
        cache.refresh(&at_timeout);
        let expired = cache.expired(&at_timeout, timeout);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].instance_id, "a");
    }

    #[test]
    fn draining_hosts_are_not_tracked() {
        let mut host = make_host("a", false);
        host.status = HostStatus::Draining;
        let mut cache = DisconnectedCache::new();
        cache.refresh(&snapshot_at(0, vec![host]));
        assert!(cache.is_empty());
    }
}
