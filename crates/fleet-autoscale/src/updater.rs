//! Model updater: turns one pass's snapshot and unmet demand into fleet
//! mutations.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{EventSink, FleetBackend, FleetConfig, FleetEvent, HostRef, InstanceProfile};
use fleet_placement::{FleetSnapshot, Host, HostKey};
use tracing::{debug, error, info, warn};

use crate::disconnected::DisconnectedCache;

/// Scaling thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdaterSettings {
    /// Scale-down never leaves less than this share of memory free.
    pub free_capacity_ratio: f64,
    pub max_terminate_batch: usize,
    pub disconnected_timeout: Duration,
    /// Sizing fallback when the fleet has no usable hosts.
    pub default_profile: InstanceProfile,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        (&FleetConfig::default()).into()
    }
}

impl From<&FleetConfig> for UpdaterSettings {
    fn from(config: &FleetConfig) -> Self {
        Self {
            free_capacity_ratio: config.scaling.free_capacity_ratio,
            max_terminate_batch: config.scaling.max_terminate_batch,
            disconnected_timeout: config.scaling.disconnected_timeout,
            default_profile: config.default_profile(),
        }
    }
}

/// Demand left unmet by a scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Demand {
    pub lacking_cpu: u64,
    pub lacking_memory: u64,
    /// At least one request in the pass found no host.
    pub some_discarded: bool,
    /// Capacity promised to future work.
    pub reserved_cpu: u64,
    pub reserved_memory: u64,
}

/// What one update did to the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleReport {
    /// Disconnected hosts terminated without shrinking the group.
    pub purged: usize,
    /// Idle hosts terminated while shrinking the group.
    pub terminated: usize,
    pub scaled_to: Option<u32>,
}

/// Applies scale decisions through the backend.
///
/// Owns the disconnected-agent cache, so one updater must be used for
/// every pass of a given cluster.
pub struct ModelUpdater {
    backend: Arc<dyn FleetBackend>,
    events: Arc<dyn EventSink>,
    settings: UpdaterSettings,
    disconnected: DisconnectedCache,
}

impl ModelUpdater {
    pub fn new(backend: Arc<dyn FleetBackend>, events: Arc<dyn EventSink>, settings: UpdaterSettings) -> Self {
        Self {
            backend,
            events,
            settings,
            disconnected: DisconnectedCache::new(),
        }
    }

    pub fn settings(&self) -> &UpdaterSettings {
        &self.settings
    }

    pub fn disconnected(&self) -> &DisconnectedCache {
        &self.disconnected
    }

    /// Scale-down only: purge long-disconnected hosts and reclaim idle ones.
    pub async fn scale_down(&mut self, snapshot: &FleetSnapshot, demand: &Demand) -> ScaleReport {
        let purged = self.purge_disconnected(snapshot).await;
        let to_terminate = select_to_terminate(snapshot, demand.reserved_memory, self.settings.free_capacity_ratio);
        let terminated = self.terminate(snapshot, to_terminate, true).await;
        ScaleReport {
            purged,
            terminated,
            scaled_to: None,
        }
    }

    /// Full update after a scheduling pass: purge, reclaim, then scale up
    /// for discarded demand.
    pub async fn update_model(&mut self, snapshot: &FleetSnapshot, demand: &Demand) -> ScaleReport {
        let current = snapshot.usable_count() as u64;
        let purged = self.purge_disconnected(snapshot).await;
        let awaiting_replacement = snapshot.agent_disconnected_count().saturating_sub(purged) as u64;

        let mut desired = current;
        if demand.some_discarded {
            let needed = hosts_needed(snapshot, demand, &self.settings.default_profile);
            info!(
                lacking_cpu = demand.lacking_cpu,
                lacking_memory = demand.lacking_memory,
                needed,
                "demand exceeds fleet capacity"
            );
            desired += needed;
        }

        let to_terminate = select_to_terminate(snapshot, demand.reserved_memory, self.settings.free_capacity_ratio);
        let terminated = self.terminate(snapshot, to_terminate, true).await as u64;
        let desired = desired.saturating_sub(terminated) + awaiting_replacement;
        let remaining = current.saturating_sub(terminated);

        let group = snapshot.group();
        let desired = desired.min(u64::from(group.max_size));

        let mut report = ScaleReport {
            purged,
            terminated: terminated as usize,
            scaled_to: None,
        };

        // Only ever scales up; shrinking happens through terminate_and_detach.
        if desired > remaining && desired > u64::from(group.desired_capacity) {
            let target = desired as u32;
            match self.backend.scale_to(&group.name, target).await {
                Ok(()) => {
                    info!(group = %group.name, from = group.desired_capacity, to = target, "scaled up");
                    report.scaled_to = Some(target);
                }
                Err(e) => error!(group = %group.name, to = target, error = %e, "scale up failed"),
            }
        } else {
            debug!(
                group = %group.name,
                desired,
                remaining,
                group_desired = group.desired_capacity,
                "no scale up needed"
            );
        }
        report
    }

    async fn purge_disconnected(&mut self, snapshot: &FleetSnapshot) -> usize {
        let added = self.disconnected.refresh(snapshot);
        if added > 0 {
            let instance_ids: Vec<String> = snapshot.agent_disconnected().map(|h| h.instance_id.clone()).collect();
            warn!(count = instance_ids.len(), "hosts with disconnected agent");
            self.events.publish(FleetEvent::DisconnectedAgents { instance_ids });
        }

        let expired = self
            .disconnected
            .expired(snapshot, self.settings.disconnected_timeout);
        if expired.is_empty() {
            return 0;
        }

        let keys: Vec<HostKey> = expired.iter().map(|h| h.key()).collect();
        warn!(count = expired.len(), "purging hosts with long-disconnected agent");
        self.events.publish(FleetEvent::DisconnectedAgentsPurged {
            instance_ids: expired.iter().map(|h| h.instance_id.clone()).collect(),
        });

        let purged = self.terminate(snapshot, expired, false).await;
        for key in keys.iter().take(purged) {
            self.disconnected.forget(key);
        }
        purged
    }

    /// Terminates up to `max_terminate_batch` hosts. Returns how many were
    /// terminated; zero when the backend call fails.
    async fn terminate(&self, snapshot: &FleetSnapshot, mut hosts: Vec<&Host>, decrement_desired: bool) -> usize {
        if hosts.is_empty() {
            return 0;
        }
        if hosts.len() > self.settings.max_terminate_batch {
            info!(
                requested = hosts.len(),
                batch = self.settings.max_terminate_batch,
                "too many hosts to terminate at once, truncating batch"
            );
            hosts.truncate(self.settings.max_terminate_batch);
        }

        let refs: Vec<HostRef> = hosts.iter().map(|h| h.host_ref()).collect();
        let group = &snapshot.group().name;
        match self
            .backend
            .terminate_and_detach(group, &refs, decrement_desired)
            .await
        {
            Ok(()) => {
                info!(
                    %group,
                    count = refs.len(),
                    decrement_desired,
                    instances = ?refs.iter().map(|r| r.instance_id.as_str()).collect::<Vec<_>>(),
                    "terminated hosts"
                );
                refs.len()
            }
            Err(e) => {
                error!(%group, count = refs.len(), error = %e, "terminating hosts failed");
                0
            }
        }
    }
}

/// Idle hosts that can be terminated without dropping the fleet's free
/// memory below `free_ratio`. Never selects every usable host.
///
/// `reserved_memory` is promised to future work and does not count as free.
pub fn select_to_terminate(snapshot: &FleetSnapshot, reserved_memory: u64, free_ratio: f64) -> Vec<&Host> {
    let mut candidates: Vec<&Host> = snapshot.unused_stale().chain(snapshot.unused_fresh()).collect();
    if candidates.is_empty() {
        return candidates;
    }
    if candidates.len() == snapshot.usable_count() {
        candidates.remove(0);
        return candidates;
    }

    let terminating: HashSet<HostKey> = candidates.iter().map(|h| h.key()).collect();
    let (free, mut capacity) = snapshot
        .usable()
        .filter(|h| !terminating.contains(&h.key()))
        .fold((0u64, 0u64), |(free, cap), h| {
            (free + u64::from(h.remaining_memory), cap + u64::from(h.registered_memory))
        });
    let mut free = free.saturating_sub(reserved_memory);

    let ratio = |free: u64, capacity: u64| {
        if capacity == 0 {
            0.0
        } else {
            free as f64 / capacity as f64
        }
    };
    while ratio(free, capacity) < free_ratio && !candidates.is_empty() {
        let kept = candidates.remove(0);
        free += u64::from(kept.registered_memory);
        capacity += u64::from(kept.registered_memory);
    }
    candidates
}

/// Hosts to add for the unmet demand, sized by the smallest usable host
/// (or `fallback` when there is none). At least one.
pub fn hosts_needed(snapshot: &FleetSnapshot, demand: &Demand, fallback: &InstanceProfile) -> u64 {
    let min_cpu = snapshot
        .usable()
        .map(|h| h.registered_cpu)
        .filter(|&c| c > 0)
        .min()
        .unwrap_or(fallback.cpu);
    let min_memory = snapshot
        .usable()
        .map(|h| h.registered_memory)
        .filter(|&m| m > 0)
        .min()
        .unwrap_or(fallback.memory);

    let by_cpu = demand.lacking_cpu.div_ceil(u64::from(min_cpu.max(1)));
    let by_memory = demand.lacking_memory.div_ceil(u64::from(min_memory.max(1)));
    by_cpu.max(by_memory).max(1)
}
