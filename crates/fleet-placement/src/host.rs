//! A single fleet host as seen during one scheduling pass.

use std::time::Duration;

use fleet_core::{ContainerInstanceInfo, FleetError, FleetResult, HostRef, HostStatus, VmInfo};
use serde::Serialize;

const BILLING_CYCLE_SECS: u64 = 3600;

/// Registered and remaining capacity of one VM running a container agent.
///
/// Remaining capacity is a working copy: the scheduler debits it as it
/// places requests within a pass, and it is thrown away afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Host {
    pub node_id: String,
    pub instance_id: String,
    pub instance_type: String,
    pub registered_cpu: u32,
    pub registered_memory: u32,
    pub remaining_cpu: u32,
    pub remaining_memory: u32,
    /// Unix timestamp of the VM launch.
    pub launch_time: u64,
    pub agent_connected: bool,
    pub in_fleet_group: bool,
    pub status: HostStatus,
}

/// Identity of a host across passes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HostKey {
    pub node_id: String,
    pub instance_id: String,
    pub launch_time: u64,
}

impl Host {
    /// Build a host from a cluster member and its VM.
    ///
    /// Fails with [`FleetError::MissingResource`] when the member does not
    /// report CPU or memory.
    pub fn from_cluster(member: &ContainerInstanceInfo, vm: &VmInfo, in_fleet_group: bool) -> FleetResult<Self> {
        let missing = |resource: &'static str| FleetError::MissingResource {
            node_id: member.node_id.clone(),
            resource,
        };
        let registered_cpu = member.registered_cpu.ok_or_else(|| missing("registered CPU"))?;
        let registered_memory = member
            .registered_memory
            .ok_or_else(|| missing("registered memory"))?;
        let remaining_cpu = member.remaining_cpu.ok_or_else(|| missing("remaining CPU"))?;
        let remaining_memory = member
            .remaining_memory
            .ok_or_else(|| missing("remaining memory"))?;

        Ok(Self {
            node_id: member.node_id.clone(),
            instance_id: member.instance_id.clone(),
            instance_type: vm.instance_type.clone(),
            registered_cpu,
            registered_memory,
            remaining_cpu: remaining_cpu.min(registered_cpu),
            remaining_memory: remaining_memory.min(registered_memory),
            launch_time: vm.launch_time,
            agent_connected: member.agent_connected,
            in_fleet_group,
            status: member.status,
        })
    }

    pub fn can_run(&self, cpu: u32, memory: u32) -> bool {
        cpu <= self.remaining_cpu && memory <= self.remaining_memory
    }

    /// True when nothing is allocated on the host.
    pub fn running_nothing(&self) -> bool {
        self.remaining_cpu == self.registered_cpu && self.remaining_memory == self.registered_memory
    }

    pub fn is_draining(&self) -> bool {
        self.status == HostStatus::Draining
    }

    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.launch_time)
    }

    /// True within the last `minutes_before` minutes of the host's current
    /// billed hour. Zero minutes never matches.
    pub fn reaching_end_of_billing_cycle(&self, now: u64, minutes_before: u32) -> bool {
        let window = u64::from(minutes_before) * 60;
        if window == 0 {
            return false;
        }
        self.age_secs(now) % BILLING_CYCLE_SECS >= BILLING_CYCLE_SECS.saturating_sub(window)
    }

    /// Fresh hosts may receive new work: connected, still in the fleet
    /// group, younger than `stale_period`, and not draining.
    pub fn is_fresh(&self, now: u64, stale_period: Duration) -> bool {
        self.agent_connected
            && self.in_fleet_group
            && self.age_secs(now) < stale_period.as_secs()
            && !self.is_draining()
    }

    /// Subtract a placement from remaining capacity, saturating at zero.
    pub fn debit(&mut self, cpu: u32, memory: u32) {
        self.remaining_cpu = self.remaining_cpu.saturating_sub(cpu);
        self.remaining_memory = self.remaining_memory.saturating_sub(memory);
    }

    pub fn host_ref(&self) -> HostRef {
        HostRef {
            node_id: self.node_id.clone(),
            instance_id: self.instance_id.clone(),
        }
    }

    pub fn key(&self) -> HostKey {
        HostKey {
            node_id: self.node_id.clone(),
            instance_id: self.instance_id.clone(),
            launch_time: self.launch_time,
        }
    }
}
