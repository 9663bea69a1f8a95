//! Builds a [`FleetSnapshot`] from the backend.
//!
//! Besides joining cluster members with their VMs, the loader keeps the
//! fleet group's rebalancing process suspended (it kills running agents)
//! and terminates group VMs that never managed to join the cluster.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{Clock, EventSink, FleetBackend, FleetConfig, FleetEvent, FleetGroupInfo, FleetResult, VmInfo};
use fleet_placement::{FleetSnapshot, Host, SnapshotSettings};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct LoaderSettings {
    pub cluster: String,
    pub fleet_group: String,
    pub snapshot: SnapshotSettings,
    /// Unregistered group VMs younger than this are still booting.
    pub lonely_grace_period: Duration,
    pub rebalance_process: String,
    pub lonely_report_capacity: usize,
}

impl From<&FleetConfig> for LoaderSettings {
    fn from(config: &FleetConfig) -> Self {
        Self {
            cluster: config.cluster.name.clone(),
            fleet_group: config.cluster.fleet_group.clone(),
            snapshot: (&config.fleet).into(),
            lonely_grace_period: config.fleet.lonely_grace_period,
            rebalance_process: config.fleet.rebalance_process.clone(),
            lonely_report_capacity: config.fleet.lonely_report_capacity,
        }
    }
}

impl LoaderSettings {
    /// Lonely VMs older than this are left alone: the billing-window
    /// heuristics handle them from here on.
    fn lonely_ceiling(&self) -> Duration {
        let minutes = 60u64.saturating_sub(u64::from(self.snapshot.minutes_before_billing_cycle));
        Duration::from_secs(minutes * 60)
    }
}

pub struct ModelLoader {
    backend: Arc<dyn FleetBackend>,
    events: Arc<dyn EventSink>,
    settings: LoaderSettings,
    clock: Clock,
    /// Recently reported lonely VMs, oldest first.
    reported_lonely: VecDeque<String>,
}

impl ModelLoader {
    pub fn new(
        backend: Arc<dyn FleetBackend>,
        events: Arc<dyn EventSink>,
        settings: LoaderSettings,
        clock: Clock,
    ) -> Self {
        Self {
            backend,
            events,
            settings,
            clock,
            reported_lonely: VecDeque::new(),
        }
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    pub fn reported_lonely(&self) -> impl Iterator<Item = &str> {
        self.reported_lonely.iter().map(String::as_str)
    }

    /// Load the current fleet. Any backend read failure fails the load.
    pub async fn load(&mut self) -> FleetResult<FleetSnapshot> {
        let now = (self.clock)();
        let group = self
            .backend
            .describe_fleet_group(&self.settings.fleet_group)
            .await?;
        self.ensure_rebalance_suspended(&group).await?;

        let members = self
            .backend
            .list_cluster_members(&self.settings.cluster)
            .await?;
        let registered: HashSet<&str> = members.iter().map(|m| m.instance_id.as_str()).collect();
        let all_ids: Vec<String> = registered
            .iter()
            .copied()
            .chain(group.member_instance_ids.iter().map(String::as_str))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect();
        let vms: HashMap<String, VmInfo> = self
            .backend
            .describe_instances(&all_ids)
            .await?
            .into_iter()
            .map(|vm| (vm.instance_id.clone(), vm))
            .collect();

        let mut hosts = Vec::with_capacity(members.len());
        for member in &members {
            let Some(vm) = vms.get(&member.instance_id) else {
                debug!(instance = %member.instance_id, "container instance without VM, skipping");
                continue;
            };
            match Host::from_cluster(member, vm, group.contains(&member.instance_id)) {
                Ok(host) => hosts.push(host),
                Err(e) => error!(instance = %member.instance_id, error = %e, "skipping incomplete host"),
            }
        }

        let unregistered: Vec<&VmInfo> = group
            .member_instance_ids
            .iter()
            .filter(|id| !registered.contains(id.as_str()))
            .filter_map(|id| vms.get(id))
            .collect();
        if group.member_instance_ids.iter().any(|id| !registered.contains(id.as_str())) {
            warn!(
                group_instances = group.member_instance_ids.len(),
                cluster_instances = members.len(),
                "fleet group and cluster disagree on instance count"
            );
        }
        let lonely: Vec<VmInfo> = unregistered
            .into_iter()
            .filter(|vm| self.is_lonely(vm, now))
            .cloned()
            .collect();
        self.report_lonely(lonely).await;

        Ok(FleetSnapshot::new(
            self.settings.cluster.clone(),
            group,
            hosts,
            self.settings.snapshot,
            now,
        ))
    }

    async fn ensure_rebalance_suspended(&self, group: &FleetGroupInfo) -> FleetResult<()> {
        let process = &self.settings.rebalance_process;
        if group.is_suspended(process) {
            return Ok(());
        }
        self.backend.suspend_process(&group.name, process).await?;
        info!(group = %group.name, %process, "suspended fleet group process");
        Ok(())
    }

    fn is_lonely(&self, vm: &VmInfo, now: u64) -> bool {
        let lifespan = now.saturating_sub(vm.launch_time);
        lifespan > self.settings.lonely_grace_period.as_secs()
            && lifespan < self.settings.lonely_ceiling().as_secs()
    }

    async fn report_lonely(&mut self, lonely: Vec<VmInfo>) {
        for vm in lonely {
            if self.reported_lonely.contains(&vm.instance_id) {
                continue;
            }
            self.events.publish(FleetEvent::StaleOrphanInstance {
                instance_id: vm.instance_id.clone(),
                launch_time: vm.launch_time,
            });
            self.reported_lonely.push_back(vm.instance_id.clone());
            while self.reported_lonely.len() > self.settings.lonely_report_capacity {
                self.reported_lonely.pop_front();
            }
            match self
                .backend
                .terminate_instances(std::slice::from_ref(&vm.instance_id))
                .await
            {
                Ok(()) => info!(instance = %vm.instance_id, "terminated fleet instance that never joined the cluster"),
                Err(e) => warn!(instance = %vm.instance_id, error = %e, "failed to terminate lonely instance"),
            }
        }
    }
}
