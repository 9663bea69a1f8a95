//! Interfaces to the container cluster, the compute API, and the event bus.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::FleetResult;
use crate::types::{ContainerInstanceInfo, FleetGroupInfo, HostRef, PlacementResult, SchedulingRequest, VmInfo};

/// Trait for fleet backends.
///
/// Read calls are idempotent. Mutating calls may fail; the scheduler logs
/// and swallows those failures and relies on the next pass to converge.
#[async_trait]
pub trait FleetBackend: Send + Sync {
    /// Lists every container instance registered in the cluster.
    async fn list_cluster_members(&self, cluster: &str) -> FleetResult<Vec<ContainerInstanceInfo>>;

    /// Describes the VMs with the given ids. Unknown ids are omitted.
    async fn describe_instances(&self, instance_ids: &[String]) -> FleetResult<Vec<VmInfo>>;

    /// Describes the fleet group backing the cluster.
    async fn describe_fleet_group(&self, group: &str) -> FleetResult<FleetGroupInfo>;

    /// Sets the fleet group's desired capacity.
    async fn scale_to(&self, group: &str, desired: u32) -> FleetResult<()>;

    /// Suspends a fleet-group automation process such as `AZRebalance`.
    async fn suspend_process(&self, group: &str, process: &str) -> FleetResult<()>;

    /// Detaches hosts from the fleet group and terminates them. With
    /// `decrement_desired` the group shrinks; without it the group replaces them.
    async fn terminate_and_detach(
        &self,
        group: &str,
        hosts: &[HostRef],
        decrement_desired: bool,
    ) -> FleetResult<()>;

    /// Terminates VMs directly, bypassing the fleet group.
    async fn terminate_instances(&self, instance_ids: &[String]) -> FleetResult<()>;

    /// Starts one task for `request` on the given host from the named task
    /// definition.
    async fn start_task(
        &self,
        cluster: &str,
        host: &HostRef,
        request: &SchedulingRequest,
        task_definition: &str,
    ) -> FleetResult<PlacementResult>;
}

/// Operational events emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetEvent {
    /// A fleet-group VM that never registered with the cluster.
    StaleOrphanInstance { instance_id: String, launch_time: u64 },
    /// Hosts whose container agent is currently disconnected.
    DisconnectedAgents { instance_ids: Vec<String> },
    /// Hosts terminated after staying disconnected past the timeout.
    DisconnectedAgentsPurged { instance_ids: Vec<String> },
}

/// Fire-and-forget sink for [`FleetEvent`]s.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: FleetEvent);
}

/// Sink that writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: FleetEvent) {
        match &event {
            FleetEvent::StaleOrphanInstance {
                instance_id,
                launch_time,
            } => warn!(%instance_id, launch_time, "fleet instance never joined the cluster"),
            FleetEvent::DisconnectedAgents { instance_ids } => {
                warn!(count = instance_ids.len(), ?instance_ids, "container agents disconnected")
            }
            FleetEvent::DisconnectedAgentsPurged { instance_ids } => {
                info!(count = instance_ids.len(), ?instance_ids, "disconnected hosts purged")
            }
        }
    }
}
