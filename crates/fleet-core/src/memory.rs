//! In-memory fleet backend and event sink.
//!
//! Simulates one cluster with its fleet group and VMs. Every mutating call
//! is recorded so tests can assert on what the scheduler asked for, and any
//! operation can be made to fail on demand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{EventSink, FleetBackend, FleetEvent};
use crate::error::{FleetError, FleetResult};
use crate::types::{
    ContainerInstanceInfo, FleetGroupInfo, HostRef, HostStatus, InstanceProfile, PlacementResult,
    SchedulingRequest, VmInfo,
};

/// Backend operations, used to select which calls fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListClusterMembers,
    DescribeInstances,
    DescribeFleetGroup,
    ScaleTo,
    SuspendProcess,
    TerminateAndDetach,
    TerminateInstances,
    StartTask,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::ListClusterMembers => "list_cluster_members",
            Operation::DescribeInstances => "describe_instances",
            Operation::DescribeFleetGroup => "describe_fleet_group",
            Operation::ScaleTo => "scale_to",
            Operation::SuspendProcess => "suspend_process",
            Operation::TerminateAndDetach => "terminate_and_detach",
            Operation::TerminateInstances => "terminate_instances",
            Operation::StartTask => "start_task",
        }
    }
}

/// A mutating call observed by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    ScaleTo {
        desired: u32,
    },
    SuspendProcess {
        process: String,
    },
    TerminateAndDetach {
        instance_ids: Vec<String>,
        decrement_desired: bool,
    },
    TerminateInstances {
        instance_ids: Vec<String>,
    },
    StartTask {
        instance_id: String,
        result_id: String,
        task_definition: String,
        payload: serde_json::Value,
    },
}

#[derive(Debug)]
struct State {
    members: Vec<ContainerInstanceInfo>,
    vms: HashMap<String, VmInfo>,
    group: FleetGroupInfo,
    calls: Vec<BackendCall>,
    failing: HashSet<Operation>,
    start_failures: Vec<String>,
    provision: Option<InstanceProfile>,
    provision_at: u64,
    next_id: u64,
}

/// Thread-safe in-memory fleet.
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
}

impl InMemoryBackend {
    /// An empty fleet whose group may grow to `max_size`.
    pub fn new(group: impl Into<String>, max_size: u32) -> Self {
        let state = State {
            members: Vec::new(),
            vms: HashMap::new(),
            group: FleetGroupInfo {
                name: group.into(),
                min_size: 0,
                max_size,
                desired_capacity: 0,
                member_instance_ids: Vec::new(),
                suspended_processes: Vec::new(),
            },
            calls: Vec::new(),
            failing: HashSet::new(),
            start_failures: Vec::new(),
            provision: None,
            provision_at: 0,
            next_id: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Adds a registered, connected, active host that belongs to the group.
    /// Returns its instance id.
    pub fn add_host(&self, profile: &InstanceProfile, used_cpu: u32, used_memory: u32, launch_time: u64) -> String {
        let mut state = self.state.lock();
        let instance_id = state.next_instance_id();
        let member = ContainerInstanceInfo {
            node_id: format!("ci-{instance_id}"),
            instance_id: instance_id.clone(),
            status: HostStatus::Active,
            agent_connected: true,
            registered_cpu: Some(profile.cpu),
            registered_memory: Some(profile.memory),
            remaining_cpu: Some(profile.cpu.saturating_sub(used_cpu)),
            remaining_memory: Some(profile.memory.saturating_sub(used_memory)),
        };
        state.register(member, &profile.name, launch_time, true);
        instance_id
    }

    /// Adds a fully specified cluster member, with a VM and optional group
    /// membership.
    pub fn add_member(&self, member: ContainerInstanceInfo, instance_type: &str, launch_time: u64, in_group: bool) {
        self.state
            .lock()
            .register(member, instance_type, launch_time, in_group);
    }

    /// Adds a group VM that never registered with the cluster.
    pub fn add_unregistered_vm(&self, instance_type: &str, launch_time: u64) -> String {
        let mut state = self.state.lock();
        let instance_id = state.next_instance_id();
        state.vms.insert(
            instance_id.clone(),
            VmInfo {
                instance_id: instance_id.clone(),
                instance_type: instance_type.to_string(),
                launch_time,
            },
        );
        state.group.member_instance_ids.push(instance_id.clone());
        state.group.desired_capacity += 1;
        instance_id
    }

    /// Flips the agent-connected flag of a member.
    pub fn set_agent_connected(&self, instance_id: &str, connected: bool) {
        let mut state = self.state.lock();
        if let Some(m) = state.members.iter_mut().find(|m| m.instance_id == instance_id) {
            m.agent_connected = connected;
        }
    }

    pub fn set_status(&self, instance_id: &str, status: HostStatus) {
        let mut state = self.state.lock();
        if let Some(m) = state.members.iter_mut().find(|m| m.instance_id == instance_id) {
            m.status = status;
        }
    }

    /// Frees all capacity on a member, as if its tasks finished.
    pub fn release_all(&self, instance_id: &str) {
        let mut state = self.state.lock();
        if let Some(m) = state.members.iter_mut().find(|m| m.instance_id == instance_id) {
            m.remaining_cpu = m.registered_cpu;
            m.remaining_memory = m.registered_memory;
        }
    }

    pub fn set_desired_capacity(&self, desired: u32) {
        self.state.lock().group.desired_capacity = desired;
    }

    /// Makes `op` fail until [`InMemoryBackend::clear_failures`].
    pub fn fail_on(&self, op: Operation) {
        self.state.lock().failing.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Failure reasons every subsequent `start_task` reports.
    pub fn set_start_failures(&self, reasons: Vec<String>) {
        self.state.lock().start_failures = reasons;
    }

    /// When set, `scale_to` launches and registers hosts of `profile`
    /// (launched at `launch_time`) up to the new desired capacity.
    pub fn auto_provision(&self, profile: InstanceProfile, launch_time: u64) {
        let mut state = self.state.lock();
        state.provision = Some(profile);
        state.provision_at = launch_time;
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn group(&self) -> FleetGroupInfo {
        self.state.lock().group.clone()
    }

    pub fn members(&self) -> Vec<ContainerInstanceInfo> {
        self.state.lock().members.clone()
    }

    /// Desired capacities passed to `scale_to`, in call order.
    pub fn scale_requests(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::ScaleTo { desired } => Some(desired),
                _ => None,
            })
            .collect()
    }

    /// Instance ids passed to `terminate_and_detach` with the decrement flag.
    pub fn detached(&self) -> Vec<(String, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::TerminateAndDetach {
                    instance_ids,
                    decrement_desired,
                } => Some(
                    instance_ids
                        .into_iter()
                        .map(move |id| (id, decrement_desired))
                        .collect::<Vec<_>>(),
                ),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn check(&self, op: Operation) -> FleetResult<()> {
        if self.state.lock().failing.contains(&op) {
            return Err(FleetError::backend(op.name(), "injected failure"));
        }
        Ok(())
    }
}

impl State {
    fn next_instance_id(&mut self) -> String {
        self.next_id += 1;
        format!("i-{:06}", self.next_id)
    }

    fn register(&mut self, member: ContainerInstanceInfo, instance_type: &str, launch_time: u64, in_group: bool) {
        self.vms.insert(
            member.instance_id.clone(),
            VmInfo {
                instance_id: member.instance_id.clone(),
                instance_type: instance_type.to_string(),
                launch_time,
            },
        );
        if in_group {
            self.group.member_instance_ids.push(member.instance_id.clone());
            self.group.desired_capacity += 1;
        }
        self.members.push(member);
    }

    fn remove_instance(&mut self, instance_id: &str) {
        self.members.retain(|m| m.instance_id != instance_id);
        self.vms.remove(instance_id);
        self.group.member_instance_ids.retain(|id| id != instance_id);
    }
}

#[async_trait]
impl FleetBackend for InMemoryBackend {
    async fn list_cluster_members(&self, _cluster: &str) -> FleetResult<Vec<ContainerInstanceInfo>> {
        self.check(Operation::ListClusterMembers)?;
        Ok(self.members())
    }

    async fn describe_instances(&self, instance_ids: &[String]) -> FleetResult<Vec<VmInfo>> {
        self.check(Operation::DescribeInstances)?;
        let state = self.state.lock();
        Ok(instance_ids
            .iter()
            .filter_map(|id| state.vms.get(id).cloned())
            .collect())
    }

    async fn describe_fleet_group(&self, group: &str) -> FleetResult<FleetGroupInfo> {
        self.check(Operation::DescribeFleetGroup)?;
        let state = self.state.lock();
        if state.group.name != group {
            return Err(FleetError::NotFound(format!("fleet group {group}")));
        }
        Ok(state.group.clone())
    }

    async fn scale_to(&self, _group: &str, desired: u32) -> FleetResult<()> {
        self.check(Operation::ScaleTo)?;
        let mut state = self.state.lock();
        state.calls.push(BackendCall::ScaleTo { desired });
        state.group.desired_capacity = desired.min(state.group.max_size);

        if let Some(profile) = state.provision.clone() {
            let launch_time = state.provision_at;
            while (state.group.member_instance_ids.len() as u32) < state.group.desired_capacity {
                let instance_id = state.next_instance_id();
                let member = ContainerInstanceInfo {
                    node_id: format!("ci-{instance_id}"),
                    instance_id: instance_id.clone(),
                    status: HostStatus::Active,
                    agent_connected: true,
                    registered_cpu: Some(profile.cpu),
                    registered_memory: Some(profile.memory),
                    remaining_cpu: Some(profile.cpu),
                    remaining_memory: Some(profile.memory),
                };
                state.vms.insert(
                    instance_id.clone(),
                    VmInfo {
                        instance_id: instance_id.clone(),
                        instance_type: profile.name.clone(),
                        launch_time,
                    },
                );
                state.group.member_instance_ids.push(instance_id.clone());
                state.members.push(member);
                debug!(%instance_id, "provisioned simulated host");
            }
        }
        Ok(())
    }

    async fn suspend_process(&self, _group: &str, process: &str) -> FleetResult<()> {
        self.check(Operation::SuspendProcess)?;
        let mut state = self.state.lock();
        state.calls.push(BackendCall::SuspendProcess {
            process: process.to_string(),
        });
        if !state.group.is_suspended(process) {
            state.group.suspended_processes.push(process.to_string());
        }
        Ok(())
    }

    async fn terminate_and_detach(
        &self,
        _group: &str,
        hosts: &[HostRef],
        decrement_desired: bool,
    ) -> FleetResult<()> {
        self.check(Operation::TerminateAndDetach)?;
        let mut state = self.state.lock();
        let instance_ids: Vec<String> = hosts.iter().map(|h| h.instance_id.clone()).collect();
        state.calls.push(BackendCall::TerminateAndDetach {
            instance_ids: instance_ids.clone(),
            decrement_desired,
        });
        for id in &instance_ids {
            state.remove_instance(id);
        }
        if decrement_desired {
            let n = instance_ids.len() as u32;
            state.group.desired_capacity = state.group.desired_capacity.saturating_sub(n);
        }
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> FleetResult<()> {
        self.check(Operation::TerminateInstances)?;
        let mut state = self.state.lock();
        state.calls.push(BackendCall::TerminateInstances {
            instance_ids: instance_ids.to_vec(),
        });
        for id in instance_ids {
            state.remove_instance(id);
        }
        Ok(())
    }

    async fn start_task(
        &self,
        _cluster: &str,
        host: &HostRef,
        request: &SchedulingRequest,
        task_definition: &str,
    ) -> FleetResult<PlacementResult> {
        self.check(Operation::StartTask)?;
        let mut state = self.state.lock();
        state.calls.push(BackendCall::StartTask {
            instance_id: host.instance_id.clone(),
            result_id: request.result_id.clone(),
            task_definition: task_definition.to_string(),
            payload: request.payload.clone(),
        });
        let failures = state.start_failures.clone();
        let task_ref = if failures.is_empty() {
            state.next_id += 1;
            Some(format!("task-{}", state.next_id))
        } else {
            None
        };
        Ok(PlacementResult {
            node_id: host.node_id.clone(),
            instance_id: host.instance_id.clone(),
            task_ref,
            failures,
        })
    }
}

/// Event sink that keeps every event for later inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<FleetEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FleetEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: FleetEvent) {
        self.events.lock().push(event);
    }
}
