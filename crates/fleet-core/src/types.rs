//! Shared domain types for the fleet scheduler.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Time ──────────────────────────────────────────────────────────

/// Source of "now" in epoch seconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Current unix timestamp in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Wall clock backed by [`epoch_secs`].
pub fn system_clock() -> Clock {
    Arc::new(epoch_secs)
}

/// A clock frozen at `at`, for deterministic tests and simulations.
pub fn fixed_clock(at: u64) -> Clock {
    Arc::new(move || at)
}

// ── Cluster inputs ────────────────────────────────────────────────

/// Lifecycle status of a registered container instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostStatus {
    Active,
    Draining,
    Inactive,
}

/// A container instance as reported by the cluster.
///
/// Resource fields are optional because the cluster API reports them as a
/// loose attribute list; a missing one makes the host unusable for a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInstanceInfo {
    /// Cluster-side identity (container-instance ARN).
    pub node_id: String,
    /// Backing VM id.
    pub instance_id: String,
    pub status: HostStatus,
    pub agent_connected: bool,
    pub registered_cpu: Option<u32>,
    /// Registered memory in MB.
    pub registered_memory: Option<u32>,
    pub remaining_cpu: Option<u32>,
    /// Remaining memory in MB.
    pub remaining_memory: Option<u32>,
}

/// A virtual machine as reported by the compute API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub instance_id: String,
    pub instance_type: String,
    /// Unix timestamp of the VM launch.
    pub launch_time: u64,
}

/// The auto-scaling group backing one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetGroupInfo {
    pub name: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    pub member_instance_ids: Vec<String>,
    pub suspended_processes: Vec<String>,
}

impl FleetGroupInfo {
    pub fn contains(&self, instance_id: &str) -> bool {
        self.member_instance_ids.iter().any(|id| id == instance_id)
    }

    pub fn is_suspended(&self, process: &str) -> bool {
        self.suspended_processes.iter().any(|p| p == process)
    }
}

/// Identity of a host passed to mutating backend calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostRef {
    pub node_id: String,
    pub instance_id: String,
}

// ── Instance catalogue ────────────────────────────────────────────

/// A VM size the fleet can be built from. CPU in units of 1/1024 core,
/// memory in MB as the container agent registers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProfile {
    pub name: String,
    pub cpu: u32,
    pub memory: u32,
}

impl InstanceProfile {
    pub fn new(name: impl Into<String>, cpu: u32, memory: u32) -> Self {
        Self {
            name: name.into(),
            cpu,
            memory,
        }
    }

    /// The profile assumed when the fleet has no usable hosts to measure.
    pub fn fallback() -> Self {
        Self::new("m4.4xlarge", 16384, 64419)
    }

    /// Instance sizes known to the scheduler out of the box.
    pub fn default_catalogue() -> Vec<Self> {
        vec![
            Self::new("m4.xlarge", 4096, 16050),
            Self::fallback(),
            Self::new("m4.10xlarge", 40960, 161186),
            Self::new("m4.16xlarge", 65536, 257955),
            Self::new("m5.12xlarge", 49152, 185198),
            Self::new("i3.8xlarge", 32768, 245731),
            Self::new("i3.16xlarge", 65536, 491683),
        ]
    }
}

// ── Requests ──────────────────────────────────────────────────────

/// A request to run one build-agent container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingRequest {
    pub id: Uuid,
    /// Build key; groups requests belonging to the same plan.
    pub group: String,
    /// Identifies the build result this agent will serve.
    pub result_id: String,
    pub cpu: u32,
    /// Memory in MB.
    pub memory: u32,
    /// Opaque task description forwarded to `start_task`.
    pub payload: serde_json::Value,
}

impl SchedulingRequest {
    pub fn new(group: impl Into<String>, result_id: impl Into<String>, cpu: u32, memory: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            group: group.into(),
            result_id: result_id.into(),
            cpu,
            memory,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Capacity promised to a build plan whose jobs have not been queued yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub group: String,
    /// Result ids whose placement consumes this reservation.
    pub result_ids: Vec<String>,
    pub cpu: u64,
    pub memory: u64,
    /// Unix timestamp of creation; stamped by the scheduler when zero.
    #[serde(default)]
    pub created_at: u64,
}

impl ReserveRequest {
    pub fn new(group: impl Into<String>, result_ids: Vec<String>, cpu: u64, memory: u64) -> Self {
        Self {
            group: group.into(),
            result_ids,
            cpu,
            memory,
            created_at: 0,
        }
    }
}

// ── Results ───────────────────────────────────────────────────────

/// What the backend reported after starting a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementResult {
    pub node_id: String,
    pub instance_id: String,
    /// Task handle, absent when the start was refused.
    pub task_ref: Option<String>,
    /// Failure reasons reported by the cluster, e.g. `RESOURCE:MEMORY`.
    pub failures: Vec<String>,
}

/// Classification of a [`PlacementResult`] for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementOutcome {
    Started { task_ref: Option<String> },
    /// Transient refusal; resubmit the request later.
    Retry(String),
    Failed(String),
}

impl PlacementResult {
    pub fn outcome(&self) -> PlacementOutcome {
        match self.failures.as_slice() {
            [] => PlacementOutcome::Started {
                task_ref: self.task_ref.clone(),
            },
            [only] if only.starts_with("RESOURCE") => {
                PlacementOutcome::Retry("Not enough resources available now.".to_string())
            }
            [only] if only == "AGENT" => PlacementOutcome::Retry(describe_failure(only)),
            many => PlacementOutcome::Failed(
                many.iter()
                    .map(|f| describe_failure(f))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
        }
    }
}

fn describe_failure(reason: &str) -> String {
    match reason {
        "AGENT" => "Container agent on the instance is disconnected.".to_string(),
        "ATTRIBUTE" => "No instance satisfies the task's placement attributes.".to_string(),
        r if r.starts_with("RESOURCE") => {
            let resource = r.split_once(':').map(|(_, name)| name).unwrap_or("resources");
            format!("Not enough {resource} available on the instance.")
        }
        other => format!("Unknown start-task reason: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(failures: &[&str]) -> PlacementResult {
        PlacementResult {
            node_id: "ci-1".to_string(),
            instance_id: "i-1".to_string(),
            task_ref: failures.is_empty().then(|| "task-1".to_string()),
            failures: failures.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn outcome_started_without_failures() {
        assert_eq!(
            result_with(&[]).outcome(),
            PlacementOutcome::Started {
                task_ref: Some("task-1".to_string())
            }
        );
    }

    #[test]
    fn single_resource_failure_is_retryable() {
        assert!(matches!(
            result_with(&["RESOURCE:MEMORY"]).outcome(),
            PlacementOutcome::Retry(_)
        ));
        assert!(matches!(
            result_with(&["AGENT"]).outcome(),
            PlacementOutcome::Retry(_)
        ));
    }

    #[test]
    fn multiple_failures_are_permanent() {
        match result_with(&["RESOURCE:CPU", "ATTRIBUTE"]).outcome() {
            PlacementOutcome::Failed(msg) => {
                assert!(msg.contains("Not enough CPU"));
                assert!(msg.contains("placement attributes"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn unknown_failure_is_described() {
        match result_with(&["MISSING"]).outcome() {
            PlacementOutcome::Failed(msg) => assert!(msg.contains("Unknown start-task reason: MISSING")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn catalogue_contains_fallback() {
        let catalogue = InstanceProfile::default_catalogue();
        assert!(catalogue.contains(&InstanceProfile::fallback()));
        assert_eq!(catalogue.iter().map(|p| p.cpu).max(), Some(65536));
    }

    #[test]
    fn fleet_group_membership() {
        let group = FleetGroupInfo {
            name: "agents".to_string(),
            min_size: 0,
            max_size: 10,
            desired_capacity: 2,
            member_instance_ids: vec!["i-1".to_string()],
            suspended_processes: vec!["AZRebalance".to_string()],
        };
        assert!(group.contains("i-1"));
        assert!(!group.contains("i-2"));
        assert!(group.is_suspended("AZRebalance"));
    }

    #[test]
    fn fixed_clock_is_frozen() {
        let clock = fixed_clock(42);
        assert_eq!(clock(), 42);
        assert_eq!(clock(), 42);
    }
}
