//! `fleet.toml` configuration parser.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. Durations are written as strings such as `"30s"`,
//! `"8m"`, `"1h"`, or `"7d"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};
use crate::types::InstanceProfile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub cluster: ClusterConfig,
    pub scheduler: SchedulerConfig,
    pub fleet: HostsConfig,
    pub scaling: ScalingConfig,
    /// Instance catalogue; the largest entry bounds what a request may ask for.
    pub instances: Vec<InstanceProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Container cluster name.
    pub name: String,
    /// Auto-scaling group backing the cluster.
    pub fleet_group: String,
    /// Task definition used for build agents.
    pub task_definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long the worker waits for a request before running a scale-down check.
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    /// Age after which an unclaimed future reservation is dropped.
    #[serde(with = "duration_str")]
    pub reservation_timeout: Duration,
    /// Smallest container worth provisioning for; shortfall below this resets.
    pub min_container_cpu: u32,
    pub min_container_memory: u32,
    /// Prefer the emptiest host while demand is outstanding.
    pub spread_on_overflow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostsConfig {
    /// Hosts older than this are no longer eligible for new work.
    #[serde(with = "duration_str")]
    pub stale_period: Duration,
    /// How long a fleet VM may stay unregistered before it counts as lonely.
    #[serde(with = "duration_str")]
    pub lonely_grace_period: Duration,
    /// Tail of each billed hour in which idle fresh hosts are reclaimed.
    /// Zero disables reclaiming fresh hosts.
    pub minutes_before_billing_cycle: u32,
    /// Fleet-group process to keep suspended.
    pub rebalance_process: String,
    /// How many lonely-instance reports to remember for deduplication.
    pub lonely_report_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Minimum share of free memory the fleet keeps after scale-down.
    pub free_capacity_ratio: f64,
    /// Upper bound on hosts terminated in one scale-down.
    pub max_terminate_batch: usize,
    /// How long an agent may stay disconnected before its host is purged.
    #[serde(with = "duration_str")]
    pub disconnected_timeout: Duration,
    /// Profile used to size scale-up when no usable host exists.
    pub default_instance: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "build-agents".to_string(),
            fleet_group: "build-agents-fleet".to_string(),
            task_definition: "build-agent".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(8 * 60),
            reservation_timeout: Duration::from_secs(40 * 60),
            min_container_cpu: 1024,
            min_container_memory: 4000,
            spread_on_overflow: false,
        }
    }
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            stale_period: Duration::from_secs(7 * 24 * 3600),
            lonely_grace_period: Duration::from_secs(5 * 60),
            minutes_before_billing_cycle: 10,
            rebalance_process: "AZRebalance".to_string(),
            lonely_report_capacity: 50,
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            free_capacity_ratio: 0.30,
            max_terminate_batch: 15,
            disconnected_timeout: Duration::from_secs(20 * 60),
            default_instance: InstanceProfile::fallback().name,
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> FleetResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Like [`FleetConfig::from_file`], but a missing file yields defaults.
    pub fn from_file_or_default(path: &Path) -> FleetResult<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> FleetResult<Self> {
        let mut config: FleetConfig = toml::from_str(content)?;
        if config.instances.is_empty() {
            config.instances = InstanceProfile::default_catalogue();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> FleetResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> FleetResult<()> {
        let ratio = self.scaling.free_capacity_ratio;
        if !(0.0..1.0).contains(&ratio) {
            return Err(FleetError::Config(format!(
                "scaling.free_capacity_ratio must be in [0, 1), got {ratio}"
            )));
        }
        if self.scaling.max_terminate_batch == 0 {
            return Err(FleetError::Config(
                "scaling.max_terminate_batch must be at least 1".to_string(),
            ));
        }
        if self.fleet.minutes_before_billing_cycle >= 60 {
            return Err(FleetError::Config(format!(
                "fleet.minutes_before_billing_cycle must be below 60, got {}",
                self.fleet.minutes_before_billing_cycle
            )));
        }
        if self.scheduler.poll_interval.is_zero() {
            return Err(FleetError::Config(
                "scheduler.poll_interval must be positive".to_string(),
            ));
        }
        if !self.instances.is_empty()
            && !self
                .instances
                .iter()
                .any(|p| p.name == self.scaling.default_instance)
        {
            return Err(FleetError::Config(format!(
                "scaling.default_instance {:?} is not in the instance catalogue",
                self.scaling.default_instance
            )));
        }
        Ok(())
    }

    /// The catalogue, or the built-in one when none is configured.
    pub fn catalogue(&self) -> Vec<InstanceProfile> {
        if self.instances.is_empty() {
            InstanceProfile::default_catalogue()
        } else {
            self.instances.clone()
        }
    }

    /// Profile the fleet group launches; sizes scale-up and bounds requests
    /// while the fleet has no fresh host.
    pub fn default_profile(&self) -> InstanceProfile {
        self.catalogue()
            .into_iter()
            .find(|p| p.name == self.scaling.default_instance)
            .unwrap_or_else(InstanceProfile::fallback)
    }
}

/// Parse a duration string like `"30s"`, `"8m"`, `"2h"`, or `"7d"`.
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> FleetResult<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&s[..idx], c),
        _ => (s, 's'),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| FleetError::InvalidDuration(s.to_string()))?;
    let scale: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => return Err(FleetError::InvalidDuration(s.to_string())),
    };
    let secs = value
        .checked_mul(scale)
        .ok_or_else(|| FleetError::InvalidDuration(s.to_string()))?;
    Ok(Duration::from_secs(secs))
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0 => "0s".to_string(),
        s if s % 86400 == 0 => format!("{}d", s / 86400),
        s if s % 3600 == 0 => format!("{}h", s / 3600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(480));
        assert_eq!(config.scheduler.reservation_timeout, Duration::from_secs(2400));
        assert_eq!(config.fleet.stale_period, Duration::from_secs(7 * 86400));
        assert_eq!(config.fleet.minutes_before_billing_cycle, 10);
        assert_eq!(config.scaling.max_terminate_batch, 15);
        assert_eq!(config.instances.len(), 7);
        assert_eq!(config.default_profile(), InstanceProfile::fallback());
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[cluster]
name = "ci"
fleet_group = "ci-agents"

[scheduler]
poll_interval = "30s"
spread_on_overflow = true

[scaling]
free_capacity_ratio = 0.5
disconnected_timeout = "1h"
default_instance = "small"

[[instances]]
name = "small"
cpu = 2048
memory = 8000

[[instances]]
name = "large"
cpu = 8192
memory = 32000
"#;
        let config = FleetConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.cluster.name, "ci");
        assert_eq!(config.cluster.task_definition, "build-agent");
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(30));
        assert!(config.scheduler.spread_on_overflow);
        assert_eq!(config.scaling.disconnected_timeout, Duration::from_secs(3600));
        assert_eq!(config.default_profile().cpu, 2048);
    }

    #[test]
    fn rejects_unknown_default_instance() {
        let toml = r#"
[scaling]
default_instance = "nope"
"#;
        assert!(matches!(
            FleetConfig::from_toml_str(toml),
            Err(FleetError::Config(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_ratio() {
        let toml = "[scaling]\nfree_capacity_ratio = 1.5\n";
        assert!(FleetConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn rejects_bad_duration() {
        let toml = "[scheduler]\npoll_interval = \"soon\"\n";
        assert!(matches!(
            FleetConfig::from_toml_str(toml),
            Err(FleetError::Parse(_))
        ));
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604800));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("10y").is_err());
        assert!(parse_duration("").is_err());
        assert!(matches!(
            parse_duration("300000000000000000d"),
            Err(FleetError::InvalidDuration(_))
        ));
    }

    #[test]
    fn overflowing_duration_is_a_config_error() {
        let result = FleetConfig::from_toml_str("[scheduler]\npoll_interval = \"300000000000000000d\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn format_duration_uses_largest_exact_unit() {
        assert_eq!(format_duration(Duration::from_secs(604800)), "7d");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(480)), "8m");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
    }

    #[test]
    fn toml_output_parses_back() {
        let config = FleetConfig::from_toml_str("").unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("poll_interval = \"8m\""));
        let reparsed = FleetConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed, config);
    }
}
