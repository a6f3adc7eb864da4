//! Declarative workload model: run-specs, containers, volumes, strategies.
//!
//! A run-spec is either an app (one implicit container, one task per
//! instance) or a pod (explicit containers, one task each). The types here
//! are plain data; validation lives in [`validation`], the group tree in
//! [`group`].

pub mod group;
pub mod path;
pub mod validation;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use group::Group;
pub use path::{PathError, PathId};

/// The unreserved resource role on the offer bus.
pub const UNRESERVED_ROLE: &str = "*";

// ---------------------------------------------------------------------------
// Run-spec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSpecKind {
    App,
    Pod,
}

impl fmt::Display for RunSpecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::App => "app",
            Self::Pod => "pod",
        })
    }
}

/// A versioned workload declaration.
///
/// `version` is the timestamp of the write that produced this revision;
/// versions are monotone per id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub id: PathId,
    pub kind: RunSpecKind,
    pub version: DateTime<Utc>,
    /// Desired instance count.
    pub instances: u32,
    /// The reservation role this service runs under.
    pub role: String,
    /// Exactly one container for an app; one task per container for a pod.
    pub containers: Vec<ContainerSpec>,
    pub volumes: Vec<VolumeSpec>,
    pub networks: Vec<Network>,
    pub constraints: Vec<Constraint>,
    pub upgrade_strategy: UpgradeStrategy,
    pub backoff: BackoffPolicy,
    pub readiness_checks: Vec<ReadinessCheck>,
    /// Other run-spec paths that must be deployed before this one.
    pub dependencies: Vec<PathId>,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    /// Roles whose offered resources this spec may consume; `None` falls
    /// back to the process-wide default behavior.
    pub accepted_resource_roles: Option<BTreeSet<String>>,
    /// When true, the declared host ports must be allocated verbatim.
    pub require_ports: bool,
    pub unreachable_strategy: UnreachableStrategy,
    /// Artifacts fetched before first launch; drives resolve-artifact steps.
    pub artifact_uris: Vec<String>,
}

impl RunSpec {
    /// Summed resource demand across all containers.
    pub fn total_resources(&self) -> Resources {
        let mut total = Resources::default();
        for c in &self.containers {
            total.add(&c.resources);
        }
        total
    }

    /// Host-port demands in declaration order across containers.
    ///
    /// `Some(p)` is an explicit port, `None` a dynamic one. Endpoints
    /// without a host port make no demand.
    pub fn port_demands(&self) -> Vec<Option<u16>> {
        let mut demands = Vec::new();
        for c in &self.containers {
            for e in &c.endpoints {
                match e.host_port {
                    Some(0) => demands.push(None),
                    Some(p) => demands.push(Some(p)),
                    None => {}
                }
            }
        }
        demands
    }

    /// Endpoints across containers, in declaration order. Health and
    /// readiness port indices address this list.
    pub fn endpoints(&self) -> Vec<&Endpoint> {
        self.containers.iter().flat_map(|c| c.endpoints.iter()).collect()
    }

    /// Whether instances claim agent-local persistent volumes, and with
    /// them a reservation.
    pub fn is_resident(&self) -> bool {
        self.volumes.iter().any(VolumeSpec::is_persistent)
    }

    pub fn has_external_volume(&self) -> bool {
        self.volumes
            .iter()
            .any(|v| matches!(v, VolumeSpec::PersistentExternal { .. }))
    }

    /// Persistent local volumes, the ones a reservation must create.
    pub fn local_volumes(&self) -> Vec<&VolumeSpec> {
        self.volumes
            .iter()
            .filter(|v| matches!(v, VolumeSpec::PersistentLocal { .. }))
            .collect()
    }

    pub fn has_health_checks(&self) -> bool {
        self.containers.iter().any(|c| c.health_check.is_some())
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub resources: Resources,
    pub image: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub endpoints: Vec<Endpoint>,
    pub health_check: Option<HealthCheck>,
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A named port a container exposes.
///
/// `host_port` of `Some(0)` asks for a dynamically allocated host port;
/// `None` exposes no host port (container networking only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub container_port: Option<u16>,
    pub host_port: Option<u16>,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub volume: String,
    pub mount_path: String,
    pub read_only: bool,
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Scalar demands plus named custom resources.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub mem_mb: f64,
    pub disk_mb: f64,
    pub gpus: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, CustomResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomResource {
    Scalar(f64),
    Ranges(Vec<(u64, u64)>),
    Set(BTreeSet<String>),
}

impl Resources {
    pub fn new(cpus: f64, mem_mb: f64) -> Self {
        Self {
            cpus,
            mem_mb,
            ..Default::default()
        }
    }

    pub fn add(&mut self, other: &Resources) {
        self.cpus += other.cpus;
        self.mem_mb += other.mem_mb;
        self.disk_mb += other.disk_mb;
        self.gpus += other.gpus;
        for (name, value) in &other.custom {
            match (self.custom.get_mut(name), value) {
                (Some(CustomResource::Scalar(mine)), CustomResource::Scalar(theirs)) => {
                    *mine += theirs;
                }
                (Some(_), _) => {}
                (None, v) => {
                    self.custom.insert(name.clone(), v.clone());
                }
            }
        }
    }

    /// Scalar demands as (name, amount) pairs, zero-demand entries omitted.
    pub fn scalar_demands(&self) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        for (name, amount) in [
            ("cpus", self.cpus),
            ("mem", self.mem_mb),
            ("disk", self.disk_mb),
            ("gpus", self.gpus),
        ] {
            if amount > 0.0 {
                out.push((name.to_string(), amount));
            }
        }
        for (name, value) in &self.custom {
            if let CustomResource::Scalar(amount) = value {
                if *amount > 0.0 {
                    out.push((name.clone(), *amount));
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Volumes and networks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSpec {
    Ephemeral {
        name: String,
    },
    Host {
        name: String,
        host_path: String,
    },
    /// Agent-local persistent volume, carried by a reservation.
    PersistentLocal {
        name: String,
        size_mb: u64,
    },
    /// Externally provisioned volume; at most one instance may write it.
    PersistentExternal {
        name: String,
        provider: String,
        options: BTreeMap<String, String>,
    },
}

impl VolumeSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Ephemeral { name }
            | Self::Host { name, .. }
            | Self::PersistentLocal { name, .. }
            | Self::PersistentExternal { name, .. } => name,
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            Self::PersistentLocal { .. } | Self::PersistentExternal { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Network {
    Host,
    Bridge,
    Container { name: String },
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Capacity bounds honored during a rolling restart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpgradeStrategy {
    /// Fraction of the target count that must stay healthy, in [0, 1].
    pub minimum_health_capacity: f64,
    /// Extra capacity fraction allowed during the roll, >= 0.
    pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            minimum_health_capacity: 1.0,
            maximum_over_capacity: 1.0,
        }
    }
}

/// Launch throttling under repeated failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 1.15,
            max: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    /// Delay after `consecutive_failures` failed launches, capped at `max`.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let scaled =
            self.base.as_secs_f64() * self.factor.powi(consecutive_failures as i32 - 1);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}

/// What to do with an instance the bus reports unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UnreachableStrategy {
    /// Never replace or expunge; wait for the agent to come back.
    Disabled,
    Enabled {
        /// After this long unreachable, start a replacement.
        #[serde(with = "duration_secs")]
        inactive_after: Duration,
        /// After this long unreachable, expunge the instance.
        #[serde(with = "duration_secs")]
        expunge_after: Duration,
    },
}

impl Default for UnreachableStrategy {
    fn default() -> Self {
        Self::Enabled {
            inactive_after: Duration::ZERO,
            expunge_after: Duration::ZERO,
        }
    }
}

pub(crate) mod duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

// ---------------------------------------------------------------------------
// Health and readiness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum HealthCheckProtocol {
    Command { value: String },
    Http { path: String },
    Tcp,
}

/// A liveness probe. Execution is the adapter's concern; the core validates
/// the declaration and folds bus-reported health into instance state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub protocol: HealthCheckProtocol,
    /// Index into [`RunSpec::endpoints`]; `None` for command checks.
    pub port_index: Option<usize>,
    pub grace_period: Duration,
    pub interval: Duration,
    pub timeout: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            protocol: HealthCheckProtocol::Tcp,
            port_index: Some(0),
            grace_period: Duration::from_secs(300),
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(20),
            max_consecutive_failures: 3,
        }
    }
}

/// A deployment gate: new instances only count as ready once this check
/// reports success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessCheck {
    pub name: String,
    pub port_index: usize,
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub preserve_last_response: bool,
}

impl Default for ReadinessCheck {
    fn default() -> Self {
        Self {
            name: "readiness".to_string(),
            port_index: 0,
            path: "/".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            preserve_last_response: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Placement constraints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintOperator {
    Unique,
    Cluster,
    Like,
    Unlike,
    GroupBy,
    MaxPer,
    Is,
}

impl fmt::Display for ConstraintOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unique => "UNIQUE",
            Self::Cluster => "CLUSTER",
            Self::Like => "LIKE",
            Self::Unlike => "UNLIKE",
            Self::GroupBy => "GROUP_BY",
            Self::MaxPer => "MAX_PER",
            Self::Is => "IS",
        })
    }
}

impl FromStr for ConstraintOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNIQUE" => Ok(Self::Unique),
            "CLUSTER" => Ok(Self::Cluster),
            "LIKE" => Ok(Self::Like),
            "UNLIKE" => Ok(Self::Unlike),
            "GROUP_BY" => Ok(Self::GroupBy),
            "MAX_PER" => Ok(Self::MaxPer),
            "IS" => Ok(Self::Is),
            other => Err(format!("unknown constraint operator {other:?}")),
        }
    }
}

/// `field` is the reserved name `hostname` or an agent attribute name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub field: String,
    pub operator: ConstraintOperator,
    pub value: Option<String>,
}

/// The field name addressing the agent's hostname in constraints.
pub const HOSTNAME_FIELD: &str = "hostname";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minimal_app(id: &str) -> RunSpec {
        RunSpec {
            id: id.parse().unwrap(),
            kind: RunSpecKind::App,
            version: Utc.timestamp_opt(0, 0).unwrap(),
            instances: 1,
            role: UNRESERVED_ROLE.to_string(),
            containers: vec![ContainerSpec {
                name: "main".to_string(),
                resources: Resources::new(0.1, 32.0),
                image: None,
                command: Some("sleep 3600".to_string()),
                args: Vec::new(),
                endpoints: Vec::new(),
                health_check: None,
                volume_mounts: Vec::new(),
            }],
            volumes: Vec::new(),
            networks: vec![Network::Host],
            constraints: Vec::new(),
            upgrade_strategy: UpgradeStrategy::default(),
            backoff: BackoffPolicy::default(),
            readiness_checks: Vec::new(),
            dependencies: Vec::new(),
            labels: BTreeMap::new(),
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
            accepted_resource_roles: None,
            require_ports: false,
            unreachable_strategy: UnreachableStrategy::default(),
            artifact_uris: Vec::new(),
        }
    }

    #[test]
    fn total_resources_sums_containers() {
        let mut spec = minimal_app("/pod");
        spec.kind = RunSpecKind::Pod;
        spec.containers.push(ContainerSpec {
            name: "sidecar".to_string(),
            resources: Resources::new(0.4, 96.0),
            image: None,
            command: None,
            args: Vec::new(),
            endpoints: Vec::new(),
            health_check: None,
            volume_mounts: Vec::new(),
        });
        let total = spec.total_resources();
        assert!((total.cpus - 0.5).abs() < 1e-9);
        assert!((total.mem_mb - 128.0).abs() < 1e-9);
    }

    #[test]
    fn port_demands_distinguish_dynamic_and_fixed() {
        let mut spec = minimal_app("/app");
        spec.containers[0].endpoints = vec![
            Endpoint {
                name: "http".to_string(),
                container_port: Some(8080),
                host_port: Some(0),
                protocol: Protocol::Tcp,
            },
            Endpoint {
                name: "admin".to_string(),
                container_port: None,
                host_port: Some(9090),
                protocol: Protocol::Tcp,
            },
            Endpoint {
                name: "internal".to_string(),
                container_port: Some(6000),
                host_port: None,
                protocol: Protocol::Tcp,
            },
        ];
        assert_eq!(spec.port_demands(), vec![None, Some(9090)]);
    }

    #[test]
    fn residency_follows_persistent_volumes() {
        let mut spec = minimal_app("/db");
        assert!(!spec.is_resident());
        spec.volumes.push(VolumeSpec::PersistentLocal {
            name: "data".to_string(),
            size_mb: 512,
        });
        assert!(spec.is_resident());
        assert!(!spec.has_external_volume());
        assert_eq!(spec.local_volumes().len(), 1);
    }

    #[test]
    fn backoff_delay_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(5));
        assert_eq!(policy.delay(30), Duration::from_secs(5));
    }

    #[test]
    fn constraint_operator_roundtrip() {
        for op in [
            ConstraintOperator::Unique,
            ConstraintOperator::Cluster,
            ConstraintOperator::Like,
            ConstraintOperator::Unlike,
            ConstraintOperator::GroupBy,
            ConstraintOperator::MaxPer,
            ConstraintOperator::Is,
        ] {
            let parsed: ConstraintOperator = op.to_string().parse().unwrap();
            assert_eq!(parsed, op);
        }
        assert!("NEAR".parse::<ConstraintOperator>().is_err());
    }

    #[test]
    fn run_spec_serde_roundtrip() {
        let mut spec = minimal_app("/prod/web");
        spec.volumes.push(VolumeSpec::PersistentExternal {
            name: "shared".to_string(),
            provider: "dvdi".to_string(),
            options: BTreeMap::new(),
        });
        let json = serde_json::to_string(&spec).unwrap();
        let back: RunSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
