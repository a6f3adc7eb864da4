//! Orchestrator configuration.
//!
//! The CLI/flag parsing lives in the binary adapter; the core receives this
//! struct already deserialized (TOML) and validated. Durations are declared
//! in seconds (`*_secs` fields) to keep the file format flat; accessors
//! return `Duration`.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kill::KillConfig;
use crate::launch::revive::ReviveConfig;
use crate::matcher::{AcceptedRolesDefault, MatchConfig};
use crate::reconcile::ReconcileConfig;
use crate::spec::group::GroupRoleBehavior;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "default_accepted_resource_roles and accepted_resource_roles_default_behavior \
         are mutually exclusive"
    )]
    ConflictingRoleDefaults,

    #[error("master endpoint must not be empty")]
    EmptyMaster,

    #[error("coordination connection string must not be empty")]
    EmptyCoordination,

    #[error("kill_chunk_size must be at least 1")]
    ZeroKillChunk,
}

/// Coordination-service connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Connection string, e.g. `zk-1:2181,zk-2:2181`.
    pub connection: String,
    /// Root path all orchestrator state lives under.
    #[serde(default = "default_chroot")]
    pub chroot: String,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_chroot() -> String {
    "/armada".to_string()
}

fn default_session_timeout_secs() -> u64 {
    10
}

impl CoordinationConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Offer-bus endpoint (coordination URL or direct address).
    pub master: String,
    /// Reservation role this framework registers under.
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub default_accepted_resource_roles: Option<BTreeSet<String>>,
    #[serde(default)]
    pub accepted_resource_roles_default_behavior: Option<AcceptedRolesDefault>,
    /// Feature toggles, e.g. `secrets`.
    #[serde(default)]
    pub enable_features: BTreeSet<String>,
    #[serde(default = "default_group_role_behavior")]
    pub group_role_behavior: GroupRoleBehavior,

    #[serde(default = "default_task_launch_timeout_secs")]
    pub task_launch_timeout_secs: u64,
    #[serde(default = "default_task_launch_confirm_timeout_secs")]
    pub task_launch_confirm_timeout_secs: u64,
    #[serde(default = "default_task_lost_expunge_initial_delay_secs")]
    pub task_lost_expunge_initial_delay_secs: u64,
    #[serde(default = "default_task_lost_expunge_interval_secs")]
    pub task_lost_expunge_interval_secs: u64,

    #[serde(default = "default_reconciliation_interval_secs")]
    pub reconciliation_interval_secs: u64,
    #[serde(default = "default_reconciliation_max_attempts")]
    pub reconciliation_max_attempts: u32,

    #[serde(default = "default_min_revive_offers_interval_secs")]
    pub min_revive_offers_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enable_offer_suppress: bool,

    #[serde(default = "default_kill_chunk_size")]
    pub kill_chunk_size: usize,
    #[serde(default = "default_kill_retry_timeout_secs")]
    pub kill_retry_timeout_secs: u64,
    #[serde(default = "default_kill_retry_max")]
    pub kill_retry_max: u32,

    #[serde(default = "default_max_queued_root_group_updates")]
    pub max_queued_root_group_updates: usize,
    #[serde(default = "default_launch_tokens")]
    pub launch_tokens: u32,
    #[serde(default = "default_reservation_wait_secs")]
    pub reservation_wait_secs: u64,
    #[serde(default = "default_decline_wait_secs")]
    pub decline_wait_secs: u64,

    pub coordination: CoordinationConfig,
}

fn default_role() -> String {
    crate::spec::UNRESERVED_ROLE.to_string()
}

fn default_group_role_behavior() -> GroupRoleBehavior {
    GroupRoleBehavior::Off
}

fn default_task_launch_timeout_secs() -> u64 {
    300
}

fn default_task_launch_confirm_timeout_secs() -> u64 {
    300
}

fn default_task_lost_expunge_initial_delay_secs() -> u64 {
    300
}

fn default_task_lost_expunge_interval_secs() -> u64 {
    30
}

fn default_reconciliation_interval_secs() -> u64 {
    60
}

fn default_reconciliation_max_attempts() -> u32 {
    3
}

fn default_min_revive_offers_interval_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_kill_chunk_size() -> usize {
    5
}

fn default_kill_retry_timeout_secs() -> u64 {
    10
}

fn default_kill_retry_max() -> u32 {
    5
}

fn default_max_queued_root_group_updates() -> usize {
    16
}

fn default_launch_tokens() -> u32 {
    100
}

fn default_reservation_wait_secs() -> u64 {
    120
}

fn default_decline_wait_secs() -> u64 {
    5
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Reject inconsistent settings before any subsystem sees them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.master.trim().is_empty() {
            return Err(ConfigError::EmptyMaster);
        }
        if self.coordination.connection.trim().is_empty() {
            return Err(ConfigError::EmptyCoordination);
        }
        if self.default_accepted_resource_roles.is_some()
            && self.accepted_resource_roles_default_behavior.is_some()
        {
            return Err(ConfigError::ConflictingRoleDefaults);
        }
        if self.kill_chunk_size == 0 {
            return Err(ConfigError::ZeroKillChunk);
        }
        Ok(())
    }

    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            default_behavior: self
                .accepted_resource_roles_default_behavior
                .unwrap_or(AcceptedRolesDefault::Any),
            default_accepted_roles: self.default_accepted_resource_roles.clone(),
        }
    }

    pub fn kill_config(&self) -> KillConfig {
        KillConfig {
            chunk_size: self.kill_chunk_size,
            retry_timeout: Duration::from_secs(self.kill_retry_timeout_secs),
            retry_max: self.kill_retry_max,
        }
    }

    pub fn revive_config(&self) -> ReviveConfig {
        ReviveConfig {
            min_revive_interval: Duration::from_secs(self.min_revive_offers_interval_secs),
            enable_suppress: self.enable_offer_suppress,
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            overdue_interval: Duration::from_secs(self.task_lost_expunge_interval_secs),
            task_launch_confirm_timeout: Duration::from_secs(
                self.task_launch_confirm_timeout_secs,
            ),
            reconciliation_interval: Duration::from_secs(self.reconciliation_interval_secs),
            max_reconciliations: self.reconciliation_max_attempts,
            candidate_buffer: 256,
        }
    }

    pub fn task_launch_timeout(&self) -> Duration {
        Duration::from_secs(self.task_launch_timeout_secs)
    }

    pub fn reservation_wait(&self) -> Duration {
        Duration::from_secs(self.reservation_wait_secs)
    }

    pub fn decline_wait(&self) -> Duration {
        Duration::from_secs(self.decline_wait_secs)
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        self.enable_features.contains(name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master: "zk://localhost:2181/mesos".to_string(),
            role: default_role(),
            default_accepted_resource_roles: None,
            accepted_resource_roles_default_behavior: None,
            enable_features: BTreeSet::new(),
            group_role_behavior: default_group_role_behavior(),
            task_launch_timeout_secs: default_task_launch_timeout_secs(),
            task_launch_confirm_timeout_secs: default_task_launch_confirm_timeout_secs(),
            task_lost_expunge_initial_delay_secs: default_task_lost_expunge_initial_delay_secs(),
            task_lost_expunge_interval_secs: default_task_lost_expunge_interval_secs(),
            reconciliation_interval_secs: default_reconciliation_interval_secs(),
            reconciliation_max_attempts: default_reconciliation_max_attempts(),
            min_revive_offers_interval_secs: default_min_revive_offers_interval_secs(),
            enable_offer_suppress: true,
            kill_chunk_size: default_kill_chunk_size(),
            kill_retry_timeout_secs: default_kill_retry_timeout_secs(),
            kill_retry_max: default_kill_retry_max(),
            max_queued_root_group_updates: default_max_queued_root_group_updates(),
            launch_tokens: default_launch_tokens(),
            reservation_wait_secs: default_reservation_wait_secs(),
            decline_wait_secs: default_decline_wait_secs(),
            coordination: CoordinationConfig {
                connection: "localhost:2181".to_string(),
                chroot: default_chroot(),
                session_timeout_secs: default_session_timeout_secs(),
                user: None,
                password: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn minimal_toml_parses_with_defaults() {
        let raw = r#"
            master = "zk://zk-1:2181/mesos"

            [coordination]
            connection = "zk-1:2181,zk-2:2181"
        "#;
        let config = Config::from_toml_str(raw).unwrap();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.kill_chunk_size, 5);
        assert_eq!(config.coordination.chroot, "/armada");
        assert_eq!(config.coordination.session_timeout(), Duration::from_secs(10));
        assert_eq!(config.group_role_behavior, GroupRoleBehavior::Off);
    }

    #[test]
    fn both_role_defaults_rejected() {
        let mut config = Config::default();
        config.default_accepted_resource_roles = Some(["*".to_string()].into());
        config.accepted_resource_roles_default_behavior = Some(AcceptedRolesDefault::Reserved);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ConflictingRoleDefaults)
        );
    }

    #[test]
    fn either_role_default_alone_is_fine() {
        let mut config = Config::default();
        config.default_accepted_resource_roles = Some(["*".to_string()].into());
        assert_eq!(config.validate(), Ok(()));
        assert!(config.match_config().default_accepted_roles.is_some());

        let mut config = Config::default();
        config.accepted_resource_roles_default_behavior = Some(AcceptedRolesDefault::Unreserved);
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(
            config.match_config().default_behavior,
            AcceptedRolesDefault::Unreserved
        );
    }

    #[test]
    fn empty_endpoints_rejected() {
        let mut config = Config::default();
        config.master = "".into();
        assert_eq!(config.validate(), Err(ConfigError::EmptyMaster));

        let mut config = Config::default();
        config.coordination.connection = " ".into();
        assert_eq!(config.validate(), Err(ConfigError::EmptyCoordination));
    }

    #[test]
    fn zero_kill_chunk_rejected() {
        let mut config = Config::default();
        config.kill_chunk_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroKillChunk));
    }

    #[test]
    fn derived_configs_carry_values_through() {
        let raw = r#"
            master = "m"
            kill_chunk_size = 7
            kill_retry_timeout_secs = 3
            kill_retry_max = 2
            min_revive_offers_interval_secs = 11
            enable_offer_suppress = false
            task_launch_confirm_timeout_secs = 120

            [coordination]
            connection = "zk:2181"
        "#;
        let config = Config::from_toml_str(raw).unwrap();
        let kill = config.kill_config();
        assert_eq!(kill.chunk_size, 7);
        assert_eq!(kill.retry_timeout, Duration::from_secs(3));
        assert_eq!(kill.retry_max, 2);

        let revive = config.revive_config();
        assert_eq!(revive.min_revive_interval, Duration::from_secs(11));
        assert!(!revive.enable_suppress);

        let reconcile = config.reconcile_config();
        assert_eq!(
            reconcile.task_launch_confirm_timeout,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn feature_toggles() {
        let raw = r#"
            master = "m"
            enable_features = ["secrets"]

            [coordination]
            connection = "zk:2181"
        "#;
        let config = Config::from_toml_str(raw).unwrap();
        assert!(config.feature_enabled("secrets"));
        assert!(!config.feature_enabled("gpu_scheduling"));
    }
}
