//! Shared data types for the Kubeflow Pipelines API operator
//!
//! Everything here is plain data: the reconciler crate owns the behaviour,
//! the charm binary owns the I/O.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Key/value bag exchanged over a relation
pub type Databag = BTreeMap<String, String>;

// ============================================================================
// Unit status
// ============================================================================

/// Status reported for this unit
///
/// `Waiting` and `Blocked` end a reconciliation pass; `Active` is the
/// converged state; `Maintenance` marks work in progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum Status {
    Active,
    Waiting(String),
    Blocked(String),
    Maintenance(String),
}

impl Status {
    pub fn waiting(message: impl Into<String>) -> Self {
        Status::Waiting(message.into())
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Status::Blocked(message.into())
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        Status::Maintenance(message.into())
    }

    /// Name understood by `status-set`
    pub fn name(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Waiting(_) => "waiting",
            Status::Blocked(_) => "blocked",
            Status::Maintenance(_) => "maintenance",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Status::Active => "",
            Status::Waiting(m) | Status::Blocked(m) | Status::Maintenance(m) => m,
        }
    }

    /// True for statuses that stop the current pass
    pub fn halts_pass(&self) -> bool {
        matches!(self, Status::Waiting(_) | Status::Blocked(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Active => write!(f, "active"),
            other => write!(f, "{}: {}", other.name(), other.message()),
        }
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// Lifecycle event delivered by the orchestrator
///
/// Triggers carry no payload besides the relation name. Reconciliation always
/// re-reads current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "relation", rename_all = "kebab-case")]
pub enum Trigger {
    Install,
    Upgrade,
    Remove,
    LeaderElected,
    ConfigChanged,
    WorkloadReady,
    PeriodicCheck,
    RelationJoined(String),
    RelationChanged(String),
    RelationDeparted(String),
    RelationBroken(String),
}

impl Trigger {
    /// Map a hook name (`config-changed`, `mysql-relation-joined`, ...) to a trigger
    ///
    /// `container` is the workload container name, used to recognise its
    /// `<container>-pebble-ready` hook. Unknown hooks map to `None`.
    pub fn from_hook(hook: &str, container: &str) -> Option<Self> {
        let trigger = match hook {
            "install" => Trigger::Install,
            "upgrade-charm" => Trigger::Upgrade,
            "remove" => Trigger::Remove,
            "leader-elected" => Trigger::LeaderElected,
            "config-changed" => Trigger::ConfigChanged,
            "update-status" => Trigger::PeriodicCheck,
            _ => {
                if hook.strip_suffix("-pebble-ready") == Some(container) {
                    return Some(Trigger::WorkloadReady);
                }
                let relation_hooks: [(&str, fn(String) -> Trigger); 4] = [
                    ("-relation-joined", Trigger::RelationJoined),
                    ("-relation-changed", Trigger::RelationChanged),
                    ("-relation-departed", Trigger::RelationDeparted),
                    ("-relation-broken", Trigger::RelationBroken),
                ];
                return relation_hooks.iter().find_map(|(suffix, build)| {
                    hook.strip_suffix(suffix)
                        .filter(|name| !name.is_empty())
                        .map(|name| build(name.to_string()))
                });
            }
        };
        Some(trigger)
    }

    /// Relation being torn down by this trigger
    ///
    /// The orchestrator still lists a broken relation while its hook runs.
    pub fn broken_relation(&self) -> Option<&str> {
        match self {
            Trigger::RelationBroken(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Install => write!(f, "install"),
            Trigger::Upgrade => write!(f, "upgrade-charm"),
            Trigger::Remove => write!(f, "remove"),
            Trigger::LeaderElected => write!(f, "leader-elected"),
            Trigger::ConfigChanged => write!(f, "config-changed"),
            Trigger::WorkloadReady => write!(f, "pebble-ready"),
            Trigger::PeriodicCheck => write!(f, "update-status"),
            Trigger::RelationJoined(name) => write!(f, "{}-relation-joined", name),
            Trigger::RelationChanged(name) => write!(f, "{}-relation-changed", name),
            Trigger::RelationDeparted(name) => write!(f, "{}-relation-departed", name),
            Trigger::RelationBroken(name) => write!(f, "{}-relation-broken", name),
        }
    }
}

// ============================================================================
// Relations
// ============================================================================

/// Snapshot of one established relation, as seen from this unit
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relation {
    /// Numeric relation id
    pub id: u32,
    /// Endpoint name (`mysql`, `object-storage`, ...)
    pub name: String,
    /// Remote application name, once known
    pub remote_app: Option<String>,
    /// Remote application databag
    #[serde(default)]
    pub app_data: Databag,
    /// This application's own databag on the relation
    #[serde(default)]
    pub local_app_data: Databag,
    /// Remote unit databags keyed by unit name
    #[serde(default)]
    pub units: BTreeMap<String, Databag>,
}

impl Relation {
    /// Id in the `name:id` form the hook tools accept
    pub fn relation_id(&self) -> String {
        format!("{}:{}", self.name, self.id)
    }

    /// Databag of the first remote unit, ordered by unit name
    pub fn first_unit_data(&self) -> Option<&Databag> {
        self.units.values().next()
    }
}

// ============================================================================
// Charm configuration
// ============================================================================

/// Operator options as returned by `config-get`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct CharmConfig {
    pub grpc_port: u16,
    pub http_port: u16,
    pub object_store_bucket_name: String,
    pub log_archive_filename: String,
    pub log_archive_prefix: String,
    pub auto_update_default_version: bool,
    pub cache_image: String,
    pub cache_enabled: bool,
    pub runner_sa: String,
    pub init_connection_timeout: String,
}

impl Default for CharmConfig {
    fn default() -> Self {
        Self {
            grpc_port: 8887,
            http_port: 8888,
            object_store_bucket_name: "mlpipeline".to_string(),
            log_archive_filename: "main.log".to_string(),
            log_archive_prefix: "/artifacts".to_string(),
            auto_update_default_version: true,
            cache_image: "gcr.io/google-containers/busybox".to_string(),
            cache_enabled: true,
            runner_sa: "default-editor".to_string(),
            init_connection_timeout: "6m".to_string(),
        }
    }
}

// ============================================================================
// Database connection
// ============================================================================

/// Resolved database connection; always fully populated
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseParams {
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
    pub name: String,
}

// ============================================================================
// Workload configuration document
// ============================================================================

/// `config.json` consumed by the API server
///
/// Field order is fixed by declaration so identical inputs serialize to
/// identical bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadConfig {
    #[serde(rename = "DBConfig")]
    pub db_config: DbConfig,
    #[serde(rename = "ObjectStoreConfig")]
    pub object_store_config: ObjectStoreConfig,
    #[serde(rename = "ARCHIVE_CONFIG_LOG_FILE_NAME")]
    pub archive_log_file_name: String,
    #[serde(rename = "ARCHIVE_CONFIG_LOG_PATH_PREFIX")]
    pub archive_log_path_prefix: String,
    #[serde(rename = "AUTO_UPDATE_PIPELINE_DEFAULT_VERSION")]
    pub auto_update_pipeline_default_version: String,
    #[serde(rename = "CACHE_IMAGE")]
    pub cache_image: String,
    #[serde(rename = "CACHE_NODE_RESTRICTIONS")]
    pub cache_node_restrictions: String,
    #[serde(rename = "CacheEnabled")]
    pub cache_enabled: String,
    #[serde(rename = "DefaultPipelineRunnerServiceAccount")]
    pub default_pipeline_runner_service_account: String,
    #[serde(rename = "InitConnectionTimeout")]
    pub init_connection_timeout: String,
    #[serde(rename = "KUBEFLOW_USERID_HEADER")]
    pub kubeflow_userid_header: String,
    #[serde(rename = "KUBEFLOW_USERID_PREFIX")]
    pub kubeflow_userid_prefix: String,
    #[serde(rename = "MULTIUSER")]
    pub multiuser: String,
    #[serde(rename = "ML_PIPELINE_VISUALIZATIONSERVER_SERVICE_HOST")]
    pub visualization_server_host: String,
    #[serde(rename = "ML_PIPELINE_VISUALIZATIONSERVER_SERVICE_PORT")]
    pub visualization_server_port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DbConfig {
    #[serde(rename = "ConMaxLifeTime")]
    pub con_max_life_time: String,
    #[serde(rename = "DBName")]
    pub db_name: String,
    #[serde(rename = "DriverName")]
    pub driver_name: String,
    #[serde(rename = "GroupConcatMaxLen")]
    pub group_concat_max_len: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Port")]
    pub port: String,
    #[serde(rename = "User")]
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    #[serde(rename = "AccessKey")]
    pub access_key: String,
    #[serde(rename = "BucketName")]
    pub bucket_name: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Multipart")]
    pub multipart: Multipart,
    #[serde(rename = "PipelinePath")]
    pub pipeline_path: String,
    #[serde(rename = "Port")]
    pub port: String,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "Secure")]
    pub secure: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Multipart {
    #[serde(rename = "Disable")]
    pub disable: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_from_hook() {
        let container = "ml-pipeline-api-server";
        assert_eq!(Trigger::from_hook("install", container), Some(Trigger::Install));
        assert_eq!(Trigger::from_hook("update-status", container), Some(Trigger::PeriodicCheck));
        assert_eq!(
            Trigger::from_hook("ml-pipeline-api-server-pebble-ready", container),
            Some(Trigger::WorkloadReady)
        );
        assert_eq!(
            Trigger::from_hook("relational-db-relation-broken", container),
            Some(Trigger::RelationBroken("relational-db".to_string()))
        );
        assert_eq!(
            Trigger::from_hook("object-storage-relation-changed", container),
            Some(Trigger::RelationChanged("object-storage".to_string()))
        );
        assert_eq!(Trigger::from_hook("other-pebble-ready", container), None);
        assert_eq!(Trigger::from_hook("start", container), None);
        assert_eq!(Trigger::from_hook("-relation-joined", container), None);
    }

    #[test]
    fn test_trigger_display_matches_hook_name() {
        let trigger = Trigger::RelationDeparted("mysql".to_string());
        assert_eq!(trigger.to_string(), "mysql-relation-departed");
        assert_eq!(trigger.broken_relation(), None);
        let broken = Trigger::RelationBroken("mysql".to_string());
        assert_eq!(broken.broken_relation(), Some("mysql"));
        assert_eq!(Trigger::ConfigChanged.broken_relation(), None);
    }

    #[test]
    fn test_status_accessors() {
        let status = Status::blocked("add a relation");
        assert_eq!(status.name(), "blocked");
        assert_eq!(status.message(), "add a relation");
        assert!(status.halts_pass());
        assert!(!Status::maintenance("busy").halts_pass());
        assert!(!Status::Active.halts_pass());
        assert_eq!(Status::waiting("later").to_string(), "waiting: later");
    }

    #[test]
    fn test_charm_config_defaults_fill_missing_keys() {
        let config: CharmConfig =
            serde_json::from_str(r#"{"http-port": 9000, "cache-enabled": false}"#).unwrap();
        assert_eq!(config.http_port, 9000);
        assert!(!config.cache_enabled);
        assert_eq!(config.grpc_port, 8887);
        assert_eq!(config.runner_sa, "default-editor");
    }

    #[test]
    fn test_first_unit_data_is_ordered_by_unit_name() {
        let mut relation = Relation {
            id: 3,
            name: "mysql".to_string(),
            ..Default::default()
        };
        relation.units.insert("mysql/1".to_string(), Databag::from([("a".to_string(), "1".to_string())]));
        relation.units.insert("mysql/0".to_string(), Databag::from([("a".to_string(), "0".to_string())]));
        assert_eq!(relation.relation_id(), "mysql:3");
        assert_eq!(relation.first_unit_data().unwrap()["a"], "0");
    }
}
