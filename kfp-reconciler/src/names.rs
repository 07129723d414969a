//! Name constants shared across the reconciler
//!
//! Relation endpoints, workload paths and the fixed status messages the
//! operator reports.

/// Relation endpoint names
pub mod relations {
    /// Deprecated database relation carrying raw unit data
    pub const MYSQL: &str = "mysql";
    /// Database relation negotiated through the request/response library
    pub const RELATIONAL_DB: &str = "relational-db";
    pub const OBJECT_STORAGE: &str = "object-storage";
    pub const KFP_VIZ: &str = "kfp-viz";
    /// Relation this operator provides to its consumers
    pub const KFP_API: &str = "kfp-api";
}

/// Workload container, service and file locations
pub mod workload {
    pub const CONTAINER: &str = "ml-pipeline-api-server";
    pub const SERVICE: &str = "apiserver";
    pub const CHECK: &str = "kfp-api-up";
    pub const LAYER_LABEL: &str = "kfp-api";
    pub const CONFIG_DIR: &str = "/config";
    pub const CONFIG_FILE: &str = "/config/config.json";
    pub const SAMPLE_CONFIG: &str = "/config/sample_config.json";
    pub const PROBE_PATH: &str = "/apis/v1beta1/healthz";
    pub const DATABASE_NAME: &str = "mlpipeline";
}

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kfp-api-operator";

/// Status and log messages
pub mod messages {
    pub const MYSQL_WARNING: &str = "Relation mysql is deprecated.";
    pub const UNBLOCK_MESSAGE: &str = "Remove deprecated mysql relation to unblock.";
    pub const ADD_DATABASE_RELATION: &str =
        "Please add required database relation: eg. relational-db";
    pub const WAITING_FOR_LEADERSHIP: &str = "Waiting for leadership";
    pub const POD_STARTUP: &str = "Pod startup is not complete";
    pub const HEALTH_CHECK_FAILED: &str = "Workload failed health check";
}
