//! Generation of the API server's `config.json`

use kfp_models::{CharmConfig, DatabaseParams, DbConfig, Multipart, ObjectStoreConfig, WorkloadConfig};
use tracing::error;

use crate::database::{self, DatabaseRequires};
use crate::error::{ReconcileError, Result};
use crate::interfaces::{FlatRecord, Interfaces};
use crate::model::UnitModel;
use crate::names::relations;
use crate::relation_data::validate_interface;

/// Gather every input for this pass and build the document
///
/// Any missing input aborts before anything is built. `broken` is passed on
/// to database resolution.
pub async fn generate(
    model: &dyn UnitModel,
    requires: &DatabaseRequires,
    interfaces: &Interfaces,
    config: &CharmConfig,
    broken: Option<&str>,
) -> Result<WorkloadConfig> {
    let inputs = async {
        let db = database::resolve(model, requires, broken).await?;
        let object_storage = validate_interface(interfaces, relations::OBJECT_STORAGE, None)?;
        let viz = validate_interface(interfaces, relations::KFP_VIZ, None)?;
        Ok::<_, ReconcileError>((db, object_storage, viz))
    }
    .await;

    let (db, object_storage, viz) = inputs.map_err(|e| {
        error!("Failed to generate container configuration.");
        e
    })?;
    build(&object_storage, &viz, &db, config)
}

/// Pure assembly of the document from validated inputs
pub fn build(
    object_storage: &FlatRecord,
    viz: &FlatRecord,
    db: &DatabaseParams,
    config: &CharmConfig,
) -> Result<WorkloadConfig> {
    let os = |key: &str| field(object_storage, relations::OBJECT_STORAGE, key);
    let vis = |key: &str| field(viz, relations::KFP_VIZ, key);

    Ok(WorkloadConfig {
        db_config: DbConfig {
            con_max_life_time: "120s".to_string(),
            db_name: db.name.clone(),
            driver_name: "mysql".to_string(),
            group_concat_max_len: "4194304".to_string(),
            host: db.host.clone(),
            password: db.password.clone(),
            port: db.port.clone(),
            user: db.username.clone(),
        },
        object_store_config: ObjectStoreConfig {
            access_key: os("access-key")?,
            bucket_name: config.object_store_bucket_name.clone(),
            host: format!("{}.{}", os("service")?, os("namespace")?),
            multipart: Multipart {
                disable: "true".to_string(),
            },
            pipeline_path: "pipelines".to_string(),
            port: os("port")?,
            region: String::new(),
            secret_access_key: os("secret-key")?,
            secure: os("secure")?.to_lowercase(),
        },
        archive_log_file_name: config.log_archive_filename.clone(),
        archive_log_path_prefix: config.log_archive_prefix.clone(),
        auto_update_pipeline_default_version: config.auto_update_default_version.to_string(),
        cache_image: config.cache_image.clone(),
        cache_node_restrictions: "false".to_string(),
        cache_enabled: config.cache_enabled.to_string(),
        default_pipeline_runner_service_account: config.runner_sa.clone(),
        init_connection_timeout: config.init_connection_timeout.clone(),
        kubeflow_userid_header: "kubeflow-userid".to_string(),
        kubeflow_userid_prefix: String::new(),
        multiuser: "true".to_string(),
        visualization_server_host: vis("service-name")?,
        visualization_server_port: vis("service-port")?,
    })
}

fn field(record: &FlatRecord, relation: &str, key: &str) -> Result<String> {
    record.get(key).cloned().ok_or_else(|| {
        error!(relation = %relation, field = %key, "missing field in relation data");
        ReconcileError::blocked(format!(
            "Found incomplete/incorrect relation data for {}. See logs",
            relation
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_storage() -> FlatRecord {
        FlatRecord::from([
            ("access-key".to_string(), "minio".to_string()),
            ("namespace".to_string(), "kubeflow".to_string()),
            ("port".to_string(), "9000".to_string()),
            ("secret-key".to_string(), "minio-secret".to_string()),
            ("secure".to_string(), "false".to_string()),
            ("service".to_string(), "minio".to_string()),
        ])
    }

    fn viz() -> FlatRecord {
        FlatRecord::from([
            ("service-name".to_string(), "kfp-viz.kubeflow".to_string()),
            ("service-port".to_string(), "8888".to_string()),
        ])
    }

    fn db() -> DatabaseParams {
        DatabaseParams {
            host: "mysql.kubeflow".to_string(),
            port: "3306".to_string(),
            username: "root".to_string(),
            password: "hunter2".to_string(),
            name: "mlpipeline".to_string(),
        }
    }

    #[test]
    fn test_build_maps_every_input() {
        let doc = build(&object_storage(), &viz(), &db(), &CharmConfig::default()).unwrap();
        assert_eq!(doc.db_config.user, "root");
        assert_eq!(doc.db_config.driver_name, "mysql");
        assert_eq!(doc.object_store_config.host, "minio.kubeflow");
        assert_eq!(doc.object_store_config.port, "9000");
        assert_eq!(doc.object_store_config.bucket_name, "mlpipeline");
        assert_eq!(doc.visualization_server_host, "kfp-viz.kubeflow");
        assert_eq!(doc.cache_enabled, "true");
    }

    #[test]
    fn test_build_is_deterministic() {
        let config = CharmConfig::default();
        let first = serde_json::to_vec(&build(&object_storage(), &viz(), &db(), &config).unwrap()).unwrap();
        let second = serde_json::to_vec(&build(&object_storage(), &viz(), &db(), &config).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_document_uses_workload_key_names() {
        let config = CharmConfig {
            auto_update_default_version: false,
            ..Default::default()
        };
        let doc = build(&object_storage(), &viz(), &db(), &config).unwrap();
        let json: serde_json::Value = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["DBConfig"]["User"], "root");
        assert_eq!(json["DBConfig"]["DBName"], "mlpipeline");
        assert_eq!(json["ObjectStoreConfig"]["Multipart"]["Disable"], "true");
        assert_eq!(json["ObjectStoreConfig"]["Secure"], "false");
        assert_eq!(json["AUTO_UPDATE_PIPELINE_DEFAULT_VERSION"], "false");
        assert_eq!(json["ML_PIPELINE_VISUALIZATIONSERVER_SERVICE_PORT"], "8888");
    }

    #[test]
    fn test_missing_field_aborts_generation() {
        let mut storage = object_storage();
        storage.remove("secret-key");
        let err = build(&storage, &viz(), &db(), &CharmConfig::default()).unwrap_err();
        assert!(matches!(err.status(), Some(kfp_models::Status::Blocked(_))));
    }
}
