//! Ports on the application's own Service
//!
//! The orchestrator creates a Service named after the application without
//! knowing which ports the workload listens on; the operator adds them.

use std::collections::BTreeMap;

use anyhow::Context;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kfp_models::CharmConfig;
use kube::api::DynamicObject;
use tracing::info;

use crate::resources::{ApplyError, ClusterApi};

/// Service manifest carrying the workload ports
pub fn service_manifest(
    app_name: &str,
    namespace: &str,
    config: &CharmConfig,
) -> anyhow::Result<DynamicObject> {
    let port = |name: &str, number: u16| ServicePort {
        name: Some(name.to_string()),
        port: i32::from(number),
        target_port: Some(IntOrString::Int(i32::from(number))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };

    let service = Service {
        metadata: ObjectMeta {
            name: Some(app_name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![
                port("grpc-port", config.grpc_port),
                port("http-port", config.http_port),
            ]),
            selector: Some(BTreeMap::from([(
                "app.kubernetes.io/name".to_string(),
                app_name.to_string(),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut value = serde_json::to_value(&service)?;
    value["apiVersion"] = "v1".into();
    value["kind"] = "Service".into();
    serde_json::from_value(value).context("Failed to convert Service manifest")
}

/// Apply the ports, taking ownership of them from any previous manager
pub async fn patch_service_ports(
    cluster: &dyn ClusterApi,
    field_manager: &str,
    app_name: &str,
    namespace: &str,
    config: &CharmConfig,
) -> Result<(), ApplyError> {
    let manifest = service_manifest(app_name, namespace, config)?;
    cluster.apply(&manifest, field_manager, true).await?;
    info!(
        service = %app_name,
        grpc_port = config.grpc_port,
        http_port = config.http_port,
        "patched service ports"
    );
    Ok(())
}
