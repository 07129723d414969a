//! Cluster resources exposing and authorising the workload
//!
//! Manifests are rendered from Tera templates and applied with server-side
//! apply under a single field manager, so repeated applies of the same
//! context change nothing.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use kfp_models::{CharmConfig, Status};
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use tera::{Context as TeraContext, Tera};
use tracing::{error, info, warn};

use crate::error::{ReconcileError, Result};
use crate::model::UnitModel;

const TEMPLATES: [(&str, &str); 2] = [
    (
        "auth_manifests.yaml.j2",
        include_str!("../templates/auth_manifests.yaml.j2"),
    ),
    (
        "ml-pipeline-service.yaml.j2",
        include_str!("../templates/ml-pipeline-service.yaml.j2"),
    ),
];

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("conflict on {0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Apply and delete primitives of the cluster API
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Server-side apply `object` as `field_manager`, taking over conflicting
    /// fields when `force` is set
    async fn apply(
        &self,
        object: &DynamicObject,
        field_manager: &str,
        force: bool,
    ) -> Result<(), ApplyError>;

    async fn delete(&self, object: &DynamicObject) -> Result<(), ApplyError>;
}

/// `Kind/namespace/name` for logs and errors
pub fn describe(object: &DynamicObject) -> String {
    let kind = object.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("Unknown");
    let name = object.metadata.name.as_deref().unwrap_or("<unnamed>");
    match object.metadata.namespace.as_deref() {
        Some(namespace) => format!("{}/{}/{}", kind, namespace, name),
        None => format!("{}/{}", kind, name),
    }
}

/// Values the templates are rendered with
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResourceContext {
    pub app_name: String,
    pub namespace: String,
    pub service: String,
    pub grpc_port: u16,
    pub http_port: u16,
}

impl ResourceContext {
    pub fn new(app_name: &str, namespace: &str, config: &CharmConfig) -> Self {
        Self {
            app_name: app_name.to_string(),
            namespace: namespace.to_string(),
            service: app_name.to_string(),
            grpc_port: config.grpc_port,
            http_port: config.http_port,
        }
    }
}

pub struct ManifestRenderer {
    tera: Tera,
}

impl ManifestRenderer {
    pub fn new() -> anyhow::Result<Self> {
        let mut tera = Tera::default();
        for (name, template) in TEMPLATES {
            tera.add_raw_template(name, template)
                .with_context(|| format!("Failed to load template {}", name))?;
        }
        Ok(Self { tera })
    }

    /// Render every template into cluster objects, in template order
    pub fn render(&self, context: &ResourceContext) -> anyhow::Result<Vec<DynamicObject>> {
        let template_ctx = TeraContext::from_serialize(context)?;
        let mut objects = Vec::new();
        for (name, _) in TEMPLATES {
            let rendered = self
                .tera
                .render(name, &template_ctx)
                .with_context(|| format!("Failed to render template {}", name))?;
            for document in serde_yaml::Deserializer::from_str(&rendered) {
                let value = serde_yaml::Value::deserialize(document)?;
                if value.is_null() {
                    continue;
                }
                let object: DynamicObject = serde_yaml::from_value(value)
                    .with_context(|| format!("Invalid manifest in template {}", name))?;
                objects.push(object);
            }
        }
        Ok(objects)
    }
}

/// Applies and removes the rendered resources
pub struct ResourceConvergence {
    renderer: ManifestRenderer,
    context: ResourceContext,
    cluster: Arc<dyn ClusterApi>,
    field_manager: String,
}

impl ResourceConvergence {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        context: ResourceContext,
        field_manager: &str,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            renderer: ManifestRenderer::new()?,
            context,
            cluster,
            field_manager: field_manager.to_string(),
        })
    }

    pub fn render(&self) -> anyhow::Result<Vec<DynamicObject>> {
        self.renderer.render(&self.context)
    }

    /// Apply all resources
    ///
    /// A conflict is retried once with forced ownership when
    /// `force_conflicts` is set and is fatal otherwise.
    pub async fn apply(&self, model: &dyn UnitModel, force_conflicts: bool) -> Result<()> {
        model.set_status(&Status::maintenance("Creating K8S resources")).await?;
        let objects = self.render()?;

        match self.apply_all(&objects, false).await {
            Ok(()) => {}
            Err(ApplyError::Conflict(object)) if force_conflicts => {
                warn!(object = %object, "Encountered a conflict");
                model.set_status(&Status::maintenance("Force applying K8S resources")).await?;
                warn!("Apply K8S resources with forced changes against conflicts");
                self.apply_all(&objects, true).await.map_err(|e| {
                    ReconcileError::Fatal(anyhow::Error::new(e).context("K8S resources creation failed"))
                })?;
            }
            Err(e) => {
                if let ApplyError::Conflict(object) = &e {
                    warn!(object = %object, "Encountered a conflict");
                }
                return Err(ReconcileError::Fatal(
                    anyhow::Error::new(e).context("K8S resources creation failed"),
                ));
            }
        }

        model.set_status(&Status::maintenance("K8S resources created")).await?;
        Ok(())
    }

    async fn apply_all(&self, objects: &[DynamicObject], force: bool) -> Result<(), ApplyError> {
        for object in objects {
            self.cluster.apply(object, &self.field_manager, force).await?;
        }
        info!(count = objects.len(), force, "applied K8S resources");
        Ok(())
    }

    /// Delete all resources rendered from the current context
    pub async fn remove(&self, model: &dyn UnitModel) -> Result<()> {
        model.set_status(&Status::maintenance("Removing K8S resources")).await?;
        for object in self.render()? {
            match self.cluster.delete(&object).await {
                Ok(()) => info!(object = %describe(&object), "deleted"),
                Err(ApplyError::NotFound(_)) => {}
                Err(e) => {
                    error!(error = %e, "Failed to delete K8S resources");
                    return Err(ReconcileError::Fatal(e.into()));
                }
            }
        }
        model.set_status(&Status::maintenance("K8S resources removed")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCluster, FakeModel};

    fn context() -> ResourceContext {
        ResourceContext::new("kfp-api", "kubeflow", &CharmConfig::default())
    }

    fn convergence(cluster: &Arc<FakeCluster>) -> ResourceConvergence {
        ResourceConvergence::new(cluster.clone(), context(), "kfp-api-operator").unwrap()
    }

    #[test]
    fn test_render_produces_all_objects() {
        let objects = ManifestRenderer::new().unwrap().render(&context()).unwrap();
        let described: Vec<String> = objects.iter().map(describe).collect();
        assert_eq!(
            described,
            vec![
                "ClusterRole/kfp-api",
                "ClusterRoleBinding/kfp-api",
                "ServiceAccount/kubeflow/kfp-api-sa",
                "Service/kubeflow/ml-pipeline",
            ]
        );
    }

    #[test]
    fn test_render_uses_configured_ports() {
        let config = CharmConfig { grpc_port: 7000, ..Default::default() };
        let context = ResourceContext::new("kfp-api", "kubeflow", &config);
        let objects = ManifestRenderer::new().unwrap().render(&context).unwrap();
        let service = objects.last().unwrap();
        assert_eq!(service.data["spec"]["ports"][0]["port"], 7000);
        assert_eq!(service.data["spec"]["selector"]["app.kubernetes.io/name"], "kfp-api");
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let cluster = Arc::new(FakeCluster::default());
        let model = FakeModel::leader();
        let resources = convergence(&cluster);

        resources.apply(&model, false).await.unwrap();
        let first = cluster.objects();
        resources.apply(&model, false).await.unwrap();
        assert_eq!(cluster.objects(), first);
        assert_eq!(first.len(), 4);
        assert_eq!(
            model.statuses(),
            vec![
                Status::maintenance("Creating K8S resources"),
                Status::maintenance("K8S resources created"),
                Status::maintenance("Creating K8S resources"),
                Status::maintenance("K8S resources created"),
            ]
        );
    }

    #[tokio::test]
    async fn test_conflict_without_force_is_fatal() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.conflict_on("Service/kubeflow/ml-pipeline");
        let model = FakeModel::leader();

        let err = convergence(&cluster).apply(&model, false).await.unwrap_err();
        assert!(err.status().is_none());
        assert!(cluster.forced_applies().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_with_force_retries_forced() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.conflict_on("Service/kubeflow/ml-pipeline");
        let model = FakeModel::leader();

        convergence(&cluster).apply(&model, true).await.unwrap();
        assert_eq!(cluster.forced_applies().len(), 4);
        assert!(model
            .statuses()
            .contains(&Status::maintenance("Force applying K8S resources")));
    }

    #[tokio::test]
    async fn test_force_is_not_used_without_conflict() {
        let cluster = Arc::new(FakeCluster::default());
        let model = FakeModel::leader();

        convergence(&cluster).apply(&model, true).await.unwrap();
        assert!(cluster.forced_applies().is_empty());
    }

    #[tokio::test]
    async fn test_remove_tolerates_missing_objects() {
        let cluster = Arc::new(FakeCluster::default());
        let model = FakeModel::leader();
        let resources = convergence(&cluster);

        resources.remove(&model).await.unwrap();
        resources.apply(&model, false).await.unwrap();
        resources.remove(&model).await.unwrap();
        assert!(cluster.objects().is_empty());
        assert_eq!(model.statuses().last(), Some(&Status::maintenance("K8S resources removed")));
    }
}
