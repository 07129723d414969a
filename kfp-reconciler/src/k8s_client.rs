//! Shared Kubernetes client utilities

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{self, Scope};
use kube::Client;
use tracing::debug;

use crate::resources::{describe, ApplyError, ClusterApi};

/// Get a Kubernetes client
pub async fn get_k8s_client() -> Result<Client> {
    Client::try_default()
        .await
        .context("Failed to create Kubernetes client")
}

/// [`ClusterApi`] backed by the API server
///
/// Objects without a namespace are placed in `namespace` when their kind is
/// namespaced.
pub struct KubeClusterApi {
    client: Client,
    namespace: String,
}

impl KubeClusterApi {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Resolve the typed endpoint for `object` through discovery
    async fn api_for(&self, object: &DynamicObject) -> Result<Api<DynamicObject>, ApplyError> {
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("{} has no apiVersion/kind", describe(object)))?;
        let gvk = GroupVersionKind::try_from(types)
            .map_err(|e| anyhow::anyhow!("Invalid apiVersion on {}: {}", describe(object), e))?;
        let (resource, capabilities) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .with_context(|| format!("Failed to discover {}", gvk.kind))?;

        Ok(match capabilities.scope {
            Scope::Namespaced => {
                let namespace = object.metadata.namespace.as_deref().unwrap_or(&self.namespace);
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        })
    }
}

fn object_name(object: &DynamicObject) -> Result<&str, ApplyError> {
    object
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ApplyError::Other(anyhow::anyhow!("{} has no name", describe(object))))
}

fn classify(object: &DynamicObject, err: kube::Error) -> ApplyError {
    match err {
        kube::Error::Api(response) if response.code == 409 => ApplyError::Conflict(describe(object)),
        kube::Error::Api(response) if response.code == 404 => ApplyError::NotFound(describe(object)),
        e => ApplyError::Other(
            anyhow::Error::new(e).context(format!("Request for {} failed", describe(object))),
        ),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn apply(
        &self,
        object: &DynamicObject,
        field_manager: &str,
        force: bool,
    ) -> Result<(), ApplyError> {
        let api = self.api_for(object).await?;
        let name = object_name(object)?;
        let mut params = PatchParams::apply(field_manager);
        if force {
            params = params.force();
        }
        api.patch(name, &params, &Patch::Apply(object))
            .await
            .map_err(|e| classify(object, e))?;
        debug!(object = %describe(object), force, "applied");
        Ok(())
    }

    async fn delete(&self, object: &DynamicObject) -> Result<(), ApplyError> {
        let api = self.api_for(object).await?;
        let name = object_name(object)?;
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify(object, e))?;
        Ok(())
    }
}
