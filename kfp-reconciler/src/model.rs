//! Access to the unit's view of the deployment

use async_trait::async_trait;
use kfp_models::{Databag, Relation, Status};

/// The unit's handle on the orchestrator: leadership, relations and status
///
/// Every read returns current state; nothing is cached between calls.
#[async_trait]
pub trait UnitModel: Send + Sync {
    /// Name of the application this unit belongs to
    fn app_name(&self) -> &str;

    /// Name of the model, which is also the Kubernetes namespace
    fn model_name(&self) -> &str;

    async fn is_leader(&self) -> anyhow::Result<bool>;

    /// All established relations on an endpoint, ordered by relation id
    async fn relations(&self, name: &str) -> anyhow::Result<Vec<Relation>>;

    /// Merge `data` into this application's databag on `relation`
    async fn set_app_data(&self, relation: &Relation, data: &Databag) -> anyhow::Result<()>;

    /// Publish a status for this unit
    async fn set_status(&self, status: &Status) -> anyhow::Result<()>;
}

/// True when `relation` is missing any of `data`'s entries or has a different value
pub fn needs_update(relation: &Relation, data: &Databag) -> bool {
    data.iter()
        .any(|(key, value)| relation.local_app_data.get(key) != Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_update_only_when_values_differ() {
        let mut relation = Relation::default();
        relation.local_app_data.insert("database".to_string(), "mlpipeline".to_string());
        relation.local_app_data.insert("extra".to_string(), "kept".to_string());

        let same = Databag::from([("database".to_string(), "mlpipeline".to_string())]);
        let changed = Databag::from([("database".to_string(), "other".to_string())]);
        let added = Databag::from([("new".to_string(), "1".to_string())]);

        assert!(!needs_update(&relation, &same));
        assert!(needs_update(&relation, &changed));
        assert!(needs_update(&relation, &added));
    }
}
