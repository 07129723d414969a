//! KFP Reconciler - reconciliation logic for the Kubeflow Pipelines API operator
//!
//! The [`engine::Operator`] drives one trigger at a time against three
//! collaborators: the orchestrator's unit model, the workload's process
//! supervisor and the Kubernetes API.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kfp_models::{CharmConfig, Trigger};
//! use kfp_reconciler::engine::Operator;
//! use kfp_reconciler::k8s_client::{get_k8s_client, KubeClusterApi};
//! use kfp_reconciler::model::UnitModel;
//! use kfp_reconciler::pebble::PebbleClient;
//!
//! # async fn example(model: Arc<dyn UnitModel>) -> anyhow::Result<()> {
//! let cluster = KubeClusterApi::new(get_k8s_client().await?, model.model_name());
//! let workload = PebbleClient::new("/charm/containers/ml-pipeline-api-server/pebble.socket");
//! let operator = Operator::new(model.clone(), Arc::new(workload), Arc::new(cluster), CharmConfig::default())?;
//! if let Some(status) = operator.handle(&Trigger::ConfigChanged).await? {
//!     model.set_status(&status).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod names;
pub mod error;
pub mod model;

// Relation handling
pub mod interfaces;
pub mod relation_data;
pub mod database;

// Workload and cluster
pub mod workload;
pub mod workload_config;
pub mod pebble;
pub mod resources;
pub mod service_patch;
pub mod k8s_client;

pub mod engine;

#[cfg(test)]
mod testing;

pub use engine::Operator;
pub use error::{ReconcileError, Result};
