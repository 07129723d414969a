//! Reconciliation engine
//!
//! Every trigger is dispatched through [`Operator::handle`]. Most triggers run
//! the full pass:
//! 1. Leadership check
//! 2. Interface negotiation
//! 3. Configuration document (database resolution + relation validation)
//! 4. Workload reachability
//! 5. Configuration files pushed to the workload
//! 6. Cluster resources applied
//! 7. Workload layer updated
//! 8. Connection data published to consumers
//!
//! A step that fails with a status ends the pass with that status. Work done
//! by earlier steps is kept; the next trigger starts again from step 1.

use std::collections::BTreeMap;
use std::sync::Arc;

use kfp_models::{CharmConfig, Status, Trigger};
use tracing::{error, info, warn};

use crate::database::{self, DatabaseRequires, Precheck};
use crate::error::{ReconcileError, Result};
use crate::interfaces::{get_interfaces, Interface, Interfaces, OPERATOR_INTERFACES};
use crate::model::UnitModel;
use crate::names::{messages, relations, workload, FIELD_MANAGER};
use crate::relation_data::classify_negotiation;
use crate::resources::{ClusterApi, ResourceContext, ResourceConvergence};
use crate::service_patch::patch_service_ports;
use crate::workload::{api_server_layer, update_layer, CheckStatus, Workload};
use crate::workload_config;

const SAMPLE_CONFIG: &str = include_str!("../files/sample_config.json");

/// Relations whose changes feed the configuration document
const WATCHED_RELATIONS: [&str; 3] = [relations::OBJECT_STORAGE, relations::KFP_VIZ, relations::KFP_API];

/// The operator with its collaborators
pub struct Operator {
    model: Arc<dyn UnitModel>,
    workload: Arc<dyn Workload>,
    cluster: Arc<dyn ClusterApi>,
    resources: ResourceConvergence,
    database: DatabaseRequires,
    config: CharmConfig,
}

impl Operator {
    pub fn new(
        model: Arc<dyn UnitModel>,
        workload: Arc<dyn Workload>,
        cluster: Arc<dyn ClusterApi>,
        config: CharmConfig,
    ) -> anyhow::Result<Self> {
        let context = ResourceContext::new(model.app_name(), model.model_name(), &config);
        let resources = ResourceConvergence::new(cluster.clone(), context, FIELD_MANAGER)?;
        Ok(Self {
            model,
            workload,
            cluster,
            resources,
            database: DatabaseRequires::default(),
            config,
        })
    }

    /// Handle one trigger to completion
    ///
    /// Returns the status to publish, or `None` when the trigger is not
    /// handled and the current status stands. Errors are fatal to the trigger.
    pub async fn handle(&self, trigger: &Trigger) -> anyhow::Result<Option<Status>> {
        info!(trigger = %trigger, "handling trigger");
        let status = match trigger {
            Trigger::Install => self.install().await?,
            Trigger::Upgrade => self.upgrade().await?,
            Trigger::Remove => self.remove().await?,
            Trigger::PeriodicCheck => self.update_status(trigger).await?,
            Trigger::LeaderElected | Trigger::ConfigChanged | Trigger::WorkloadReady => {
                self.reconcile(trigger, false).await?
            }
            Trigger::RelationJoined(name)
            | Trigger::RelationChanged(name)
            | Trigger::RelationDeparted(name)
            | Trigger::RelationBroken(name)
                if name == relations::MYSQL || name == relations::RELATIONAL_DB =>
            {
                match database::precheck(self.model.as_ref(), trigger).await? {
                    Some(Precheck::Halt(status)) => status,
                    Some(Precheck::Proceed(progress)) => {
                        self.model.set_status(&progress).await?;
                        self.reconcile(trigger, false).await?
                    }
                    None => self.reconcile(trigger, false).await?,
                }
            }
            Trigger::RelationJoined(name) | Trigger::RelationChanged(name)
                if WATCHED_RELATIONS.contains(&name.as_str()) =>
            {
                self.reconcile(trigger, false).await?
            }
            _ => {
                info!(trigger = %trigger, "no handler for trigger");
                return Ok(None);
            }
        };
        info!(trigger = %trigger, status = %status, "trigger handled");
        Ok(Some(status))
    }

    /// Run the full pass and turn its outcome into a status
    async fn reconcile(&self, trigger: &Trigger, force_conflicts: bool) -> anyhow::Result<Status> {
        match self.pipeline(force_conflicts, trigger.broken_relation()).await {
            Ok(()) => Ok(Status::Active),
            Err(ReconcileError::Status(status)) => {
                error!(trigger = %trigger, status = %status, "Failed to handle trigger");
                Ok(status)
            }
            Err(ReconcileError::Fatal(e)) => Err(e),
        }
    }

    /// Steps 1-8; `broken` is a relation whose broken hook is running
    async fn pipeline(&self, force_conflicts: bool, broken: Option<&str>) -> Result<()> {
        self.check_leader().await?;
        let interfaces = self.get_interfaces(broken).await?;
        let document = workload_config::generate(
            self.model.as_ref(),
            &self.database,
            &interfaces,
            &self.config,
            broken,
        )
        .await?;
        self.upload_files(&serde_json::to_vec(&document).map_err(anyhow::Error::from)?)
            .await?;
        self.resources
            .apply(self.model.as_ref(), force_conflicts)
            .await?;
        let layer = api_server_layer(&self.config, self.model.model_name());
        update_layer(self.workload.as_ref(), workload::LAYER_LABEL, &layer).await?;
        self.send_info(&interfaces).await?;
        Ok(())
    }

    async fn check_leader(&self) -> Result<()> {
        if !self.model.is_leader().await? {
            warn!("Not a leader, skipping setup");
            return Err(ReconcileError::waiting(messages::WAITING_FOR_LEADERSHIP));
        }
        Ok(())
    }

    /// Negotiate structured interfaces and make sure the database is requested
    async fn get_interfaces(&self, broken: Option<&str>) -> Result<Interfaces> {
        let interfaces = get_interfaces(self.model.as_ref(), &OPERATOR_INTERFACES)
            .await
            .map_err(classify_negotiation)?;
        if broken != Some(relations::RELATIONAL_DB) {
            self.database.request_database(self.model.as_ref()).await?;
        }
        Ok(interfaces)
    }

    async fn upload_files(&self, config_json: &[u8]) -> Result<()> {
        if !self.workload.can_connect().await {
            return Err(ReconcileError::waiting(messages::POD_STARTUP));
        }
        self.workload
            .push(workload::SAMPLE_CONFIG, SAMPLE_CONFIG.as_bytes())
            .await
            .map_err(|e| {
                error!("Failed to upload sample config to container.");
                e
            })?;
        self.workload
            .push(workload::CONFIG_FILE, config_json)
            .await
            .map_err(|e| {
                error!("Failed to upload config to container.");
                e
            })?;
        Ok(())
    }

    /// Publish this unit's service address to consumers, if any
    async fn send_info(&self, interfaces: &Interfaces) -> Result<()> {
        let Some(Some(Interface::Structured(kfp_api))) = interfaces.get(relations::KFP_API) else {
            return Ok(());
        };
        let data = BTreeMap::from([
            (
                "service-name".to_string(),
                serde_yaml::Value::from(format!(
                    "{}.{}",
                    self.model.app_name(),
                    self.model.model_name()
                )),
            ),
            (
                "service-port".to_string(),
                serde_yaml::Value::from(self.config.http_port.to_string()),
            ),
        ]);
        kfp_api.send_data(self.model.as_ref(), &data).await?;
        Ok(())
    }

    /// Pre-provision cluster objects before the workload container exists
    async fn install(&self) -> anyhow::Result<Status> {
        self.patch_service().await?;
        match self.resources.apply(self.model.as_ref(), false).await {
            Ok(()) => Ok(Status::maintenance("K8S resources created")),
            Err(ReconcileError::Status(status)) => Ok(status),
            Err(ReconcileError::Fatal(e)) => Err(e),
        }
    }

    /// Full pass, taking over conflicting fields left by a previous version
    async fn upgrade(&self) -> anyhow::Result<Status> {
        self.patch_service().await?;
        self.reconcile(&Trigger::Upgrade, true).await
    }

    async fn remove(&self) -> anyhow::Result<Status> {
        match self.resources.remove(self.model.as_ref()).await {
            Ok(()) => Ok(Status::maintenance("K8S resources removed")),
            Err(ReconcileError::Status(status)) => Ok(status),
            Err(ReconcileError::Fatal(e)) => Err(e),
        }
    }

    async fn patch_service(&self) -> anyhow::Result<()> {
        patch_service_ports(
            self.cluster.as_ref(),
            FIELD_MANAGER,
            self.model.app_name(),
            self.model.model_name(),
            &self.config,
        )
        .await
        .map_err(|e| anyhow::Error::new(e).context("Failed to patch service ports"))
    }

    /// Full pass followed by a direct health check of the workload
    async fn update_status(&self, trigger: &Trigger) -> anyhow::Result<Status> {
        let status = self.reconcile(trigger, false).await?;
        if status.halts_pass() {
            return Ok(status);
        }

        match self.check_health().await {
            Ok(()) => Ok(Status::Active),
            Err(ReconcileError::Status(status)) => {
                error!(status = %status, "Failed update status");
                Ok(status)
            }
            Err(ReconcileError::Fatal(e)) => Err(e),
        }
    }

    async fn check_health(&self) -> Result<()> {
        self.check_leader().await?;
        let check = self
            .workload
            .get_check(workload::CHECK)
            .await
            .map_err(|e| e.context("Failed to run health check on workload container"))?
            .ok_or_else(|| {
                ReconcileError::fatal(format!(
                    "Failed to run health check on workload container: no check {}",
                    workload::CHECK
                ))
            })?;

        if check == CheckStatus::Down {
            error!(
                container = %workload::CONTAINER,
                "Container failed health check. It will be restarted."
            );
            return Err(ReconcileError::maintenance(messages::HEALTH_CHECK_FAILED));
        }
        Ok(())
    }
}
