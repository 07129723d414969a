//! Database connection resolution
//!
//! Two mutually exclusive relations can provide the database: the deprecated
//! `mysql` relation, which carries raw credentials in the remote unit's
//! databag, and `relational-db`, where we publish a request for a database
//! and the provider answers in its application databag. Resolution runs on
//! every pass since either relation may come or go between triggers.

use std::collections::BTreeMap;

use kfp_models::{Databag, DatabaseParams, Relation, Status, Trigger};
use tracing::{error, info, warn};

use crate::error::{ReconcileError, Result};
use crate::model::{needs_update, UnitModel};
use crate::names::{messages, relations, workload};

const LEGACY_USERNAME: &str = "root";
const LEGACY_KEYS: [&str; 4] = ["database", "root_password", "host", "port"];
const MODERN_KEYS: [&str; 3] = ["password", "username", "endpoints"];

/// Which database relations are currently established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseTopology {
    NoRelation,
    LegacyOnly,
    ModernOnly,
    BothPresent,
}

impl DatabaseTopology {
    pub fn from_presence(legacy: bool, modern: bool) -> Self {
        match (legacy, modern) {
            (false, false) => DatabaseTopology::NoRelation,
            (true, false) => DatabaseTopology::LegacyOnly,
            (false, true) => DatabaseTopology::ModernOnly,
            (true, true) => DatabaseTopology::BothPresent,
        }
    }
}

/// Status reported while both database relations are established
pub fn conflict_status() -> Status {
    Status::blocked(format!("{} See logs", messages::UNBLOCK_MESSAGE))
}

fn log_conflict() {
    error!("{} {}", messages::MYSQL_WARNING, messages::UNBLOCK_MESSAGE);
}

/// Client side of the database request/response exchange on `relational-db`
#[derive(Debug, Clone)]
pub struct DatabaseRequires {
    relation_name: &'static str,
    database_name: &'static str,
}

impl Default for DatabaseRequires {
    fn default() -> Self {
        Self {
            relation_name: relations::RELATIONAL_DB,
            database_name: workload::DATABASE_NAME,
        }
    }
}

impl DatabaseRequires {
    pub fn database_name(&self) -> &str {
        self.database_name
    }

    /// Publish the database request on every relation that lacks it (leader only)
    pub async fn request_database(&self, model: &dyn UnitModel) -> anyhow::Result<()> {
        let request = Databag::from([("database".to_string(), self.database_name.to_string())]);
        for relation in model.relations(self.relation_name).await? {
            if needs_update(&relation, &request) {
                info!(relation = %relation.relation_id(), database = %self.database_name, "requesting database");
                model.set_app_data(&relation, &request).await?;
            }
        }
        Ok(())
    }

    /// Provider responses keyed by relation id
    pub async fn fetch_relation_data(
        &self,
        model: &dyn UnitModel,
    ) -> anyhow::Result<BTreeMap<u32, Databag>> {
        Ok(model
            .relations(self.relation_name)
            .await?
            .into_iter()
            .map(|relation| (relation.id, relation.app_data))
            .collect())
    }
}

/// Relations of `name`, leaving out a relation that is being broken
async fn established(
    model: &dyn UnitModel,
    name: &str,
    broken: Option<&str>,
) -> anyhow::Result<Vec<Relation>> {
    if broken == Some(name) {
        return Ok(Vec::new());
    }
    model.relations(name).await
}

/// Resolve the database connection for this pass
///
/// `broken` names a relation whose broken hook is running; it no longer
/// provides a database.
pub async fn resolve(
    model: &dyn UnitModel,
    requires: &DatabaseRequires,
    broken: Option<&str>,
) -> Result<DatabaseParams> {
    let legacy = established(model, relations::MYSQL, broken).await?;
    let modern = established(model, relations::RELATIONAL_DB, broken).await?;

    if DatabaseTopology::from_presence(!legacy.is_empty(), !modern.is_empty())
        == DatabaseTopology::BothPresent
    {
        log_conflict();
        return Err(ReconcileError::Status(conflict_status()));
    }

    if let Some(params) = legacy_params(&legacy)? {
        return Ok(params);
    }
    if modern.is_empty() {
        return Err(ReconcileError::blocked(messages::ADD_DATABASE_RELATION));
    }
    if let Some(params) = modern_params(model, requires).await? {
        return Ok(params);
    }
    Err(ReconcileError::blocked(messages::ADD_DATABASE_RELATION))
}

/// Read the `mysql` relation; `None` when it is not established
fn legacy_params(legacy: &[Relation]) -> Result<Option<DatabaseParams>> {
    let Some(relation) = legacy.first() else {
        return Ok(None);
    };
    let empty = Databag::new();
    let data = relation.first_unit_data().unwrap_or(&empty);

    let missing: Vec<&str> = LEGACY_KEYS
        .into_iter()
        .filter(|key| !data.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        error!(missing = ?missing, "Missing attributes in mysql relation data");
        return Err(ReconcileError::waiting(
            "Incorrect/incomplete data found in relation mysql. See logs",
        ));
    }

    Ok(Some(DatabaseParams {
        name: data["database"].clone(),
        password: data["root_password"].clone(),
        username: LEGACY_USERNAME.to_string(),
        host: data["host"].clone(),
        port: data["port"].clone(),
    }))
}

/// Read the `relational-db` responses; `None` when the relation is not established
async fn modern_params(
    model: &dyn UnitModel,
    requires: &DatabaseRequires,
) -> Result<Option<DatabaseParams>> {
    let responses = requires.fetch_relation_data(model).await?;
    if responses.is_empty() {
        return Ok(None);
    }

    let Some(data) = responses.values().find(|data| !data.is_empty()) else {
        info!("Found empty relation data for relational-db relation.");
        return Err(ReconcileError::waiting("Waiting for relational-db data"));
    };

    let incomplete = || {
        ReconcileError::waiting("Incorrect/incomplete data found in relation relational-db. See logs")
    };
    let missing: Vec<&str> = MODERN_KEYS
        .into_iter()
        .filter(|key| !data.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        error!(missing = ?missing, "Missing attributes in relational-db relation data");
        return Err(incomplete());
    }

    let endpoints = &data["endpoints"];
    let (host, port) = match endpoints.split(':').collect::<Vec<_>>().as_slice() {
        [host, port] => (host.to_string(), port.to_string()),
        _ => {
            error!(endpoints = %endpoints, "Malformed endpoints in relational-db relation data");
            return Err(incomplete());
        }
    };

    Ok(Some(DatabaseParams {
        name: requires.database_name().to_string(),
        password: data["password"].clone(),
        username: data["username"].clone(),
        host,
        port,
    }))
}

/// Outcome of the exclusivity check run before database relation events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precheck {
    /// Continue to the full pass, reporting this progress status first
    Proceed(Status),
    /// Stop without running the pass
    Halt(Status),
}

/// Check database relation exclusivity for a `mysql` or `relational-db` event
///
/// Returns `None` for triggers about other relations. On departed/broken
/// events the departing relation no longer counts towards the check.
pub async fn precheck(model: &dyn UnitModel, trigger: &Trigger) -> anyhow::Result<Option<Precheck>> {
    let (relation, leaving) = match trigger {
        Trigger::RelationJoined(name) | Trigger::RelationChanged(name) => (name.as_str(), false),
        Trigger::RelationDeparted(name) | Trigger::RelationBroken(name) => (name.as_str(), true),
        _ => return Ok(None),
    };
    if relation != relations::MYSQL && relation != relations::RELATIONAL_DB {
        return Ok(None);
    }

    let legacy = model.relations(relations::MYSQL).await?.len();
    let modern = model.relations(relations::RELATIONAL_DB).await?.len();
    let departing = |name: &str| usize::from(leaving && relation == name);
    let legacy_remaining = legacy.saturating_sub(departing(relations::MYSQL));
    let modern_remaining = modern.saturating_sub(departing(relations::RELATIONAL_DB));

    if relation == relations::MYSQL && !leaving && legacy > 1 {
        return Ok(Some(Precheck::Halt(Status::blocked(format!(
            "Too many mysql relations. {}",
            messages::MYSQL_WARNING
        )))));
    }

    if DatabaseTopology::from_presence(legacy_remaining > 0, modern_remaining > 0)
        == DatabaseTopology::BothPresent
    {
        if relation == relations::MYSQL {
            warn!("Up-to-date database relation relational-db is already established.");
        } else {
            warn!("Failed to create relational-db relation due to existing mysql relation.");
        }
        log_conflict();
        return Ok(Some(Precheck::Halt(conflict_status())));
    }

    let progress = match (relation == relations::MYSQL, leaving) {
        (true, false) => {
            warn!("{}", messages::MYSQL_WARNING);
            format!("Adding mysql relation. {}", messages::MYSQL_WARNING)
        }
        (true, true) => format!("Removing mysql relation. {}", messages::MYSQL_WARNING),
        (false, false) => "Adding relational-db relation".to_string(),
        (false, true) => "Removing relational-db relation".to_string(),
    };
    Ok(Some(Precheck::Proceed(Status::maintenance(progress))))
}
