//! Unit model backed by the orchestrator's hook tools
//!
//! Every query shells out to a hook tool (`relation-get`, `status-set`, ...)
//! with JSON output.

use std::collections::BTreeMap;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use kfp_models::{CharmConfig, Databag, Relation, Status};
use kfp_reconciler::model::UnitModel;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

pub struct HookToolsModel {
    app_name: String,
    model_name: String,
    leader: OnceCell<bool>,
}

impl HookToolsModel {
    pub fn new(app_name: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            model_name: model_name.into(),
            leader: OnceCell::new(),
        }
    }

    /// Operator options, with defaults for anything unset
    pub async fn config(&self) -> Result<CharmConfig> {
        self.run_json("config-get", &["--format=json"]).await
    }

    async fn run(&self, tool: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<String> {
        debug!(tool = %tool, args = ?args, "running hook tool");
        let mut cmd = Command::new(tool);
        cmd.args(args);
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to run {}", tool))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                tool,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8(output.stdout)?)
    }

    async fn run_json<T: DeserializeOwned>(&self, tool: &str, args: &[&str]) -> Result<T> {
        let stdout = self.run(tool, args, None).await?;
        parse_json(&stdout).with_context(|| format!("Unexpected output from {}", tool))
    }

    async fn read_bag(&self, relation_id: &str, target: &str, app: bool) -> Result<Databag> {
        let mut args = vec!["-r", relation_id, "--format=json"];
        if app {
            args.push("--app");
        }
        args.extend(["-", target]);
        self.run_json("relation-get", &args).await
    }

    async fn load_relation(&self, relation_id: &str) -> Result<Relation> {
        let (name, id) = parse_relation_id(relation_id)?;
        let units: Vec<String> = self
            .run_json("relation-list", &["-r", relation_id, "--format=json"])
            .await?;
        let remote_app = match self
            .run_json::<String>("relation-list", &["-r", relation_id, "--app", "--format=json"])
            .await
        {
            Ok(app) if !app.is_empty() => Some(app),
            _ => units.first().and_then(|unit| app_of(unit)),
        };

        let app_data = match &remote_app {
            Some(app) => self.read_bag(relation_id, app, true).await?,
            None => Databag::new(),
        };
        // Only the leader may read its own application bag
        let local_app_data = if self.is_leader().await? {
            self.read_bag(relation_id, &self.app_name, true).await?
        } else {
            Databag::new()
        };
        let mut unit_data = BTreeMap::new();
        for unit in units {
            let bag = self.read_bag(relation_id, &unit, false).await?;
            unit_data.insert(unit, bag);
        }

        Ok(Relation {
            id,
            name,
            remote_app,
            app_data,
            local_app_data,
            units: unit_data,
        })
    }
}

#[async_trait]
impl UnitModel for HookToolsModel {
    fn app_name(&self) -> &str {
        &self.app_name
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn is_leader(&self) -> Result<bool> {
        self.leader
            .get_or_try_init(|| self.run_json("is-leader", &["--format=json"]))
            .await
            .copied()
    }

    async fn relations(&self, name: &str) -> Result<Vec<Relation>> {
        let ids: Vec<String> = self
            .run_json("relation-ids", &[name, "--format=json"])
            .await?;
        let mut relations = Vec::with_capacity(ids.len());
        for relation_id in ids {
            relations.push(self.load_relation(&relation_id).await?);
        }
        relations.sort_by_key(|relation| relation.id);
        Ok(relations)
    }

    async fn set_app_data(&self, relation: &Relation, data: &Databag) -> Result<()> {
        let relation_id = relation.relation_id();
        let payload = serde_yaml::to_string(data)?;
        self.run(
            "relation-set",
            &["-r", &relation_id, "--app", "--file", "-"],
            Some(payload.as_bytes()),
        )
        .await?;
        Ok(())
    }

    async fn set_status(&self, status: &Status) -> Result<()> {
        if let Err(e) = self
            .run("status-set", &[status.name(), status.message()], None)
            .await
        {
            warn!(status = %status, error = %e, "Failed to set status");
            return Err(e);
        }
        Ok(())
    }
}

/// Hook tools print `null` for empty results
fn parse_json<T: DeserializeOwned>(stdout: &str) -> Result<T> {
    let value: serde_json::Value = match stdout.trim() {
        "" => serde_json::Value::Null,
        raw => serde_json::from_str(raw)?,
    };
    let value = match value {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other,
    };
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Ok(parsed),
        // Empty lists also come back as null
        Err(_) if value == serde_json::Value::Object(Default::default()) => {
            Ok(serde_json::from_value(serde_json::Value::Array(Vec::new()))?)
        }
        Err(e) => Err(e.into()),
    }
}

/// "mysql:3" -> ("mysql", 3)
fn parse_relation_id(relation_id: &str) -> Result<(String, u32)> {
    let (name, id) = relation_id
        .rsplit_once(':')
        .with_context(|| format!("Invalid relation id {}", relation_id))?;
    let id = id
        .parse()
        .with_context(|| format!("Invalid relation id {}", relation_id))?;
    Ok((name.to_string(), id))
}

fn app_of(unit: &str) -> Option<String> {
    unit.rsplit_once('/').map(|(app, _)| app.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relation_id() {
        assert_eq!(parse_relation_id("relational-db:12").unwrap(), ("relational-db".to_string(), 12));
        assert!(parse_relation_id("mysql").is_err());
        assert!(parse_relation_id("mysql:x").is_err());
    }

    #[test]
    fn test_null_output_parses_as_empty() {
        let bag: Databag = parse_json("null\n").unwrap();
        assert!(bag.is_empty());
        let ids: Vec<String> = parse_json("null").unwrap();
        assert!(ids.is_empty());
        let config: CharmConfig = parse_json("").unwrap();
        assert_eq!(config, CharmConfig::default());
    }

    #[test]
    fn test_config_output_overrides_defaults() {
        let config: CharmConfig = parse_json(r#"{"http-port": 9999, "cache-enabled": false}"#).unwrap();
        assert_eq!(config.http_port, 9999);
        assert!(!config.cache_enabled);
        assert_eq!(config.grpc_port, 8887);
    }

    #[test]
    fn test_app_of_unit() {
        assert_eq!(app_of("mysql/0").as_deref(), Some("mysql"));
        assert_eq!(app_of("mysql"), None);
    }
}
