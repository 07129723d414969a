//! The supervised API server process
//!
//! The workload container runs a process supervisor that accepts layers
//! (service and health check definitions), stores files pushed by the
//! operator and reports check results.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kfp_models::CharmConfig;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{ReconcileError, Result};
use crate::names::workload;

/// Layer of service and check definitions
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Layer {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, CheckSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceSpec {
    #[serde(rename = "override", default, skip_serializing_if = "String::is_empty")]
    pub override_policy: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub startup: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on_check_failure: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckSpec {
    #[serde(rename = "override", default, skip_serializing_if = "String::is_empty")]
    pub override_policy: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub period: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(default)]
    pub threshold: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpCheck>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpCheck {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
}

/// Process supervisor inside the workload container
#[async_trait]
pub trait Workload: Send + Sync {
    /// True once the supervisor answers
    async fn can_connect(&self) -> bool;

    /// Write a file, creating parent directories
    async fn push(&self, path: &str, content: &[u8]) -> anyhow::Result<()>;

    /// Current combined plan
    async fn plan(&self) -> anyhow::Result<Layer>;

    /// Add `layer` under `label`, merging with an existing layer of that label
    async fn add_layer(&self, label: &str, layer: &Layer) -> anyhow::Result<()>;

    /// Restart services whose definition changed and start enabled ones
    async fn replan(&self) -> anyhow::Result<()>;

    /// Status of a named check; `None` when no such check exists
    async fn get_check(&self, name: &str) -> anyhow::Result<Option<CheckStatus>>;
}

/// Command line of the API server
fn exec_command() -> String {
    // Short delay before exec: the supervisor can report the service as
    // started before the container's filesystem settles
    format!(
        "sleep 1.1 && /bin/apiserver --config={} --sampleconfig={} -logtostderr=true ",
        workload::CONFIG_DIR,
        workload::SAMPLE_CONFIG
    )
}

/// Layer running the API server with its liveness check
pub fn api_server_layer(config: &CharmConfig, namespace: &str) -> Layer {
    let service = ServiceSpec {
        override_policy: "replace".to_string(),
        summary: "ML Pipeline API Server".to_string(),
        command: format!("bash -c '{}'", exec_command()),
        startup: "enabled".to_string(),
        environment: BTreeMap::from([("POD_NAMESPACE".to_string(), namespace.to_string())]),
        on_check_failure: BTreeMap::from([(workload::CHECK.to_string(), "restart".to_string())]),
    };
    let check = CheckSpec {
        override_policy: "replace".to_string(),
        period: "5m".to_string(),
        timeout: "60s".to_string(),
        threshold: 3,
        http: Some(HttpCheck {
            url: format!("http://localhost:{}{}", config.http_port, workload::PROBE_PATH),
        }),
    };

    Layer {
        summary: "kfp-api layer".to_string(),
        description: "Pebble config layer for kfp-api".to_string(),
        services: BTreeMap::from([(workload::SERVICE.to_string(), service)]),
        checks: BTreeMap::from([(workload::CHECK.to_string(), check)]),
    }
}

/// Apply `layer` unless the plan already carries identical definitions
///
/// Returns whether the plan was changed.
pub async fn update_layer(workload: &dyn Workload, label: &str, layer: &Layer) -> Result<bool> {
    let plan = workload.plan().await?;
    let unchanged = layer
        .services
        .iter()
        .all(|(name, spec)| plan.services.get(name).map(|s| same_service(s, spec)).unwrap_or(false))
        && layer
            .checks
            .iter()
            .all(|(name, spec)| plan.checks.get(name).map(|c| same_check(c, spec)).unwrap_or(false));
    if unchanged {
        return Ok(false);
    }

    info!(label = %label, "updating workload layer");
    workload.add_layer(label, layer).await?;
    workload.replan().await.map_err(|e| {
        error!(error = %e, "replan failed");
        ReconcileError::blocked("Failed to replan")
    })?;
    Ok(true)
}

// The plan echoes definitions without the override policy
fn same_service(current: &ServiceSpec, wanted: &ServiceSpec) -> bool {
    ServiceSpec { override_policy: String::new(), ..current.clone() }
        == ServiceSpec { override_policy: String::new(), ..wanted.clone() }
}

// Durations come back in the supervisor's own notation ("5m" as "5m0s")
fn same_check(current: &CheckSpec, wanted: &CheckSpec) -> bool {
    same_duration(&current.period, &wanted.period)
        && same_duration(&current.timeout, &wanted.timeout)
        && current.threshold == wanted.threshold
        && current.http == wanted.http
}

fn same_duration(current: &str, wanted: &str) -> bool {
    current == wanted
        || matches!(
            (duration_secs(current), duration_secs(wanted)),
            (Some(a), Some(b)) if (a - b).abs() < 1e-9
        )
}

/// Seconds in a duration such as "60s", "1m0s" or "1h30m"
fn duration_secs(raw: &str) -> Option<f64> {
    let mut rest = raw.trim();
    if rest.is_empty() {
        return None;
    }
    let mut total = 0.0;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(digits);
        let value: f64 = number.parse().ok()?;
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let scale = match unit {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return None,
        };
        total += value * scale;
        rest = next;
    }
    Some(total)
}
