use std::path::PathBuf;

use anyhow::{Context, Result};

use kfp_reconciler::names::workload;

/// Hook execution environment set by the orchestrator
#[derive(Debug, Clone)]
pub struct HookEnv {
    pub unit_name: String,
    pub app_name: String,
    pub model_name: String,
    pub charm_dir: PathBuf,
    pub pebble_socket: PathBuf,
}

impl HookEnv {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let unit_name = std::env::var("JUJU_UNIT_NAME").context("JUJU_UNIT_NAME must be set")?;
        let app_name = app_of(&unit_name)
            .with_context(|| format!("JUJU_UNIT_NAME is not a unit name: {}", unit_name))?;

        Ok(Self {
            app_name,
            unit_name,
            model_name: std::env::var("JUJU_MODEL_NAME")
                .context("JUJU_MODEL_NAME must be set")?,
            charm_dir: std::env::var("JUJU_CHARM_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            pebble_socket: std::env::var("PEBBLE_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    PathBuf::from(format!("/charm/containers/{}/pebble.socket", workload::CONTAINER))
                }),
        })
    }
}

/// "kfp-api/0" -> "kfp-api"
fn app_of(unit_name: &str) -> Option<String> {
    let (app, number) = unit_name.rsplit_once('/')?;
    (!app.is_empty() && number.parse::<u32>().is_ok()).then(|| app.to_string())
}
