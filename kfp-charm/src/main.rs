use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kfp_models::Trigger;
use kfp_reconciler::engine::Operator;
use kfp_reconciler::k8s_client::{get_k8s_client, KubeClusterApi};
use kfp_reconciler::model::UnitModel;
use kfp_reconciler::names::workload;
use kfp_reconciler::pebble::PebbleClient;

mod cli;
mod config;
mod hook_tools;

use cli::Args;
use config::HookEnv;
use hook_tools::HookToolsModel;

/// Initialize tracing to stderr, which the orchestrator copies into its debug log
///
/// The returned guard must be held until exit or buffered lines are lost.
fn initialize_tracing() -> WorkerGuard {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kfp_reconciler=debug,kfp_charm=debug".into());

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .init();

    guard
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let _guard = initialize_tracing();

    let Some(hook) = args.hook_name() else {
        anyhow::bail!("No hook to dispatch: set JUJU_DISPATCH_PATH or pass the hook name");
    };
    let Some(trigger) = Trigger::from_hook(&hook, workload::CONTAINER) else {
        tracing::info!(hook = %hook, "ignoring hook");
        return Ok(());
    };

    let env = HookEnv::load()?;
    tracing::debug!(
        unit = %env.unit_name,
        model = %env.model_name,
        charm_dir = %env.charm_dir.display(),
        "hook environment loaded"
    );

    let model = Arc::new(HookToolsModel::new(&env.app_name, &env.model_name));
    let config = model.config().await?;
    let workload = Arc::new(PebbleClient::new(&env.pebble_socket));
    let cluster = Arc::new(KubeClusterApi::new(get_k8s_client().await?, &env.model_name));
    let operator = Operator::new(model.clone(), workload, cluster, config)?;

    match operator.handle(&trigger).await {
        Ok(Some(status)) => model.set_status(&status).await,
        Ok(None) => Ok(()),
        Err(e) => {
            tracing::error!(hook = %hook, error = ?e, "hook failed");
            Err(e)
        }
    }
}
