//! TCC Fence maintenance binary
//!
//! ```text
//! tcc_fence [--env dev] [--init-schema] [--clean-once]
//! ```
//!
//! - `--init-schema`: create the fence log table and index if missing
//! - `--clean-once`: run one cleanup pass and exit
//! - otherwise: run the periodic cleaner until Ctrl-C

use anyhow::{Context, bail};
use std::sync::Arc;

use tcc_fence::PgFenceRuntime;
use tcc_fence::config::AppConfig;
use tcc_fence::db::Database;
use tcc_fence::fence::runtime::{DEFAULT_DATA_SOURCE_NAME, DEFAULT_TRANSACTION_MANAGER_NAME};
use tcc_fence::fence::{
    CleanMode, DataSource, FenceCleaner, FenceConfig, FenceCoordinator, FenceRuntime,
    PgFenceLogStore, ResourceRegistry,
};

static FENCE: PgFenceRuntime = FenceRuntime::new();

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = tcc_fence::logging::init_logging(&app_config);

    tracing::info!(git_hash = env!("GIT_HASH"), "Starting TCC fence in {} mode", env);

    let Some(postgres_url) = app_config.postgres_url.as_deref() else {
        bail!("postgres_url is not configured for env '{}'", env);
    };
    let db = Database::connect(postgres_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.health_check().await.context("PostgreSQL health check failed")?;
    let pool = db.pool().clone();

    if has_flag("--init-schema") {
        PgFenceLogStore::new(pool.clone(), &app_config.fence.log_table_name)?
            .ensure_schema()
            .await?;
        tracing::info!(table = %app_config.fence.log_table_name, "Fence schema ready");
    }

    let mut registry = ResourceRegistry::new();
    registry
        .register_data_source(DEFAULT_DATA_SOURCE_NAME, pool.clone())
        .register_transaction_manager(DEFAULT_TRANSACTION_MANAGER_NAME, pool);

    let settings = app_config.fence.clone();

    if has_flag("--clean-once") {
        let config = FenceConfig::resolve(&registry, settings)?;
        let store = config
            .data_source
            .open_log_store(&config.settings.log_table_name)?;
        let coordinator = Arc::new(FenceCoordinator::new(
            store,
            config.transaction_manager,
            config.settings,
        ));
        let deleted = FenceCleaner::from_settings(coordinator).run_once().await?;
        tracing::info!(count = deleted, "Single cleanup pass finished");
        return Ok(());
    }

    let handle = FENCE.get_or_init(|| FenceConfig::resolve(&registry, settings))?;

    if app_config.fence.clean_mode == CleanMode::OnCommit {
        tracing::info!("ON_COMMIT mode - rows are cleaned inline, nothing to run");
        return Ok(());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown signal received");
    handle.stop_cleaner();

    Ok(())
}
