//! Taskmill worker service.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskmill_config::WorkerConfig;
use taskmill_db::{create_pool, run_migrations, PgDispatchRepo, PgJobRepo, PgWorkerRepo};
use taskmill_worker::shutdown::install_shutdown_handler;
use taskmill_worker::{Worker, WorkerIdentity};

#[derive(Parser)]
#[command(name = "taskmill-worker")]
#[command(about = "Claims dispatches and executes job scripts", long_about = None)]
struct Args {
    /// Database connection string
    #[arg(long, env = "TASKMILL_DB_URL")]
    db_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = WorkerConfig::from_env()?;
    let identity = WorkerIdentity::generate();
    info!(
        worker_id = %identity.worker_id,
        script_root = %config.script_root.display(),
        "initializing worker"
    );

    let db_url = args.db_url.unwrap_or_else(taskmill_config::database_url);
    let pool = create_pool(&db_url).await?;
    run_migrations(&pool).await?;

    let worker = Worker::new(
        config,
        identity,
        Arc::new(PgJobRepo::new(pool.clone())),
        Arc::new(PgDispatchRepo::new(pool.clone())),
        Arc::new(PgWorkerRepo::new(pool)),
    );

    let shutdown = install_shutdown_handler();
    worker.run(shutdown).await?;

    info!("worker stopped");
    Ok(())
}
