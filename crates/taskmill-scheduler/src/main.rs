//! Taskmill scheduler service.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskmill_config::SchedulerConfig;
use taskmill_db::{create_pool, run_migrations, PgDispatchRepo, PgJobRepo, PgWorkerRepo};
use taskmill_scheduler::shutdown::install_shutdown_handler;
use taskmill_scheduler::Scheduler;

#[derive(Parser)]
#[command(name = "taskmill-scheduler")]
#[command(about = "Dispatches due jobs and recovers stuck ones", long_about = None)]
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
    let config = SchedulerConfig::from_env()?;
    let db_url = args.db_url.unwrap_or_else(taskmill_config::database_url);

    info!("connecting to database");
    let pool = create_pool(&db_url).await?;
    run_migrations(&pool).await?;

    let scheduler = Scheduler::new(
        config,
        Arc::new(PgJobRepo::new(pool.clone())),
        Arc::new(PgDispatchRepo::new(pool.clone())),
        Arc::new(PgWorkerRepo::new(pool)),
    );

    let shutdown = install_shutdown_handler();
    scheduler.run(shutdown).await?;

    info!("scheduler stopped");
    Ok(())
}
