//! Taskmill management API server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskmill_api::{routes, AppState};
use taskmill_core::ScriptRoot;
use taskmill_db::{create_pool, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url = taskmill_config::database_url();
    info!("connecting to database");
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;

    let script_root = ScriptRoot::new(PathBuf::from(
        std::env::var("WORKER_SCRIPT_ROOT").unwrap_or_else(|_| "./scripts".to_string()),
    ));
    let offline_threshold = Duration::from_secs(
        std::env::var("WORKER_OFFLINE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(180),
    );
    let state = AppState::new(pool, script_root, offline_threshold);

    let app = routes::router(state).layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let port: u16 = std::env::var("TASKMILL_API_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("starting server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
