use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use mission_control::config::Config;
use mission_control::db::Store;
use mission_control::http::{router, AppState};
use mission_control::llm::LlmDispatcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().map_err(|e| format!("config error: {e}"))?;

    // Migrate once at startup; request handlers open their own handles.
    let store = Store::open_and_migrate(&config.db_path)
        .map_err(|e| format!("failed to open database at {}: {e}", config.db_path.display()))?;
    drop(store);
    tracing::info!("database ready at {}", config.db_path.display());

    let dispatcher = LlmDispatcher::from_config(&config);
    let bind = config.bind;
    let state = Arc::new(AppState::new(config, dispatcher));

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("mission-control listening on {bind}");
    axum::serve(listener, app).await?;
    Ok(())
}
