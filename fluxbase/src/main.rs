//! Service entry point

use std::sync::Arc;

use fluxbase::{config::Config, handlers, server, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Misconfiguration is fatal before anything listens
    let config = Config::load().map_err(|e| anyhow::anyhow!("{e}"))?;
    server::init_tracing(&config).map_err(|e| anyhow::anyhow!("{e}"))?;

    let state: Arc<AppState> = AppState::build(config.clone())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    // System migrations run under the admin database user at startup
    sqlx::migrate!("./migrations")
        .run(&state.admin_pool)
        .await?;
    tracing::info!("migrations up to date");

    let app = handlers::router(state);
    server::Server::new(config)
        .serve(app)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    Ok(())
}
