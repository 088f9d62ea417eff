//! UsenetSync service binary

use std::env;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use usenetsync::config::AppConfig;
use usenetsync::engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "usenetsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load()?;

    // The master secret protects every private key and article reference
    // at rest; it never touches the store.
    let master_secret = env::var("USENETSYNC_MASTER_SECRET")
        .map_err(|_| anyhow::anyhow!("USENETSYNC_MASTER_SECRET must be set"))?;

    tracing::info!(
        store = %config.store.path,
        host = %config.wire.host,
        "starting usenetsync engine"
    );

    let engine = Engine::open(config, master_secret.as_bytes(), None).await?;

    // First run mints the operator identity.
    {
        let mut tx = engine.store().begin().await?;
        let user = tx.get_user().await?;
        tx.commit().await?;
        if user.is_none() {
            let user_id = engine.initialize_user("operator").await?;
            tracing::info!("operator identity created: {}", user_id);
        }
    }

    tracing::info!("engine ready; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    Ok(())
}
