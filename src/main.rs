use anyhow::{Context, Result};
use axum::Router;
use dataset_publisher::{
    config, db, routes,
    services::{
        ledger::{HttpLedger, Ledger},
        outbox::ChannelOutboxSignal,
    },
    state::AppState,
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting dataset-publisher with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(
        db::connect(&cfg.database_url)
            .await
            .with_context(|| format!("connecting to {}", cfg.database_url))?,
    );
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Collaborators ---
    let ledger: Option<Arc<dyn Ledger>> = match &cfg.ledger_url {
        Some(url) => Some(Arc::new(HttpLedger::new(url)?)),
        None => {
            tracing::warn!("No ledger configured; paid datasets will be refused");
            None
        }
    };

    // The reconciler is external; this side only reports that work is queued.
    let (outbox, mut outbox_rx) = ChannelOutboxSignal::new(1);
    tokio::spawn(async move {
        while outbox_rx.recv().await.is_some() {
            tracing::info!("Outbox has pending work for the reconciler");
        }
    });

    let state = AppState::new(&cfg, db, ledger, Arc::new(outbox));

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
