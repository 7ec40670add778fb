pub mod app;
pub mod error;
pub mod handlers;

use anyhow::Result;
use tracing::info;

use crate::app_context::LedgerContext;

pub async fn start_server(port: u16, context: LedgerContext, cors_origin: Option<&str>) -> Result<()> {
    let app = app::create_app(context, cors_origin)?;

    log_routes();

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Server running on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}

fn log_routes() {
    info!("API Endpoints:");
    info!("  /health                                - Health check");
    info!("  /api/v1/persons                        - Persons and caption metadata");
    info!("  /api/v1/assets                         - Upload and look up assets");
    info!("  /api/v1/assets/:id/derivations         - Derive and list derivations");
    info!("  /api/v1/derivations/:id                - Derivation status");
    info!("  /api/v1/derivations/reconcile          - Resolve stale pending derivations");
    info!("  /api/v1/training-runs                  - LoRA training runs");
    info!("  /objects/:bucket/*key                  - Signed object reads");
}
