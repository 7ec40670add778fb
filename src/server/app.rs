use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{assets, derivations, health, objects, persons, training};
use crate::app_context::LedgerContext;

/// Uploads arrive base64 encoded inside JSON
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub ctx: LedgerContext,
}

pub fn create_app(context: LedgerContext, cors_origin: Option<&str>) -> Result<Router> {
    let state = AppState { ctx: context };

    let cors = match cors_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(
                origin
                    .parse::<axum::http::HeaderValue>()
                    .with_context(|| format!("Invalid CORS origin '{}'", origin))?,
            )
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    let app = Router::new()
        // Health check endpoint
        .route("/health", get(health::health_check))
        // Signed reads of locally stored objects
        .route("/objects/:bucket/*key", get(objects::get_object))
        // API v1 routes
        .nest("/api/v1", api_v1_routes())
        // Add middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(state);

    Ok(app)
}

fn api_v1_routes() -> Router<AppState> {
    Router::new()
        // Person routes
        .route("/persons", post(persons::create_person).get(persons::list_persons))
        .route("/persons/:id", get(persons::get_person))
        // Asset routes
        .route("/assets", post(assets::upload_asset))
        .route("/assets/:id", get(assets::get_asset))
        .route("/assets/:id/url", get(assets::get_asset_url))
        .route("/owners/:owner_id/assets", get(assets::list_owner_assets))
        // Derivation routes
        .route(
            "/assets/:id/derivations",
            post(derivations::create_derivation).get(derivations::list_derivations),
        )
        .route("/derivations/reconcile", post(derivations::reconcile))
        .route("/derivations/:id", get(derivations::get_derivation))
        .route("/derivations/:id/fail", post(derivations::fail_derivation))
        // Training routes
        .route("/training-runs", post(training::create_training_run))
        .route("/training-runs/:id", get(training::get_training_run))
}
