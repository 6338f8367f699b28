//! HTTP API route definitions.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{
    create_event, get_activity, get_balance, get_event, get_position, health, list_events,
    metrics, mint, ready, redeem, resolve_event, AppState,
};

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        // Events
        .route("/api/v1/events", get(list_events).post(create_event))
        .route("/api/v1/events/:event_id", get(get_event))
        .route("/api/v1/events/:event_id/activity", get(get_activity))
        .route("/api/v1/events/:event_id/resolve", post(resolve_event))
        // Settlement
        .route("/api/v1/events/:event_id/mint", post(mint))
        .route("/api/v1/events/:event_id/redeem", post(redeem))
        .route(
            "/api/v1/events/:event_id/positions/:holder",
            get(get_position),
        )
        .route("/api/v1/balances/:holder/:asset", get(get_balance))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
