pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;
use crate::versioning::handlers;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/prompts", post(handlers::handle_create_prompt))
        .route("/api/v1/prompts/:id", get(handlers::handle_get_prompt))
        .route(
            "/api/v1/prompts/:id/versions",
            get(handlers::handle_list_versions).post(handlers::handle_create_version),
        )
        .route(
            "/api/v1/prompts/:id/versions/:version",
            get(handlers::handle_get_version),
        )
        .route("/api/v1/prompts/:id/revert", post(handlers::handle_revert))
        .route(
            "/api/v1/prompts/:id/apply-run",
            post(handlers::handle_apply_run),
        )
        .route(
            "/api/v1/prompts/:id/duplicate",
            post(handlers::handle_duplicate),
        )
        .route("/api/v1/prompts/:id/compare", get(handlers::handle_compare))
        .route("/api/v1/prompts/:id/audit", get(handlers::handle_audit))
        .with_state(state)
}
