use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::api::state::AppState;

use super::handlers;
use super::middleware::v1_auth_middleware;

pub fn v1_router(state: AppState) -> Router<AppState> {
    let conversations = Router::new()
        .route(
            "/{conversationId}/divergence",
            get(handlers::conversations::get_divergence),
        )
        .route(
            "/{conversationId}/divergence:compute",
            post(handlers::conversations::compute_divergence),
        )
        .route(
            "/{conversationId}/segments",
            get(handlers::conversations::list_segments),
        )
        .route(
            "/{conversationId}/related",
            get(handlers::conversations::related_conversations),
        );

    let divergence = Router::new()
        .route("/high", get(handlers::divergence::list_high_divergence))
        .route("/stats", get(handlers::divergence::divergence_stats));

    let queue = Router::new().route(
        "/{conversationId}",
        post(handlers::queue::enqueue).delete(handlers::queue::cancel),
    );

    let public_routes = Router::new().route("/health", get(handlers::health_check));

    let protected_routes = Router::new()
        .route(
            "/conversations:ingest",
            post(handlers::conversations::ingest_conversation),
        )
        .route("/backfill", post(handlers::divergence::run_backfill))
        .nest("/conversations", conversations)
        .nest("/divergence", divergence)
        .nest("/queue", queue)
        .route_layer(middleware::from_fn_with_state(state, v1_auth_middleware));

    Router::new().merge(public_routes).merge(protected_routes)
}
