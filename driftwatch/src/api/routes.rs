use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method, Request, Uri};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::v1;
use super::v1::response::{ApiResponse, ErrorCode};
use super::AppState;

/// Full HTTP surface: the v1 API plus a JSON 404 for every other path.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.server.max_body_bytes;

    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
        tracing::info_span!(
            "http",
            method = %request.method(),
            path = %request.uri().path(),
        )
    });

    Router::new()
        .nest("/api/v1", v1::router::v1_router(state.clone()))
        .fallback(unknown_route)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors())
        .layer(trace)
        .with_state(state)
}

/// Reports are read cross-origin; the queue is driven with POST and DELETE.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

async fn unknown_route(uri: Uri) -> ApiResponse<()> {
    ApiResponse::error(ErrorCode::NotFound, format!("No route for {}", uri.path()))
}
