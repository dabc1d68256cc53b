//! JSON API over the running order: catalog CRUD, booking writes with
//! conflict verdicts, a dry-run check and per-resource live event streams.

pub mod dto;
pub mod error;
mod extract;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::TokenAuthority;
use crate::engine::Engine;
use crate::observability::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub authority: Arc<TokenAuthority>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, authority: Arc<TokenAuthority>) -> Self {
        Self { engine, authority }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route(
            "/running-orders",
            get(handlers::list_running_orders).post(handlers::create_running_order),
        )
        .route("/running-orders/check", post(handlers::check_running_order))
        .route(
            "/running-orders/{id}",
            get(handlers::get_running_order)
                .put(handlers::update_running_order)
                .delete(handlers::delete_running_order),
        )
        .route(
            "/artists",
            get(handlers::list_artists).post(handlers::create_artist),
        )
        .route(
            "/artists/{id}",
            get(handlers::get_artist)
                .put(handlers::update_artist)
                .delete(handlers::delete_artist),
        )
        .route("/artists/{id}/events", get(handlers::artist_events))
        .route("/scenes", get(handlers::list_scenes).post(handlers::create_scene))
        .route(
            "/scenes/{id}",
            get(handlers::get_scene)
                .put(handlers::update_scene)
                .delete(handlers::delete_scene),
        )
        .route("/scenes/{id}/events", get(handlers::scene_events));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .route_layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Request count and latency per matched route.
async fn track_metrics(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = request.method().to_string();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "route" => route.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "route" => route)
        .record(started.elapsed().as_secs_f64());
    response
}
