//! HTTP handlers. Reads are public; writes take an `AdminPrincipal`.

use std::convert::Infallible;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use ulid::Ulid;

use super::dto::*;
use super::error::AppError;
use super::AppState;
use crate::auth::{AdminPrincipal, Principal};
use crate::engine::ConflictResult;
use crate::model::{Event, ResourceKey};
use crate::observability::EVENT_STREAMS_ACTIVE;

pub type HandlerResult<T> = Result<Json<T>, AppError>;

fn parse_id(raw: &str) -> Result<Ulid, AppError> {
    Ulid::from_string(raw).map_err(|e| AppError::BadRequest(format!("invalid id {raw:?}: {e}")))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        wal_appends_since_compact: state.engine.wal_appends_since_compact().await,
        bookings: state.engine.booking_count(),
    })
}

// =============================================================================
// Running order
// =============================================================================

/// GET /api/running-orders
pub async fn list_running_orders(
    State(state): State<AppState>,
    query: Result<Query<RunningOrderQuery>, QueryRejection>,
) -> HandlerResult<Vec<RunningOrderDto>> {
    let Query(query) = query?;
    let bookings = state.engine.list_bookings(query.into()).await;
    Ok(Json(bookings.into_iter().map(Into::into).collect()))
}

/// GET /api/running-orders/{id}
pub async fn get_running_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult<RunningOrderDto> {
    let booking = state.engine.get_booking(parse_id(&id)?).await?;
    Ok(Json(booking.into()))
}

/// POST /api/running-orders
pub async fn create_running_order(
    State(state): State<AppState>,
    admin: AdminPrincipal,
    body: Result<Json<RunningOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RunningOrderDto>), AppError> {
    let Json(req) = body?;
    let booking = state
        .engine
        .create_booking(&admin, Ulid::new(), req.into())
        .await?;
    Ok((StatusCode::CREATED, Json(booking.into())))
}

/// PUT /api/running-orders/{id}
///
/// The booking's own current slot never counts against the new one.
pub async fn update_running_order(
    State(state): State<AppState>,
    admin: AdminPrincipal,
    Path(id): Path<String>,
    body: Result<Json<RunningOrderRequest>, JsonRejection>,
) -> HandlerResult<RunningOrderDto> {
    let id = parse_id(&id)?;
    let Json(req) = body?;
    let booking = state.engine.update_booking(&admin, id, req.into()).await?;
    Ok(Json(booking.into()))
}

/// DELETE /api/running-orders/{id}
pub async fn delete_running_order(
    State(state): State<AppState>,
    admin: AdminPrincipal,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.delete_booking(&admin, parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/running-orders/check
///
/// Dry run of the overlap check. Nothing is written.
pub async fn check_running_order(
    State(state): State<AppState>,
    _admin: AdminPrincipal,
    body: Result<Json<CheckRequest>, JsonRejection>,
) -> HandlerResult<CheckResponse> {
    let Json(req) = body?;
    let result = state
        .engine
        .check_conflict(&req.slot.into(), req.exclude_id)
        .await?;
    let conflict = match result {
        ConflictResult::Clear => None,
        ConflictResult::Conflict(c) => Some(c.into()),
    };
    Ok(Json(CheckResponse { conflict }))
}

// =============================================================================
// Artists
// =============================================================================

pub async fn list_artists(State(state): State<AppState>) -> Json<Vec<ArtistDto>> {
    let artists = state.engine.list_artists().await;
    Json(artists.into_iter().map(Into::into).collect())
}

pub async fn get_artist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult<ArtistDto> {
    Ok(Json(state.engine.get_artist(parse_id(&id)?).await?.into()))
}

pub async fn create_artist(
    State(state): State<AppState>,
    admin: AdminPrincipal,
    body: Result<Json<ArtistRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ArtistDto>), AppError> {
    let Json(req) = body?;
    let id = Ulid::new();
    state.engine.create_artist(&admin, id, req.into()).await?;
    let artist = state.engine.get_artist(id).await?;
    Ok((StatusCode::CREATED, Json(artist.into())))
}

pub async fn update_artist(
    State(state): State<AppState>,
    admin: AdminPrincipal,
    Path(id): Path<String>,
    body: Result<Json<ArtistRequest>, JsonRejection>,
) -> HandlerResult<ArtistDto> {
    let id = parse_id(&id)?;
    let Json(req) = body?;
    state.engine.update_artist(&admin, id, req.into()).await?;
    Ok(Json(state.engine.get_artist(id).await?.into()))
}

pub async fn delete_artist(
    State(state): State<AppState>,
    admin: AdminPrincipal,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.delete_artist(&admin, parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Scenes
// =============================================================================

pub async fn list_scenes(State(state): State<AppState>) -> Json<Vec<SceneDto>> {
    let stages = state.engine.list_stages().await;
    Json(stages.into_iter().map(Into::into).collect())
}

pub async fn get_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult<SceneDto> {
    Ok(Json(state.engine.get_stage(parse_id(&id)?).await?.into()))
}

pub async fn create_scene(
    State(state): State<AppState>,
    admin: AdminPrincipal,
    body: Result<Json<SceneRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SceneDto>), AppError> {
    let Json(req) = body?;
    let id = Ulid::new();
    state.engine.create_stage(&admin, id, req.into()).await?;
    let stage = state.engine.get_stage(id).await?;
    Ok((StatusCode::CREATED, Json(stage.into())))
}

pub async fn update_scene(
    State(state): State<AppState>,
    admin: AdminPrincipal,
    Path(id): Path<String>,
    body: Result<Json<SceneRequest>, JsonRejection>,
) -> HandlerResult<SceneDto> {
    let id = parse_id(&id)?;
    let Json(req) = body?;
    state.engine.update_stage(&admin, id, req.into()).await?;
    Ok(Json(state.engine.get_stage(id).await?.into()))
}

pub async fn delete_scene(
    State(state): State<AppState>,
    admin: AdminPrincipal,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.delete_stage(&admin, parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Live events
// =============================================================================

/// GET /api/artists/{id}/events
pub async fn artist_events(
    State(state): State<AppState>,
    _principal: Principal,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, AppError> {
    let id = parse_id(&id)?;
    let rx = state.engine.subscribe(ResourceKey::artist(id)).await?;
    Ok(Sse::new(event_stream(rx)).keep_alive(KeepAlive::default()))
}

/// GET /api/scenes/{id}/events
pub async fn scene_events(
    State(state): State<AppState>,
    _principal: Principal,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, AppError> {
    let id = parse_id(&id)?;
    let rx = state.engine.subscribe(ResourceKey::stage(id)).await?;
    Ok(Sse::new(event_stream(rx)).keep_alive(KeepAlive::default()))
}

/// Keeps the open-stream gauge honest however the stream ends.
struct StreamGauge;

impl StreamGauge {
    fn open() -> Self {
        metrics::gauge!(EVENT_STREAMS_ACTIVE).increment(1.0);
        StreamGauge
    }
}

impl Drop for StreamGauge {
    fn drop(&mut self) {
        metrics::gauge!(EVENT_STREAMS_ACTIVE).decrement(1.0);
    }
}

/// One SSE message per committed event until the resource's channel closes.
fn event_stream(
    rx: broadcast::Receiver<Event>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream::unfold((rx, StreamGauge::open()), |(mut rx, gauge)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => match SseEvent::default().event(event_name(&event)).json_data(&event) {
                    Ok(sse) => return Some((Ok(sse), (rx, gauge))),
                    Err(e) => warn!("dropping unencodable event: {e}"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event stream lagged, {skipped} events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::ArtistCreated { .. } => "artist_created",
        Event::ArtistUpdated { .. } => "artist_updated",
        Event::ArtistDeleted { .. } => "artist_deleted",
        Event::StageCreated { .. } => "stage_created",
        Event::StageUpdated { .. } => "stage_updated",
        Event::StageDeleted { .. } => "stage_deleted",
        Event::BookingCreated { .. } => "booking_created",
        Event::BookingUpdated { .. } => "booking_updated",
        Event::BookingDeleted { .. } => "booking_deleted",
    }
}
