use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio_test::assert_ok;
use tower::ServiceExt;
use ulid::Ulid;

use lineup::auth::TokenAuthority;
use lineup::engine::Engine;
use lineup::http::{create_router, AppState};
use lineup::notify::NotifyHub;

const ADMIN: &str = "backstage";
const USER: &str = "visitor";

// ── Test infrastructure ──────────────────────────────────────

fn app() -> (Router, Arc<Engine>) {
    let dir = std::env::temp_dir().join(format!("lineup_http_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("lineup.wal"), Arc::new(NotifyHub::new())).unwrap());
    let authority = Arc::new(TokenAuthority::new(ADMIN, Some(USER.to_string())));
    (create_router(AppState::new(engine.clone(), authority)), engine)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create(app: &Router, uri: &str, body: Value) -> String {
    let (status, created) = send(app, Method::POST, uri, Some(ADMIN), Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    created["id"].as_str().unwrap().to_string()
}

fn slot(artist: &str, stage: &str, start: &str, end: &str) -> Value {
    json!({ "artistId": artist, "stageId": stage, "startTime": start, "endTime": end })
}

struct Festival {
    app: Router,
    engine: Arc<Engine>,
    nova: String,
    echo: String,
    main: String,
    forest: String,
}

async fn festival() -> Festival {
    let (app, engine) = app();
    let nova = create(&app, "/api/artists", json!({ "name": "Nova" })).await;
    let echo = create(&app, "/api/artists", json!({ "name": "Echo", "imageUrl": "https://img/echo.png" })).await;
    let main = create(&app, "/api/scenes", json!({ "name": "Main", "latitude": 50.85, "longitude": 4.35 })).await;
    let forest = create(&app, "/api/scenes", json!({ "name": "Forest" })).await;
    Festival { app, engine, nova, echo, main, forest }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn health_is_public() {
    let (app, _engine) = app();
    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["bookings"], 0);
}

#[tokio::test]
async fn booking_the_evening() {
    let f = festival().await;

    let (status, booked) = send(
        &f.app,
        Method::POST,
        "/api/running-orders",
        Some(ADMIN),
        Some(slot(&f.nova, &f.main, "2025-07-12T20:00:00Z", "2025-07-12T21:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(booked["artistName"], "Nova");
    assert_eq!(booked["stageName"], "Main");
    assert_eq!(booked["startTime"], "2025-07-12T20:00:00Z");

    // Same artist, other stage, overlapping: artist conflict.
    let (status, err) = send(
        &f.app,
        Method::POST,
        "/api/running-orders",
        Some(ADMIN),
        Some(slot(&f.nova, &f.forest, "2025-07-12T20:30:00Z", "2025-07-12T21:30:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], "ARTIST_CONFLICT");
    assert_eq!(err["details"], booked["id"]);

    // Other artist, same stage, overlapping: stage conflict.
    let (status, err) = send(
        &f.app,
        Method::POST,
        "/api/running-orders",
        Some(ADMIN),
        Some(slot(&f.echo, &f.main, "2025-07-12T20:59:00Z", "2025-07-12T22:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], "STAGE_CONFLICT");

    // Back to back is fine.
    let (status, _) = send(
        &f.app,
        Method::POST,
        "/api/running-orders",
        Some(ADMIN),
        Some(slot(&f.echo, &f.main, "2025-07-12T21:00:00Z", "2025-07-12T22:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let uri = format!("/api/running-orders?stageId={}", f.main);
    let (status, listed) = send(&f.app, Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<_> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["artistName"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Nova", "Echo"]);
    assert_eq!(f.engine.booking_count(), 2);
}

#[tokio::test]
async fn rescheduling_excludes_itself() {
    let f = festival().await;
    let id = create(
        &f.app,
        "/api/running-orders",
        slot(&f.nova, &f.main, "2025-07-12T20:00:00Z", "2025-07-12T21:00:00Z"),
    )
    .await;
    create(
        &f.app,
        "/api/running-orders",
        slot(&f.echo, &f.main, "2025-07-12T22:00:00Z", "2025-07-12T23:00:00Z"),
    )
    .await;

    let uri = format!("/api/running-orders/{id}");
    let (status, moved) = send(
        &f.app,
        Method::PUT,
        &uri,
        Some(ADMIN),
        Some(slot(&f.nova, &f.main, "2025-07-12T20:30:00Z", "2025-07-12T21:30:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved["endTime"], "2025-07-12T21:30:00Z");

    let (status, err) = send(
        &f.app,
        Method::PUT,
        &uri,
        Some(ADMIN),
        Some(slot(&f.nova, &f.main, "2025-07-12T21:30:00Z", "2025-07-12T22:30:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], "STAGE_CONFLICT");

    let (status, _) = send(&f.app, Method::DELETE, &uri, Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, err) = send(&f.app, Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["code"], "NOT_FOUND");
}

#[tokio::test]
async fn check_is_a_dry_run() {
    let f = festival().await;
    let id = create(
        &f.app,
        "/api/running-orders",
        slot(&f.nova, &f.main, "2025-07-12T20:00:00Z", "2025-07-12T21:00:00Z"),
    )
    .await;

    let mut draft = slot(&f.echo, &f.main, "2025-07-12T20:30:00Z", "2025-07-12T21:30:00Z");
    let (status, verdict) = send(&f.app, Method::POST, "/api/running-orders/check", Some(ADMIN), Some(draft.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["conflict"]["axis"], "stage");
    assert_eq!(verdict["conflict"]["existingId"], id.as_str());

    draft["artistId"] = json!(f.nova);
    draft["excludeId"] = json!(id);
    let (_, verdict) = send(&f.app, Method::POST, "/api/running-orders/check", Some(ADMIN), Some(draft)).await;
    assert_eq!(verdict, json!({ "conflict": null }));

    assert_eq!(f.engine.booking_count(), 1);
}

#[tokio::test]
async fn invalid_requests_are_validation_errors() {
    let f = festival().await;

    let (status, err) = send(
        &f.app,
        Method::POST,
        "/api/running-orders",
        Some(ADMIN),
        Some(slot(&f.nova, &f.main, "2025-07-12T21:00:00Z", "2025-07-12T21:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "INVALID_SPAN");

    let ghost = Ulid::new().to_string();
    let (status, err) = send(
        &f.app,
        Method::POST,
        "/api/running-orders",
        Some(ADMIN),
        Some(slot(&f.nova, &ghost, "2025-07-12T20:00:00Z", "2025-07-12T21:00:00Z")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "UNKNOWN_REFERENCE");

    let (status, err) = send(
        &f.app,
        Method::POST,
        "/api/running-orders",
        Some(ADMIN),
        Some(json!({ "artistId": f.nova })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "BAD_REQUEST");

    let (status, _) = send(&f.app, Method::GET, "/api/artists/not-a-ulid", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, err) = send(&f.app, Method::POST, "/api/artists", Some(ADMIN), Some(json!({ "name": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn writes_require_admin() {
    let f = festival().await;
    let body = json!({ "name": "Stranger" });

    let (status, err) = send(&f.app, Method::POST, "/api/artists", None, Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(err["code"], "UNAUTHORIZED");

    let (status, _) = send(&f.app, Method::POST, "/api/artists", Some("guess"), Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, err) = send(&f.app, Method::POST, "/api/artists", Some(USER), Some(body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["code"], "FORBIDDEN");

    // Reads stay public.
    let (status, artists) = send(&f.app, Method::GET, "/api/artists", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(artists.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn catalog_lifecycle() {
    let f = festival().await;
    let uri = format!("/api/scenes/{}", f.main);

    let (status, renamed) = send(
        &f.app,
        Method::PUT,
        &uri,
        Some(ADMIN),
        Some(json!({ "name": "Main Stage", "latitude": 50.85, "longitude": 4.35 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["name"], "Main Stage");

    let booking = create(
        &f.app,
        "/api/running-orders",
        slot(&f.echo, &f.main, "2025-07-12T20:00:00Z", "2025-07-12T21:00:00Z"),
    )
    .await;
    let (_, listed) = send(&f.app, Method::GET, "/api/running-orders", None, None).await;
    assert_eq!(listed[0]["stageName"], "Main Stage");

    let (status, err) = send(&f.app, Method::DELETE, &uri, Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], "HAS_BOOKINGS");

    let (status, _) = send(
        &f.app,
        Method::DELETE,
        &format!("/api/running-orders/{booking}"),
        Some(ADMIN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&f.app, Method::DELETE, &uri, Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, scenes) = send(&f.app, Method::GET, "/api/scenes", None, None).await;
    let names: Vec<_> = scenes
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Forest"]);
}

#[tokio::test]
async fn event_stream_needs_a_token() {
    let f = festival().await;
    let uri = format!("/api/artists/{}/events", f.nova);

    let (status, _) = send(&f.app, Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::get(uri.as_str())
        .header(header::AUTHORIZATION, format!("Bearer {USER}"))
        .body(Body::empty())
        .unwrap();
    let response = assert_ok!(f.app.clone().oneshot(request).await);
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let ghost = format!("/api/scenes/{}/events", Ulid::new());
    let (status, _) = send(&f.app, Method::GET, &ghost, Some(USER), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_bookings_for_one_stage_admit_one() {
    let f = festival().await;
    let mut artists = Vec::new();
    for i in 0..12 {
        artists.push(create(&f.app, "/api/artists", json!({ "name": format!("Act {i}") })).await);
    }

    let mut handles = Vec::new();
    for (i, artist) in artists.into_iter().enumerate() {
        let app = f.app.clone();
        let body = slot(
            &artist,
            &f.main,
            &format!("2025-07-12T20:{:02}:00Z", i),
            &format!("2025-07-12T21:{:02}:00Z", i),
        );
        handles.push(tokio::spawn(async move {
            send(&app, Method::POST, "/api/running-orders", Some(ADMIN), Some(body)).await
        }));
    }

    let mut created = 0;
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        match status {
            StatusCode::CREATED => created += 1,
            StatusCode::CONFLICT => assert_eq!(body["code"], "STAGE_CONFLICT"),
            other => panic!("unexpected {other}: {body}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(f.engine.booking_count(), 1);
}
