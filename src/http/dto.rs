//! JSON request and response bodies. Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::Conflict;
use crate::model::*;

fn to_datetime(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// ── Running order ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningOrderRequest {
    pub artist_id: Ulid,
    pub stage_id: Ulid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl From<RunningOrderRequest> for Candidate {
    fn from(req: RunningOrderRequest) -> Self {
        Candidate {
            artist_id: req.artist_id,
            stage_id: req.stage_id,
            start: req.start_time.timestamp_millis(),
            end: req.end_time.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunningOrderDto {
    pub id: Ulid,
    pub artist_id: Ulid,
    pub artist_name: String,
    pub stage_id: Ulid,
    pub stage_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl From<BookingInfo> for RunningOrderDto {
    fn from(b: BookingInfo) -> Self {
        Self {
            id: b.id,
            artist_id: b.artist_id,
            artist_name: b.artist_name,
            stage_id: b.stage_id,
            stage_name: b.stage_name,
            start_time: to_datetime(b.start),
            end_time: to_datetime(b.end),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningOrderQuery {
    pub artist_id: Option<Ulid>,
    pub stage_id: Option<Ulid>,
}

impl From<RunningOrderQuery> for BookingFilter {
    fn from(q: RunningOrderQuery) -> Self {
        BookingFilter {
            artist_id: q.artist_id,
            stage_id: q.stage_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    #[serde(flatten)]
    pub slot: RunningOrderRequest,
    /// The booking being edited, ignored by the overlap check.
    pub exclude_id: Option<Ulid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDto {
    pub axis: ResourceAxis,
    pub existing_id: Ulid,
    pub message: String,
}

impl From<Conflict> for ConflictDto {
    fn from(c: Conflict) -> Self {
        Self {
            axis: c.axis,
            existing_id: c.existing,
            message: c.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckResponse {
    pub conflict: Option<ConflictDto>,
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtistRequest {
    pub name: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

impl From<ArtistRequest> for ArtistProfile {
    fn from(req: ArtistRequest) -> Self {
        ArtistProfile {
            name: req.name,
            description: req.description,
            image_url: req.image_url,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtistDto {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub booking_count: usize,
}

impl From<ArtistInfo> for ArtistDto {
    fn from(a: ArtistInfo) -> Self {
        Self {
            id: a.id,
            name: a.profile.name,
            description: a.profile.description,
            image_url: a.profile.image_url,
            booking_count: a.booking_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneRequest {
    pub name: String,
    pub description: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl From<SceneRequest> for StageProfile {
    fn from(req: SceneRequest) -> Self {
        StageProfile {
            name: req.name,
            description: req.description,
            latitude: req.latitude,
            longitude: req.longitude,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SceneDto {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub booking_count: usize,
}

impl From<StageInfo> for SceneDto {
    fn from(s: StageInfo) -> Self {
        Self {
            id: s.id,
            name: s.profile.name,
            description: s.profile.description,
            latitude: s.profile.latitude,
            longitude: s.profile.longitude,
            booking_count: s.booking_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub wal_appends_since_compact: u64,
    pub bookings: usize,
}
