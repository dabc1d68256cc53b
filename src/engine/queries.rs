use std::collections::HashMap;

use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_conflict, validate_span, ConflictResult};
use super::{Engine, EngineError};

impl Engine {
    /// Dry run: would `candidate` be accepted right now? Takes read locks only,
    /// so the answer can be stale by the time a write is attempted.
    pub async fn check_conflict(
        &self,
        candidate: &Candidate,
        exclude: Option<Ulid>,
    ) -> Result<ConflictResult, EngineError> {
        let span = validate_span(candidate.start, candidate.end)?;
        let artist_key = ResourceKey::artist(candidate.artist_id);
        let stage_key = ResourceKey::stage(candidate.stage_id);

        let artist_rs = self.live_timeline(artist_key)?;
        let stage_rs = self.live_timeline(stage_key)?;
        let artist = artist_rs.read().await;
        let stage = stage_rs.read().await;
        if artist.retired || stage.retired {
            let key = if artist.retired { artist_key } else { stage_key };
            return Err(EngineError::UnknownReference { axis: key.axis, id: key.id });
        }
        Ok(check_conflict(&artist, &stage, &span, exclude))
    }

    fn live_timeline(&self, key: ResourceKey) -> Result<super::SharedResourceState, EngineError> {
        self.get_timeline(&key)
            .ok_or(EngineError::UnknownReference { axis: key.axis, id: key.id })
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let booking = self.get_booking_record(&id).ok_or(EngineError::NotFound(id))?;
        let mut names = HashMap::new();
        Ok(self.resolve(&booking, &mut names).await)
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    /// Running order, earliest first, optionally narrowed to one artist and/or one stage.
    pub async fn list_bookings(&self, filter: BookingFilter) -> Vec<BookingInfo> {
        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .map(|e| *e.value())
            .filter(|b| filter.artist_id.is_none_or(|id| b.artist_id == id))
            .filter(|b| filter.stage_id.is_none_or(|id| b.stage_id == id))
            .collect();
        bookings.sort_by_key(|b| (b.span.start, b.id));

        let mut names = HashMap::new();
        let mut out = Vec::with_capacity(bookings.len());
        for booking in &bookings {
            out.push(self.resolve(booking, &mut names).await);
        }
        out
    }

    async fn resolve(
        &self,
        booking: &Booking,
        names: &mut HashMap<ResourceKey, String>,
    ) -> BookingInfo {
        let artist_name = self.cached_name(booking.artist_key(), names).await;
        let stage_name = self.cached_name(booking.stage_key(), names).await;
        BookingInfo {
            id: booking.id,
            artist_id: booking.artist_id,
            artist_name,
            stage_id: booking.stage_id,
            stage_name,
            start: booking.span.start,
            end: booking.span.end,
        }
    }

    async fn cached_name(&self, key: ResourceKey, names: &mut HashMap<ResourceKey, String>) -> String {
        if let Some(name) = names.get(&key) {
            return name.clone();
        }
        let name = match self.get_timeline(&key) {
            Some(rs) => rs.read().await.name().to_string(),
            None => String::new(),
        };
        names.insert(key, name.clone());
        name
    }

    /// Subscribe to a live artist or stage. The channel is opened before the
    /// existence check, so a concurrent delete either closes it or is seen here.
    pub async fn subscribe(&self, key: ResourceKey) -> Result<broadcast::Receiver<Event>, EngineError> {
        let rx = self.notify.subscribe(key);
        let live = match self.get_timeline(&key) {
            Some(rs) => !rs.read().await.retired,
            None => false,
        };
        if !live {
            self.notify.remove(&key);
            return Err(EngineError::NotFound(key.id));
        }
        Ok(rx)
    }

    pub async fn get_artist(&self, id: Ulid) -> Result<ArtistInfo, EngineError> {
        let rs = self
            .get_timeline(&ResourceKey::artist(id))
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        artist_info(&guard).ok_or(EngineError::NotFound(id))
    }

    pub async fn get_stage(&self, id: Ulid) -> Result<StageInfo, EngineError> {
        let rs = self
            .get_timeline(&ResourceKey::stage(id))
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        stage_info(&guard).ok_or(EngineError::NotFound(id))
    }

    pub async fn list_artists(&self) -> Vec<ArtistInfo> {
        let mut out = Vec::new();
        for rs in self.timelines_on(ResourceAxis::Artist) {
            if let Some(info) = artist_info(&*rs.read().await) {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.profile.name.cmp(&b.profile.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn list_stages(&self) -> Vec<StageInfo> {
        let mut out = Vec::new();
        for rs in self.timelines_on(ResourceAxis::Stage) {
            if let Some(info) = stage_info(&*rs.read().await) {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.profile.name.cmp(&b.profile.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Snapshot the handles first: never hold a DashMap ref across an await.
    fn timelines_on(&self, axis: ResourceAxis) -> Vec<super::SharedResourceState> {
        self.timelines
            .iter()
            .filter(|e| e.key().axis == axis)
            .map(|e| e.value().clone())
            .collect()
    }
}

fn artist_info(rs: &ResourceState) -> Option<ArtistInfo> {
    match &rs.profile {
        Profile::Artist(p) if !rs.retired => Some(ArtistInfo {
            id: rs.key.id,
            profile: p.clone(),
            booking_count: rs.slots.len(),
        }),
        _ => None,
    }
}

fn stage_info(rs: &ResourceState) -> Option<StageInfo> {
    match &rs.profile {
        Profile::Stage(p) if !rs.retired => Some(StageInfo {
            id: rs.key.id,
            profile: p.clone(),
            booking_count: rs.slots.len(),
        }),
        _ => None,
    }
}
