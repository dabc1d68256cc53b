use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::auth::AdminPrincipal;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_conflict, validate_span, ConflictResult};
use super::{Engine, EngineError, LockedTimelines, WalCommand};

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_description(description: &Option<String>) -> Result<(), EngineError> {
    if let Some(d) = description
        && d.len() > MAX_DESCRIPTION_LEN
    {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

fn validate_artist(profile: &ArtistProfile) -> Result<(), EngineError> {
    validate_name(&profile.name)?;
    validate_description(&profile.description)?;
    if let Some(url) = &profile.image_url
        && url.len() > MAX_URL_LEN
    {
        return Err(EngineError::LimitExceeded("image url too long"));
    }
    Ok(())
}

fn validate_stage(profile: &StageProfile) -> Result<(), EngineError> {
    validate_name(&profile.name)?;
    validate_description(&profile.description)?;
    if let Some(lat) = profile.latitude
        && !(-90.0..=90.0).contains(&lat)
    {
        return Err(EngineError::InvalidInput("latitude out of range"));
    }
    if let Some(lon) = profile.longitude
        && !(-180.0..=180.0).contains(&lon)
    {
        return Err(EngineError::InvalidInput("longitude out of range"));
    }
    Ok(())
}

/// Conflicts are a valid business outcome; count them and say which axis.
fn reject_conflict(result: ConflictResult, booking_id: Ulid) -> Result<(), EngineError> {
    if let ConflictResult::Conflict(c) = result {
        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL, "axis" => c.axis.as_str())
            .increment(1);
        info!("booking {booking_id} rejected: {c}");
    }
    result.into_result()
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn create_artist(
        &self,
        admin: &AdminPrincipal,
        id: Ulid,
        profile: ArtistProfile,
    ) -> Result<(), EngineError> {
        validate_artist(&profile)?;
        let key = ResourceKey::artist(id);
        let event = Event::ArtistCreated { id, profile: profile.clone() };
        self.create_resource(key, Profile::Artist(profile), &event).await?;
        info!(actor = admin.subject(), "created artist {id}");
        Ok(())
    }

    pub async fn create_stage(
        &self,
        admin: &AdminPrincipal,
        id: Ulid,
        profile: StageProfile,
    ) -> Result<(), EngineError> {
        validate_stage(&profile)?;
        let key = ResourceKey::stage(id);
        let event = Event::StageCreated { id, profile: profile.clone() };
        self.create_resource(key, Profile::Stage(profile), &event).await?;
        info!(actor = admin.subject(), "created stage {id}");
        Ok(())
    }

    async fn create_resource(
        &self,
        key: ResourceKey,
        profile: Profile,
        event: &Event,
    ) -> Result<(), EngineError> {
        if self.timelines.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many artists and stages"));
        }
        let _gate = self.commit_gate.read().await;
        // Hold the new timeline's lock from insertion until the WAL confirms, so
        // nobody books against a resource that might still be rolled back.
        let rs = Arc::new(RwLock::new(ResourceState::new(key, profile)));
        let guard = rs.clone().write_owned().await;
        match self.timelines.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(EngineError::AlreadyExists(key.id)),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(rs);
            }
        }
        if let Err(e) = self.wal_append(event).await {
            self.timelines.remove(&key);
            let mut guard = guard;
            guard.retired = true;
            return Err(e);
        }
        drop(guard);
        self.notify.send(key, event);
        Ok(())
    }

    pub async fn update_artist(
        &self,
        admin: &AdminPrincipal,
        id: Ulid,
        profile: ArtistProfile,
    ) -> Result<(), EngineError> {
        validate_artist(&profile)?;
        self.edit_artist(admin, id, |_| profile).await
    }

    /// Apply `change` to the artist's profile as it stands under the write lock.
    pub async fn edit_artist(
        &self,
        admin: &AdminPrincipal,
        id: Ulid,
        change: impl FnOnce(ArtistProfile) -> ArtistProfile,
    ) -> Result<(), EngineError> {
        let key = ResourceKey::artist(id);
        let _gate = self.commit_gate.read().await;
        let mut locked = self.lock_existing(key).await?;
        let Profile::Artist(current) = locked[&key].profile.clone() else {
            return Err(EngineError::NotFound(id));
        };
        let profile = change(current);
        validate_artist(&profile)?;
        self.persist_and_apply(&mut locked, &Event::ArtistUpdated { id, profile })
            .await?;
        info!(actor = admin.subject(), "updated artist {id}");
        Ok(())
    }

    pub async fn update_stage(
        &self,
        admin: &AdminPrincipal,
        id: Ulid,
        profile: StageProfile,
    ) -> Result<(), EngineError> {
        validate_stage(&profile)?;
        self.edit_stage(admin, id, |_| profile).await
    }

    pub async fn edit_stage(
        &self,
        admin: &AdminPrincipal,
        id: Ulid,
        change: impl FnOnce(StageProfile) -> StageProfile,
    ) -> Result<(), EngineError> {
        let key = ResourceKey::stage(id);
        let _gate = self.commit_gate.read().await;
        let mut locked = self.lock_existing(key).await?;
        let Profile::Stage(current) = locked[&key].profile.clone() else {
            return Err(EngineError::NotFound(id));
        };
        let profile = change(current);
        validate_stage(&profile)?;
        self.persist_and_apply(&mut locked, &Event::StageUpdated { id, profile })
            .await?;
        info!(actor = admin.subject(), "updated stage {id}");
        Ok(())
    }

    pub async fn delete_artist(&self, admin: &AdminPrincipal, id: Ulid) -> Result<(), EngineError> {
        self.delete_resource(ResourceKey::artist(id), &Event::ArtistDeleted { id })
            .await?;
        info!(actor = admin.subject(), "deleted artist {id}");
        Ok(())
    }

    pub async fn delete_stage(&self, admin: &AdminPrincipal, id: Ulid) -> Result<(), EngineError> {
        self.delete_resource(ResourceKey::stage(id), &Event::StageDeleted { id })
            .await?;
        info!(actor = admin.subject(), "deleted stage {id}");
        Ok(())
    }

    async fn delete_resource(&self, key: ResourceKey, event: &Event) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut locked = self.lock_existing(key).await?;
        let Some(guard) = locked.get_mut(&key) else {
            return Err(EngineError::NotFound(key.id));
        };
        if !guard.slots.is_empty() {
            return Err(EngineError::HasBookings(key));
        }
        self.wal_append(event).await?;
        guard.retired = true;
        self.timelines.remove(&key);
        self.notify.send(key, event);
        self.notify.remove(&key);
        Ok(())
    }

    /// Like `lock_timelines` for a single key, but a missing resource is `NotFound`.
    async fn lock_existing(&self, key: ResourceKey) -> Result<LockedTimelines, EngineError> {
        self.lock_timelines(&[key]).await.map_err(|e| match e {
            EngineError::UnknownReference { id, .. } => EngineError::NotFound(id),
            other => other,
        })
    }

    // ── Running order ────────────────────────────────────────

    /// Validate, check and commit a new booking under the write locks of its
    /// artist and stage: no concurrent writer can slip in between.
    pub async fn create_booking(
        &self,
        admin: &AdminPrincipal,
        id: Ulid,
        candidate: Candidate,
    ) -> Result<BookingInfo, EngineError> {
        let span = validate_span(candidate.start, candidate.end)?;
        let booking = Booking {
            id,
            artist_id: candidate.artist_id,
            stage_id: candidate.stage_id,
            span,
        };
        let (artist_key, stage_key) = (booking.artist_key(), booking.stage_key());

        let _gate = self.commit_gate.read().await;
        let mut locked = self.lock_timelines(&[artist_key, stage_key]).await?;
        if self.bookings.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let (artist, stage) = (&locked[&artist_key], &locked[&stage_key]);
        if artist.slots.len() >= MAX_SLOTS_PER_RESOURCE || stage.slots.len() >= MAX_SLOTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many bookings on resource"));
        }
        reject_conflict(check_conflict(artist, stage, &span, None), id)?;

        self.persist_and_apply(&mut locked, &Event::BookingCreated { booking })
            .await?;
        info!(
            actor = admin.subject(),
            "booked {id}: artist {} on stage {} [{}, {})",
            booking.artist_id, booking.stage_id, span.start, span.end
        );
        Ok(booking_info(&locked, &booking))
    }

    /// Re-check and commit a changed booking. The booking's own current slot is
    /// excluded from the overlap check; every other slot still counts.
    pub async fn update_booking(
        &self,
        admin: &AdminPrincipal,
        id: Ulid,
        candidate: Candidate,
    ) -> Result<BookingInfo, EngineError> {
        validate_span(candidate.start, candidate.end)?;
        self.edit_booking(admin, id, |_| candidate).await
    }

    /// Like `update_booking`, but the new slot is derived from the booking as it
    /// stands under the write locks, so fields `change` keeps are never stale.
    pub async fn edit_booking(
        &self,
        admin: &AdminPrincipal,
        id: Ulid,
        change: impl Fn(&Booking) -> Candidate,
    ) -> Result<BookingInfo, EngineError> {
        let _gate = self.commit_gate.read().await;
        for _ in 0..MAX_UPDATE_RETRIES {
            let current = self.get_booking_record(&id).ok_or(EngineError::NotFound(id))?;
            let candidate = change(&current);
            let span = validate_span(candidate.start, candidate.end)?;
            let updated = Booking {
                id,
                artist_id: candidate.artist_id,
                stage_id: candidate.stage_id,
                span,
            };
            let keys = [
                current.artist_key(),
                current.stage_key(),
                updated.artist_key(),
                updated.stage_key(),
            ];
            let mut locked = self.lock_timelines(&keys).await?;

            // The booking may have moved or vanished while we waited for the locks.
            match self.get_booking_record(&id) {
                Some(now) if now == current => {}
                Some(_) => continue,
                None => return Err(EngineError::NotFound(id)),
            }

            let (artist, stage) = (&locked[&updated.artist_key()], &locked[&updated.stage_key()]);
            reject_conflict(check_conflict(artist, stage, &span, Some(id)), id)?;

            self.persist_and_apply(&mut locked, &Event::BookingUpdated { booking: updated })
                .await?;
            info!(
                actor = admin.subject(),
                "rescheduled {id}: artist {} on stage {} [{}, {})",
                updated.artist_id, updated.stage_id, span.start, span.end
            );
            return Ok(booking_info(&locked, &updated));
        }
        Err(EngineError::Contended(id))
    }

    pub async fn delete_booking(&self, admin: &AdminPrincipal, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        for _ in 0..MAX_UPDATE_RETRIES {
            let current = self.get_booking_record(&id).ok_or(EngineError::NotFound(id))?;
            let mut locked = self
                .lock_timelines(&[current.artist_key(), current.stage_key()])
                .await?;
            match self.get_booking_record(&id) {
                Some(now) if now == current => {}
                Some(_) => continue,
                None => return Err(EngineError::NotFound(id)),
            }
            self.persist_and_apply(&mut locked, &Event::BookingDeleted { id })
                .await?;
            info!(actor = admin.subject(), "removed booking {id}");
            return Ok(());
        }
        Err(EngineError::Contended(id))
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();
        let mut keys: Vec<ResourceKey> = self.timelines.iter().map(|e| *e.key()).collect();
        keys.sort();

        // Resources first (artists sort before stages), then every booking once.
        let mut seen = HashSet::new();
        for key in &keys {
            let Some(rs) = self.get_timeline(key) else { continue };
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            events.push(match &guard.profile {
                Profile::Artist(p) => Event::ArtistCreated { id: key.id, profile: p.clone() },
                Profile::Stage(p) => Event::StageCreated { id: key.id, profile: p.clone() },
            });
            for slot in &guard.slots {
                seen.insert(slot.booking_id);
            }
        }
        let mut bookings: Vec<Booking> = seen
            .into_iter()
            .filter_map(|id| self.get_booking_record(&id))
            .collect();
        bookings.sort_by_key(|b| (b.span.start, b.id));
        events.extend(bookings.into_iter().map(|booking| Event::BookingCreated { booking }));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn booking_info(locked: &LockedTimelines, booking: &Booking) -> BookingInfo {
    let name = |key: ResourceKey| {
        locked
            .get(&key)
            .map(|rs| rs.name().to_string())
            .unwrap_or_default()
    };
    BookingInfo {
        id: booking.id,
        artist_id: booking.artist_id,
        artist_name: name(booking.artist_key()),
        stage_id: booking.stage_id,
        stage_name: name(booking.stage_key()),
        start: booking.span.start,
        end: booking.span.end,
    }
}
