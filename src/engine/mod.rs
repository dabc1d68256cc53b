mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::{check_conflict, find_overlapping, Conflict, ConflictResult};
pub use error::EngineError;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Write guards for every timeline a mutation touches, keyed (and acquired) in lock order.
pub(crate) type LockedTimelines = BTreeMap<ResourceKey, OwnedRwLockWriteGuard<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    let result = match append_err {
        Some(e) => Err(e),
        None => wal.flush_sync(),
    };
    // Callers of a failed batch are told nothing was written, so nothing may replay.
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!("WAL rollback failed: {e}");
    }
    result
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The running-order store: one timeline per artist and per stage.
pub struct Engine {
    pub(super) timelines: DashMap<ResourceKey, SharedResourceState>,
    /// Canonical booking records; each one also lives as a slot on two timelines.
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared for their whole check-and-commit; compaction
    /// holds it exclusively so its snapshot sees every committed event.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            timelines: DashMap::new(),
            bookings: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds instantly. Never use blocking_write here: this runs inside the runtime.
        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            "replayed {} events: {} timelines, {} bookings",
            events.len(),
            engine.timelines.len(),
            engine.bookings.len()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::ArtistCreated { id, profile } => {
                let key = ResourceKey::artist(*id);
                let rs = ResourceState::new(key, Profile::Artist(profile.clone()));
                self.timelines.insert(key, Arc::new(RwLock::new(rs)));
            }
            Event::StageCreated { id, profile } => {
                let key = ResourceKey::stage(*id);
                let rs = ResourceState::new(key, Profile::Stage(profile.clone()));
                self.timelines.insert(key, Arc::new(RwLock::new(rs)));
            }
            Event::ArtistDeleted { id } => {
                self.timelines.remove(&ResourceKey::artist(*id));
            }
            Event::StageDeleted { id } => {
                self.timelines.remove(&ResourceKey::stage(*id));
            }
            other => {
                let mut locked = LockedTimelines::new();
                for key in event_keys(other, &self.bookings) {
                    if let Some(rs) = self.get_timeline(&key)
                        && let Ok(guard) = rs.try_write_owned()
                    {
                        locked.insert(key, guard);
                    }
                }
                if let Some(booking) = replayed_booking(other)
                    && let Err(e) = replay_check(&locked, booking)
                {
                    tracing::warn!("skipping replayed booking {}: {e}", booking.id);
                    return;
                }
                apply_event(&mut locked, &self.bookings, other);
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_timeline(&self, key: &ResourceKey) -> Option<SharedResourceState> {
        self.timelines.get(key).map(|e| e.value().clone())
    }

    pub fn get_booking_record(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| *e.value())
    }

    /// Acquire write locks on every key (deduplicated, in `ResourceKey` order so
    /// concurrent writers never deadlock). Fails if any timeline is missing or retired.
    pub(super) async fn lock_timelines(
        &self,
        keys: &[ResourceKey],
    ) -> Result<LockedTimelines, EngineError> {
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut locked = LockedTimelines::new();
        for key in sorted {
            let unknown = EngineError::UnknownReference { axis: key.axis, id: key.id };
            let rs = self.get_timeline(&key).ok_or(unknown)?;
            let guard = rs.write_owned().await;
            if guard.retired {
                return Err(EngineError::UnknownReference { axis: key.axis, id: key.id });
            }
            locked.insert(key, guard);
        }
        Ok(locked)
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        locked: &mut LockedTimelines,
        event: &Event,
    ) -> Result<(), EngineError> {
        let keys = event_keys(event, &self.bookings);
        self.wal_append(event).await?;
        apply_event(locked, &self.bookings, event);
        for key in keys {
            self.notify.send(key, event);
        }
        Ok(())
    }
}

fn replayed_booking(event: &Event) -> Option<&Booking> {
    match event {
        Event::BookingCreated { booking } | Event::BookingUpdated { booking } => Some(booking),
        _ => None,
    }
}

/// A replayed booking must land on live timelines without overlapping what
/// replay has already placed there.
fn replay_check(locked: &LockedTimelines, booking: &Booking) -> Result<(), EngineError> {
    let timeline = |key: ResourceKey| {
        locked
            .get(&key)
            .ok_or(EngineError::UnknownReference { axis: key.axis, id: key.id })
    };
    let artist = timeline(booking.artist_key())?;
    let stage = timeline(booking.stage_key())?;
    check_conflict(artist, stage, &booking.span, Some(booking.id)).into_result()
}

/// Every timeline an event touches. For booking updates and deletions this
/// includes the timelines the booking is leaving, read from `bookings` before apply.
fn event_keys(event: &Event, bookings: &DashMap<Ulid, Booking>) -> Vec<ResourceKey> {
    match event {
        Event::ArtistCreated { id, .. }
        | Event::ArtistUpdated { id, .. }
        | Event::ArtistDeleted { id } => vec![ResourceKey::artist(*id)],
        Event::StageCreated { id, .. }
        | Event::StageUpdated { id, .. }
        | Event::StageDeleted { id } => vec![ResourceKey::stage(*id)],
        Event::BookingCreated { booking } => vec![booking.artist_key(), booking.stage_key()],
        Event::BookingUpdated { booking } => {
            let mut keys = vec![booking.artist_key(), booking.stage_key()];
            if let Some(old) = bookings.get(&booking.id) {
                keys.push(old.artist_key());
                keys.push(old.stage_key());
            }
            keys.sort();
            keys.dedup();
            keys
        }
        Event::BookingDeleted { id } => bookings
            .get(id)
            .map(|b| vec![b.artist_key(), b.stage_key()])
            .unwrap_or_default(),
    }
}

/// Apply an event to already-locked timelines (no locking here; the caller holds the guards).
/// Resource creation and removal are handled at the DashMap level, not here.
fn apply_event(locked: &mut LockedTimelines, bookings: &DashMap<Ulid, Booking>, event: &Event) {
    match event {
        Event::ArtistUpdated { id, profile } => {
            if let Some(rs) = locked.get_mut(&ResourceKey::artist(*id)) {
                rs.profile = Profile::Artist(profile.clone());
            }
        }
        Event::StageUpdated { id, profile } => {
            if let Some(rs) = locked.get_mut(&ResourceKey::stage(*id)) {
                rs.profile = Profile::Stage(profile.clone());
            }
        }
        Event::BookingCreated { booking } => {
            for key in [booking.artist_key(), booking.stage_key()] {
                if let Some(rs) = locked.get_mut(&key) {
                    rs.insert_slot(booking.slot());
                }
            }
            bookings.insert(booking.id, *booking);
        }
        Event::BookingUpdated { booking } => {
            if let Some(old) = bookings.get(&booking.id).map(|b| *b.value()) {
                for key in [old.artist_key(), old.stage_key()] {
                    if let Some(rs) = locked.get_mut(&key) {
                        rs.remove_slot(old.id);
                    }
                }
            }
            for key in [booking.artist_key(), booking.stage_key()] {
                if let Some(rs) = locked.get_mut(&key) {
                    rs.insert_slot(booking.slot());
                }
            }
            bookings.insert(booking.id, *booking);
        }
        Event::BookingDeleted { id } => {
            if let Some((_, old)) = bookings.remove(id) {
                for key in [old.artist_key(), old.stage_key()] {
                    if let Some(rs) = locked.get_mut(&key) {
                        rs.remove_slot(old.id);
                    }
                }
            }
        }
        Event::ArtistCreated { .. }
        | Event::StageCreated { .. }
        | Event::ArtistDeleted { .. }
        | Event::StageDeleted { .. } => {}
    }
}
