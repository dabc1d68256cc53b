use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// The two independent dimensions along which double-booking is forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAxis {
    Artist,
    Stage,
}

impl ResourceAxis {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceAxis::Artist => "artist",
            ResourceAxis::Stage => "stage",
        }
    }
}

impl std::fmt::Display for ResourceAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one timeline. Ordering (axis first, then id) is the lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub axis: ResourceAxis,
    pub id: Ulid,
}

impl ResourceKey {
    pub fn artist(id: Ulid) -> Self {
        Self { axis: ResourceAxis::Artist, id }
    }

    pub fn stage(id: Ulid) -> Self {
        Self { axis: ResourceAxis::Stage, id }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.axis, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtistProfile {
    pub name: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProfile {
    pub name: String,
    pub description: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Profile {
    Artist(ArtistProfile),
    Stage(StageProfile),
}

impl Profile {
    pub fn name(&self) -> &str {
        match self {
            Profile::Artist(p) => &p.name,
            Profile::Stage(p) => &p.name,
        }
    }
}

/// One booking as seen from a single timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub booking_id: Ulid,
    pub span: Span,
}

/// An artist's or a stage's profile plus every slot booked on it.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub key: ResourceKey,
    pub profile: Profile,
    /// Booked slots, sorted by `span.start`.
    pub slots: Vec<Slot>,
    /// Set under the write lock when the resource is deleted; a writer that
    /// cloned the handle before the deletion must treat it as gone.
    pub retired: bool,
}

impl ResourceState {
    pub fn new(key: ResourceKey, profile: Profile) -> Self {
        Self {
            key,
            profile,
            slots: Vec::new(),
            retired: false,
        }
    }

    pub fn name(&self) -> &str {
        self.profile.name()
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    /// Remove slot by booking id.
    pub fn remove_slot(&mut self, booking_id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.booking_id == booking_id)?;
        Some(self.slots.remove(pos))
    }

    /// Return only slots whose span overlaps the query window.
    /// Uses binary search to skip slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

/// A running-order entry: one artist on one stage over `span`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub artist_id: Ulid,
    pub stage_id: Ulid,
    pub span: Span,
}

impl Booking {
    pub fn artist_key(&self) -> ResourceKey {
        ResourceKey::artist(self.artist_id)
    }

    pub fn stage_key(&self) -> ResourceKey {
        ResourceKey::stage(self.stage_id)
    }

    pub fn slot(&self) -> Slot {
        Slot { booking_id: self.id, span: self.span }
    }
}

/// A proposed booking before validation. `start`/`end` are raw so that an
/// inverted or empty interval can be reported instead of asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub artist_id: Ulid,
    pub stage_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ArtistCreated {
        id: Ulid,
        profile: ArtistProfile,
    },
    ArtistUpdated {
        id: Ulid,
        profile: ArtistProfile,
    },
    ArtistDeleted {
        id: Ulid,
    },
    StageCreated {
        id: Ulid,
        profile: StageProfile,
    },
    StageUpdated {
        id: Ulid,
        profile: StageProfile,
    },
    StageDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingUpdated {
        booking: Booking,
    },
    BookingDeleted {
        id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ArtistInfo {
    pub id: Ulid,
    pub profile: ArtistProfile,
    pub booking_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageInfo {
    pub id: Ulid,
    pub profile: StageProfile,
    pub booking_count: usize,
}

/// A booking with the artist and stage display names resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub artist_id: Ulid,
    pub artist_name: String,
    pub stage_id: Ulid,
    pub stage_name: String,
    pub start: Ms,
    pub end: Ms,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub artist_id: Option<Ulid>,
    pub stage_id: Option<Ulid>,
}
