use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Which existing booking blocks a candidate, and on which axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub axis: ResourceAxis,
    pub existing: Ulid,
}

impl Conflict {
    pub fn message(&self) -> &'static str {
        match self.axis {
            ResourceAxis::Artist => "artist already booked in this time range",
            ResourceAxis::Stage => "stage already occupied in this time range",
        }
    }
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (booking {})", self.message(), self.existing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResult {
    Clear,
    Conflict(Conflict),
}

impl ConflictResult {
    pub fn into_result(self) -> Result<(), EngineError> {
        match self {
            ConflictResult::Clear => Ok(()),
            ConflictResult::Conflict(c) => Err(EngineError::Conflict(c)),
        }
    }
}

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::InvalidSpan { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(EngineError::LimitExceeded("slot too long"));
    }
    Ok(span)
}

/// Slots on `rs` overlapping `span`, ignoring the booking being updated.
pub fn find_overlapping<'a>(
    rs: &'a ResourceState,
    span: &'a Span,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a Slot> {
    rs.overlapping(span)
        .filter(move |slot| Some(slot.booking_id) != exclude)
}

/// The artist axis is checked first: when both axes collide the artist is reported.
pub fn check_conflict(
    artist: &ResourceState,
    stage: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> ConflictResult {
    debug_assert_eq!(artist.key.axis, ResourceAxis::Artist);
    debug_assert_eq!(stage.key.axis, ResourceAxis::Stage);
    for rs in [artist, stage] {
        if let Some(slot) = find_overlapping(rs, span, exclude).next() {
            return ConflictResult::Conflict(Conflict {
                axis: rs.key.axis,
                existing: slot.booking_id,
            });
        }
    }
    ConflictResult::Clear
}
