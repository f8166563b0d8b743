//! Domain event markers and the envelopes the pipeline stamps and stores.
//!
//! Callers hand the pipeline a bare payload. The pipeline wraps it in an
//! [`Event`] carrying the owning state id and the next version, and the
//! coordinator serializes that into a [`RecordedEvent`] for the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker trait for events an entity can persist.
///
/// Each event carries a [`Self::KIND`] type code so stored bytes can be routed
/// back to the right variant on replay, and so publish routes can be
/// overridden per event type.
pub trait DomainEvent {
    const KIND: &'static str;
}

/// Extension trait for getting the type code from an event instance.
///
/// Event enums implement this directly to report the code of the active
/// variant; plain event structs get it for free through [`DomainEvent`].
pub trait EventKind {
    fn kind(&self) -> &'static str;
}

impl<T: DomainEvent> EventKind for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }
}

/// A payload stamped with its owning state id and version.
///
/// Only the pipeline builds these: callers never choose a version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event<Id, P> {
    pub state_id: Id,
    pub version: u64,
    pub type_code: String,
    pub payload: P,
}

impl<Id, P: EventKind> Event<Id, P> {
    pub(crate) fn stamp(state_id: Id, version: u64, payload: P) -> Self {
        Self {
            state_id,
            version,
            type_code: payload.kind().to_string(),
            payload,
        }
    }
}

/// Serialized event as it lives in the event log.
///
/// Keyed by `(state_id, version)`; immutable once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent<Id> {
    pub state_id: Id,
    pub version: u64,
    pub type_code: String,
    pub data: Vec<u8>,
    pub recorded_at: DateTime<Utc>,
}
