//! Snapshot support for bounded replay on activation.
//!
//! A [`Snapshot`] is the serialized state of one entity at a version. The
//! store keeps the latest one per entity. [`SnapshotPolicy`] decides when the
//! write pipeline checkpoints:
//!
//! - [`SnapshotPolicy::Synchronous`] - after every committed write
//! - [`SnapshotPolicy::Periodic`] - once `every` events were applied since
//!   the last checkpoint
//! - [`SnapshotPolicy::Deactivation`] - only when the entity is deactivated
//!   or an explicit transaction ends

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shard::Location;

pub mod inmemory;

/// Point-in-time checkpoint of an entity's state.
///
/// Only events with a version greater than `version` need replaying on top.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub data: Vec<u8>,
    pub taken_at: DateTime<Utc>,
}

/// Trait for snapshot persistence.
///
/// One record per state id. [`save`](Self::save) must be idempotent: saving
/// the same `(id, version)` twice leaves the same stored value, and a save
/// with a lower version than the stored one must not replace it.
pub trait SnapshotStore<Id>: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the latest snapshot, `Ok(None)` if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn load<'a>(
        &'a self,
        location: &'a Location,
        state_id: &'a Id,
    ) -> impl Future<Output = Result<Option<Snapshot>, Self::Error>> + Send + 'a;

    /// Persist a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn save<'a>(
        &'a self,
        location: &'a Location,
        state_id: &'a Id,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

/// When the write pipeline persists snapshots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SnapshotPolicy {
    /// Snapshot right after every committed write.
    Synchronous,
    /// Snapshot once `every` events were applied since the last snapshot.
    Periodic { every: u64 },
    /// Snapshot on deactivation and explicit transaction end only.
    #[default]
    Deactivation,
}

impl SnapshotPolicy {
    /// Whether a write that leaves `events_since` unsnapshotted events should
    /// checkpoint.
    #[must_use]
    pub const fn should_snapshot(&self, events_since: u64) -> bool {
        match self {
            Self::Synchronous => events_since > 0,
            Self::Periodic { every } => events_since > 0 && events_since >= *every,
            Self::Deactivation => false,
        }
    }
}
