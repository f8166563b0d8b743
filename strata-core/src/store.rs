//! Event log abstraction.
//!
//! The log is append-only and partitioned by state id. Each partition is
//! keyed by version and rejects a second event at an already-used version:
//! that rejection is the single optimistic-concurrency check of the system.
//! Batches go through [`Transaction`], which stages events in memory and
//! hands them to [`EventLog::append_batch`] as one all-or-nothing write.
use std::future::Future;

pub use nonempty::NonEmpty;
use thiserror::Error;

use crate::{event::RecordedEvent, shard::Location};

pub mod inmemory;

/// An event already exists at the requested `(state id, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "version conflict on {state_id}: requested version {requested}, stored version {}",
    format_stored(.stored.as_ref())
)]
pub struct VersionConflict {
    pub state_id: String,
    pub requested: u64,
    /// Latest version found in the log, if the log reported it.
    pub stored: Option<u64>,
}

fn format_stored(stored: Option<&u64>) -> String {
    stored.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}

/// Error from append operations.
#[derive(Debug, Error)]
pub enum AppendError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    /// Another writer already stored this version.
    #[error(transparent)]
    Conflict(#[from] VersionConflict),
    /// Underlying store error.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

/// Abstraction over the persistence layer for event partitions.
///
/// `location` comes from the [`ShardResolver`](crate::shard::ShardResolver)
/// and names the physical table an entity's partition lives in.
pub trait EventLog<Id>: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append one event.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Conflict`] if the partition already holds an
    /// event at `event.version`, or [`AppendError::Store`] if persistence
    /// fails.
    fn append<'a>(
        &'a self,
        location: &'a Location,
        event: RecordedEvent<Id>,
    ) -> impl Future<Output = Result<(), AppendError<Self::Error>>> + Send + 'a;

    /// Append events atomically: either every event is stored or none is.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Conflict`] if any version is already taken,
    /// or [`AppendError::Store`] if persistence fails. In both cases nothing
    /// from the batch is stored.
    fn append_batch<'a>(
        &'a self,
        location: &'a Location,
        events: NonEmpty<RecordedEvent<Id>>,
    ) -> impl Future<Output = Result<(), AppendError<Self::Error>>> + Send + 'a;

    /// Load events for one state id with version strictly greater than
    /// `after`, in ascending version order.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when loading fails.
    fn load_after<'a>(
        &'a self,
        location: &'a Location,
        state_id: &'a Id,
        after: u64,
    ) -> impl Future<Output = Result<Vec<RecordedEvent<Id>>, Self::Error>> + Send + 'a;

    /// Highest stored version for a state id, `None` for an empty partition.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the lookup fails.
    fn latest_version<'a>(
        &'a self,
        location: &'a Location,
        state_id: &'a Id,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a;
}

/// A staged, uncommitted batch of events for one entity.
///
/// Events are accumulated in memory and persisted atomically on
/// [`commit`](Self::commit). Dropping the transaction without committing
/// discards them, which is the rollback.
pub struct Transaction<'a, Id, L>
where
    L: EventLog<Id>,
{
    log: &'a L,
    location: &'a Location,
    events: Vec<RecordedEvent<Id>>,
    committed: bool,
}

impl<'a, Id, L> Transaction<'a, Id, L>
where
    L: EventLog<Id>,
{
    pub const fn new(log: &'a L, location: &'a Location) -> Self {
        Self {
            log,
            location,
            events: Vec::new(),
            committed: false,
        }
    }

    /// Stage an event. Nothing touches the log until commit.
    pub fn stage(&mut self, event: RecordedEvent<Id>) {
        tracing::trace!(
            version = event.version,
            type_code = %event.type_code,
            "event staged in transaction"
        );
        self.events.push(event);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Commit every staged event as one atomic append.
    ///
    /// Committing an empty transaction is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the log's [`AppendError`]; nothing is stored in that case.
    pub async fn commit(mut self) -> Result<(), AppendError<L::Error>> {
        let events = std::mem::take(&mut self.events);
        self.committed = true;
        let Some(events) = NonEmpty::from_vec(events) else {
            return Ok(());
        };
        tracing::debug!(
            table = %self.location.table,
            event_count = events.len(),
            first_version = events.first().version,
            "committing transaction"
        );
        self.log.append_batch(self.location, events).await
    }

    /// Discard every staged event.
    pub fn rollback(self) {
        drop(self);
    }
}

impl<Id, L> Drop for Transaction<'_, Id, L>
where
    L: EventLog<Id>,
{
    fn drop(&mut self) {
        if !self.committed && !self.events.is_empty() {
            tracing::trace!(
                table = %self.location.table,
                event_count = self.events.len(),
                "transaction dropped without commit; discarding staged events"
            );
        }
    }
}

impl<Id, L> std::fmt::Debug for Transaction<'_, Id, L>
where
    L: EventLog<Id>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("location", self.location)
            .field("staged", &self.events.len())
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}
