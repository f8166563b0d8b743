//! In-memory event log for tests and examples.
//!
//! ```
//! use strata_core::store::inmemory;
//!
//! let log: inmemory::Log<String> = inmemory::Log::new();
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    convert::Infallible,
    fmt,
    hash::Hash,
    sync::{Arc, PoisonError, RwLock},
};

use nonempty::NonEmpty;

use crate::{
    event::RecordedEvent,
    shard::Location,
    store::{AppendError, EventLog, VersionConflict},
};

type Partition<Id> = BTreeMap<u64, RecordedEvent<Id>>;

/// Thread-safe in-memory event log.
///
/// Partitions are keyed by `(table, state id)` and ordered by version.
#[derive(Clone)]
pub struct Log<Id> {
    inner: Arc<RwLock<HashMap<(String, Id), Partition<Id>>>>,
}

impl<Id> Log<Id> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<Id> Default for Log<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id> fmt::Debug for Log<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let partitions = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Log")
            .field("partitions", &partitions)
            .finish()
    }
}

fn conflict<Id: fmt::Display>(
    partition: &Partition<Id>,
    event: &RecordedEvent<Id>,
) -> VersionConflict {
    VersionConflict {
        state_id: event.state_id.to_string(),
        requested: event.version,
        stored: partition.keys().next_back().copied(),
    }
}

impl<Id> EventLog<Id> for Log<Id>
where
    Id: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    type Error = Infallible;

    #[tracing::instrument(skip(self, event), fields(version = event.version))]
    async fn append<'a>(
        &'a self,
        location: &'a Location,
        event: RecordedEvent<Id>,
    ) -> Result<(), AppendError<Infallible>> {
        let key = (location.table.clone(), event.state_id.clone());
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let partition = inner.entry(key).or_default();
        if partition.contains_key(&event.version) {
            let conflict = conflict(partition, &event);
            tracing::debug!(%conflict, "rejecting append");
            return Err(conflict.into());
        }
        partition.insert(event.version, event);
        Ok(())
    }

    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    async fn append_batch<'a>(
        &'a self,
        location: &'a Location,
        events: NonEmpty<RecordedEvent<Id>>,
    ) -> Result<(), AppendError<Infallible>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        // Check every version before writing any of them.
        for event in &events {
            let key = (location.table.clone(), event.state_id.clone());
            if let Some(partition) = inner.get(&key)
                && partition.contains_key(&event.version)
            {
                let conflict = conflict(partition, event);
                tracing::debug!(%conflict, "rejecting batch");
                return Err(conflict.into());
            }
        }

        for event in events {
            let key = (location.table.clone(), event.state_id.clone());
            inner.entry(key).or_default().insert(event.version, event);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, state_id))]
    async fn load_after<'a>(
        &'a self,
        location: &'a Location,
        state_id: &'a Id,
        after: u64,
    ) -> Result<Vec<RecordedEvent<Id>>, Infallible> {
        let key = (location.table.clone(), state_id.clone());
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let events: Vec<_> = inner
            .get(&key)
            .map(|p| p.range(after + 1..).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default();
        tracing::trace!(events_loaded = events.len(), "loaded events");
        Ok(events)
    }

    async fn latest_version<'a>(
        &'a self,
        location: &'a Location,
        state_id: &'a Id,
    ) -> Result<Option<u64>, Infallible> {
        let key = (location.table.clone(), state_id.clone());
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .get(&key)
            .and_then(|p| p.keys().next_back().copied()))
    }
}
