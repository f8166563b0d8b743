//! Event sourcing coordinator.
//!
//! `Coordinator` binds one entity id to its event partition and snapshot
//! record, and is the only component that talks to the [`EventLog`] and
//! [`SnapshotStore`]. The write pipeline goes through it for every durable
//! operation.

use chrono::Utc;

use crate::{
    codec::{Codec, JsonCodec},
    config::Options,
    error::{InitError, StorageError},
    event::{Event, RecordedEvent},
    shard::{Location, ShardResolver, StorageKind},
    snapshot::{Snapshot, SnapshotStore},
    state::{State, Versioned},
    store::{AppendError, EventLog, Transaction},
};

/// Bridges the write pipeline to the event log and snapshot store.
pub struct Coordinator<S, L, SS, C = JsonCodec>
where
    S: State,
{
    state_id: S::Id,
    event_location: Location,
    snapshot_location: Location,
    log: L,
    snapshots: SS,
    codec: C,
    options: Options,
}

impl<S, L, SS, C> Coordinator<S, L, SS, C>
where
    S: State,
    L: EventLog<S::Id>,
    SS: SnapshotStore<S::Id>,
    C: Codec,
{
    /// Bind to `state_id`, resolving its event and snapshot locations.
    ///
    /// # Errors
    ///
    /// Returns [`InitError::InvalidId`] for an empty id, or
    /// [`InitError::Resolve`] if the resolver cannot place either store.
    #[tracing::instrument(skip_all, fields(kind = S::KIND, state_id = %state_id))]
    pub async fn init<R>(
        state_id: S::Id,
        log: L,
        snapshots: SS,
        codec: C,
        options: Options,
        resolver: &R,
    ) -> Result<Self, InitError>
    where
        R: ShardResolver,
    {
        let key = state_id.to_string();
        if key.trim().is_empty() {
            return Err(InitError::InvalidId(key));
        }
        let event_location = resolve(resolver, S::KIND, StorageKind::Event, &key).await?;
        let snapshot_location = resolve(resolver, S::KIND, StorageKind::Snapshot, &key).await?;
        tracing::debug!(%event_location, %snapshot_location, "coordinator bound");
        Ok(Self {
            state_id,
            event_location,
            snapshot_location,
            log,
            snapshots,
            codec,
            options,
        })
    }

    #[must_use]
    pub const fn state_id(&self) -> &S::Id {
        &self.state_id
    }

    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    #[must_use]
    pub const fn event_location(&self) -> &Location {
        &self.event_location
    }

    #[must_use]
    pub const fn snapshot_location(&self) -> &Location {
        &self.snapshot_location
    }

    /// Load the latest snapshot, or a fresh version-0 state if there is none.
    ///
    /// Events stored after the snapshot are not replayed here; see
    /// [`replay`](Self::replay).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the store fails or the snapshot does not
    /// decode.
    pub async fn read_snapshot(&self) -> Result<Versioned<S>, StorageError> {
        let stored = self
            .snapshots
            .load(&self.snapshot_location, &self.state_id)
            .await
            .map_err(StorageError::snapshot)?;
        let Some(snapshot) = stored else {
            tracing::trace!("no snapshot, starting from version 0");
            return Ok(Versioned::new(self.state_id.clone()));
        };
        let state: S = self
            .codec
            .deserialize(&snapshot.data)
            .map_err(StorageError::codec)?;
        tracing::trace!(version = snapshot.version, "snapshot restored");
        Ok(Versioned::restored(
            self.state_id.clone(),
            snapshot.version,
            state,
        ))
    }

    /// Persist `state` keyed by its id and version.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if encoding or the store fails.
    pub async fn save_snapshot(&self, state: &Versioned<S>) -> Result<(), StorageError> {
        let snapshot = Snapshot {
            version: state.version(),
            data: self
                .codec
                .serialize(state.state())
                .map_err(StorageError::codec)?,
            taken_at: Utc::now(),
        };
        self.snapshots
            .save(&self.snapshot_location, &self.state_id, snapshot)
            .await
            .map_err(StorageError::snapshot)?;
        tracing::debug!(version = state.version(), "snapshot saved");
        Ok(())
    }

    /// Serialize a stamped event into its stored form.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Codec`] if the payload does not encode.
    pub fn record(
        &self,
        event: &Event<S::Id, S::Event>,
    ) -> Result<RecordedEvent<S::Id>, StorageError> {
        Ok(RecordedEvent {
            state_id: event.state_id.clone(),
            version: event.version,
            type_code: event.type_code.clone(),
            data: self
                .codec
                .serialize(&event.payload)
                .map_err(StorageError::codec)?,
            recorded_at: Utc::now(),
        })
    }

    /// Decode a stored event back into its typed form.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Codec`] if the data does not decode.
    pub fn decode(
        &self,
        recorded: &RecordedEvent<S::Id>,
    ) -> Result<Event<S::Id, S::Event>, StorageError> {
        Ok(Event {
            state_id: recorded.state_id.clone(),
            version: recorded.version,
            type_code: recorded.type_code.clone(),
            payload: self
                .codec
                .deserialize(&recorded.data)
                .map_err(StorageError::codec)?,
        })
    }

    /// Append one event.
    ///
    /// Returns `Ok(false)` when the version is already taken, leaving the log
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::EventLog`] for any other log failure.
    #[tracing::instrument(skip_all, fields(version = event.version))]
    pub async fn save_event(&self, event: RecordedEvent<S::Id>) -> Result<bool, StorageError> {
        match self.log.append(&self.event_location, event).await {
            Ok(()) => Ok(true),
            Err(AppendError::Conflict(conflict)) => {
                tracing::debug!(%conflict, "event rejected");
                Ok(false)
            }
            Err(AppendError::Store(e)) => Err(StorageError::event_log(e)),
        }
    }

    /// Open a store-level transaction on this entity's partition.
    #[must_use]
    pub const fn begin(&self) -> Transaction<'_, S::Id, L> {
        Transaction::new(&self.log, &self.event_location)
    }

    /// Apply every stored event newer than `state` onto it.
    ///
    /// Returns the number of events replayed.
    ///
    /// # Errors
    ///
    /// Returns [`InitError::Restore`] if loading or decoding fails, or
    /// [`InitError::Replay`] if an event does not apply.
    pub async fn replay(&self, state: &mut Versioned<S>) -> Result<usize, InitError> {
        let restore = |source| InitError::Restore {
            state_id: self.state_id.to_string(),
            source,
        };
        let events = self
            .log
            .load_after(&self.event_location, &self.state_id, state.version())
            .await
            .map_err(|e| restore(StorageError::event_log(e)))?;
        for recorded in &events {
            let event = self.decode(recorded).map_err(restore)?;
            state.player(&event).map_err(|e| InitError::Replay {
                state_id: self.state_id.to_string(),
                version: event.version,
                reason: e.to_string(),
            })?;
        }
        if !events.is_empty() {
            tracing::debug!(
                replayed = events.len(),
                version = state.version(),
                "replayed events past snapshot"
            );
        }
        Ok(events.len())
    }
}

impl<S, L, SS, C> std::fmt::Debug for Coordinator<S, L, SS, C>
where
    S: State,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state_id", &self.state_id)
            .field("event_location", &self.event_location)
            .field("snapshot_location", &self.snapshot_location)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

async fn resolve<R: ShardResolver>(
    resolver: &R,
    name: &str,
    kind: StorageKind,
    key: &str,
) -> Result<Location, InitError> {
    let failed = |source: R::Error| InitError::Resolve {
        state_id: key.to_string(),
        kind,
        source: Box::new(source),
    };
    let provider = resolver.provider(name, kind, key).await.map_err(failed)?;
    let table = resolver.table(name, kind, key).await.map_err(failed)?;
    Ok(Location { provider, table })
}
