//! Error types for activation and the write pipeline.
//!
//! Expected optimistic-concurrency conflicts on single writes are not errors:
//! [`Entity::write`](crate::entity::Entity::write) reports them as
//! `Ok(false)`. Everything here is a raised failure.

use std::sync::Arc;

use thiserror::Error;

use crate::store::VersionConflict;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Durable store failure.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("event log error: {0}")]
    EventLog(#[source] BoxError),
    #[error("snapshot store error: {0}")]
    Snapshot(#[source] BoxError),
    #[error("serialization error: {0}")]
    Codec(#[source] BoxError),
}

impl StorageError {
    pub(crate) fn event_log(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::EventLog(Box::new(err))
    }

    pub(crate) fn snapshot(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Snapshot(Box::new(err))
    }

    pub(crate) fn codec(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Codec(Box::new(err))
    }
}

/// Failure binding an entity to its storage, or restoring it.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid state id `{0}`")]
    InvalidId(String),
    #[error("failed to resolve {kind} storage for `{state_id}`: {source}")]
    Resolve {
        state_id: String,
        kind: crate::shard::StorageKind,
        #[source]
        source: BoxError,
    },
    #[error("failed to restore `{state_id}`: {source}")]
    Restore {
        state_id: String,
        #[source]
        source: StorageError,
    },
    #[error("stored event {version} cannot be replayed onto `{state_id}`: {reason}")]
    Replay {
        state_id: String,
        version: u64,
        reason: String,
    },
}

/// Failure of a write, a transaction, or deactivation.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("invalid event: {0}")]
    InvalidArgument(String),
    #[error(
        "entity {state_id} is blocked: event version and state version don't match \
         (requested version {requested}, state version {stored})"
    )]
    Blocked {
        state_id: String,
        requested: u64,
        stored: u64,
    },
    #[error("entity {state_id} has an open transaction; single event writes are not allowed")]
    ConcurrentModification { state_id: String },
    #[error("entity {state_id} already has an open transaction")]
    AlreadyInTransaction { state_id: String },
    #[error(transparent)]
    Conflict(#[from] VersionConflict),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to apply stored event {version} to entity {state_id}: {source}")]
    Apply {
        state_id: String,
        version: u64,
        #[source]
        source: BoxError,
    },
    #[error("batch commit failed: {0}")]
    Batch(#[source] Arc<WriteError>),
    #[error("entity {state_id} is no longer accepting concurrent writes")]
    Closed { state_id: String },
}

impl WriteError {
    /// The underlying error, looking through a shared batch failure.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Batch(inner) => inner.root(),
            other => other,
        }
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self.root(), Self::Blocked { .. })
    }
}
