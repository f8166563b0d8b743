//! The state machine contract.
//!
//! [`State`] is the entity's in-memory projection. It only changes through
//! [`State::apply`]. [`Versioned`] wraps it with the state id and version
//! counter, and refuses any event that is not exactly `version + 1` for the
//! same id, so the projection can never skip or replay a transition.

use std::{fmt, hash::Hash};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::event::{Event, EventKind};

/// An entity's projection of its event history.
///
/// ```ignore
/// #[derive(Default, Clone, Serialize, Deserialize)]
/// struct Account {
///     balance: i64,
/// }
///
/// impl State for Account {
///     const KIND: &'static str = "account";
///     type Id = String;
///     type Event = AccountEvent;
///     type Error = AccountError;
///
///     fn apply(&mut self, event: &AccountEvent) -> Result<(), AccountError> {
///         match event {
///             AccountEvent::Deposited(e) => self.balance += e.amount,
///             AccountEvent::Withdrawn(e) => self.balance -= e.amount,
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait State: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical name used for shard resolution, e.g. `"account"`.
    const KIND: &'static str;

    type Id: Clone
        + Eq
        + Hash
        + fmt::Debug
        + fmt::Display
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    type Event: EventKind + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    type Error: std::error::Error + Send + Sync + 'static;

    /// Apply one event. Must be deterministic: replaying the same events from
    /// the same starting state yields the same result.
    ///
    /// # Errors
    ///
    /// Returns the domain error if the event cannot be applied. The pipeline
    /// treats this as a divergence between log and projection.
    fn apply(&mut self, event: &Self::Event) -> Result<(), Self::Error>;
}

/// Why [`Versioned::player`] refused an event.
#[derive(Debug, Error)]
pub enum PlayError<E>
where
    E: std::error::Error + 'static,
{
    #[error("event {version} for {event} cannot be applied to state {state}")]
    ForeignEvent {
        state: String,
        event: String,
        version: u64,
    },
    #[error("event version {event} does not follow state version {state}")]
    OutOfOrder { state: u64, event: u64 },
    #[error("event {version} failed to apply: {source}")]
    Apply {
        version: u64,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> PlayError<E> {
    /// Version of the refused event.
    #[must_use]
    pub const fn version(&self) -> u64 {
        match self {
            Self::ForeignEvent { version, .. } | Self::Apply { version, .. } => *version,
            Self::OutOfOrder { event, .. } => *event,
        }
    }
}

/// State plus its identity and version counter.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Versioned<S: State> {
    state_id: S::Id,
    version: u64,
    state: S,
}

impl<S: State> Versioned<S> {
    /// Fresh zero-version state.
    #[must_use]
    pub fn new(state_id: S::Id) -> Self {
        Self {
            state_id,
            version: 0,
            state: S::default(),
        }
    }

    pub(crate) const fn restored(state_id: S::Id, version: u64, state: S) -> Self {
        Self {
            state_id,
            version,
            state,
        }
    }

    #[must_use]
    pub const fn state_id(&self) -> &S::Id {
        &self.state_id
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub const fn next_version(&self) -> u64 {
        self.version + 1
    }

    #[must_use]
    pub const fn state(&self) -> &S {
        &self.state
    }

    /// Apply a single stamped event.
    ///
    /// On error the state and version are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`PlayError`] if the event belongs to another entity, does not
    /// carry `version + 1`, or the domain `apply` fails.
    pub fn player(&mut self, event: &Event<S::Id, S::Event>) -> Result<(), PlayError<S::Error>> {
        self.check(event)?;
        let mut next = self.state.clone();
        next.apply(&event.payload).map_err(|source| PlayError::Apply {
            version: event.version,
            source,
        })?;
        self.state = next;
        self.version = event.version;
        Ok(())
    }

    /// Apply an ordered run of events as one unit.
    ///
    /// Either every event is applied or none is.
    ///
    /// # Errors
    ///
    /// Returns the first [`PlayError`] encountered.
    pub fn player_all<'a, I>(&mut self, events: I) -> Result<(), PlayError<S::Error>>
    where
        I: IntoIterator<Item = &'a Event<S::Id, S::Event>>,
    {
        // One working copy for the whole run; `apply` mutates it in place.
        let mut next = self.clone();
        for event in events {
            next.check(event)?;
            next.state
                .apply(&event.payload)
                .map_err(|source| PlayError::Apply {
                    version: event.version,
                    source,
                })?;
            next.version = event.version;
        }
        *self = next;
        Ok(())
    }

    fn check(&self, event: &Event<S::Id, S::Event>) -> Result<(), PlayError<S::Error>> {
        if event.state_id != self.state_id {
            return Err(PlayError::ForeignEvent {
                state: self.state_id.to_string(),
                event: event.state_id.to_string(),
                version: event.version,
            });
        }
        if event.version != self.next_version() {
            return Err(PlayError::OutOfOrder {
                state: self.version,
                event: event.version,
            });
        }
        Ok(())
    }
}
