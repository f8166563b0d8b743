#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use strata_core::test;
pub use strata_core::{
    codec,
    codec::{Codec, JsonCodec},
    config,
    config::Options,
    coordinator,
    coordinator::Coordinator,
    entity,
    entity::{Entity, EntityBuilder, EntityTransaction},
    error,
    error::{InitError, StorageError, WriteError},
    event,
    event::{DomainEvent, Event, EventKind, RecordedEvent},
    state,
    state::{PlayError, State, Versioned},
};

pub mod store {

    pub use strata_core::store::{EventLog, NonEmpty, Transaction, VersionConflict};

    // Append outcome types, needed only by `EventLog` implementors.
    #[doc(hidden)]
    pub use strata_core::store::AppendError;

    pub use strata_core::store::inmemory;
}

pub mod snapshot {

    pub use strata_core::snapshot::{Snapshot, SnapshotPolicy, SnapshotStore};

    pub use strata_core::snapshot::inmemory;
}

pub mod shard {

    pub use strata_core::shard::{
        Location, NoShard, ShardInfo, ShardResolver, SingleShard, StaticShards, StorageKind,
    };
}

pub mod publish {

    pub use strata_core::publish::{NoPublisher, PublishOptions, PublishRoutes, Publisher};
}
