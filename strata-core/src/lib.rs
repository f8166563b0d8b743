//! Core traits and the write pipeline for strata event-sourced entities.
//!
//! - [`entity`] - The per-entity write pipeline (`Entity`, `EntityTransaction`)
//! - [`coordinator`] - Snapshot and event log orchestration for one entity
//! - [`state`] - The state machine contract (`State`, `Versioned`)
//! - [`store`] - Event log abstraction (`EventLog`, `Transaction`)
//! - [`snapshot`] - Snapshot storage abstraction (`SnapshotStore`, `SnapshotPolicy`)
//! - [`shard`] - Storage placement (`ShardResolver`)
//! - [`publish`] - Best-effort event publishing (`Publisher`, `PublishRoutes`)
//!
//! # Example
//!
//! ```
//! use strata_core::{snapshot, store::inmemory};
//!
//! let log: inmemory::Log<String> = inmemory::Log::new();
//! let snapshots: snapshot::inmemory::Store<String> = snapshot::inmemory::Store::new();
//! ```
//!
//! Most users should depend on the `strata` crate, which re-exports these
//! types with a flatter API surface.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod event;
pub mod publish;
pub mod shard;
pub mod snapshot;
pub mod state;
pub mod store;
