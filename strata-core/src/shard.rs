//! Storage shard resolution.
//!
//! A [`ShardResolver`] maps `(logical name, storage kind, entity key)` to the
//! provider and table that hold the entity's events or snapshot. The
//! coordinator resolves both locations once, at activation.
//!
//! [`StaticShards`] is a reference resolver that keeps a time-ordered table
//! history per storage kind: the newest table receives writes, older ones
//! stay listable for migration and compaction tooling.

use std::{convert::Infallible, fmt, future::Future};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which store a lookup targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Event,
    Snapshot,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event => f.write_str("event"),
            Self::Snapshot => f.write_str("snapshot"),
        }
    }
}

/// Physical location of one entity's partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub provider: String,
    pub table: String,
}

impl Location {
    #[must_use]
    pub fn new(provider: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.table)
    }
}

/// A table known to the resolver, with the time it started taking writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Logical name the table belongs to.
    pub name: String,
    pub provider: String,
    pub table: String,
    pub kind: StorageKind,
    pub created_at: DateTime<Utc>,
}

impl ShardInfo {
    #[must_use]
    pub fn location(&self) -> Location {
        Location::new(self.provider.clone(), self.table.clone())
    }
}

/// Lookup contract for storage sharding.
pub trait ShardResolver: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Provider holding `key`'s current shard.
    ///
    /// # Errors
    ///
    /// Returns a resolver-specific error if no provider can be determined.
    fn provider<'a>(
        &'a self,
        name: &'a str,
        kind: StorageKind,
        key: &'a str,
    ) -> impl Future<Output = Result<String, Self::Error>> + Send + 'a;

    /// Table holding `key`'s current shard.
    ///
    /// # Errors
    ///
    /// Returns a resolver-specific error if no table can be determined.
    fn table<'a>(
        &'a self,
        name: &'a str,
        kind: StorageKind,
        key: &'a str,
    ) -> impl Future<Output = Result<String, Self::Error>> + Send + 'a;

    /// Tables that may hold `key`'s data written at or after `since`.
    ///
    /// `None` lists every table ever used.
    ///
    /// # Errors
    ///
    /// Returns a resolver-specific error if the lookup fails.
    fn table_list<'a>(
        &'a self,
        name: &'a str,
        kind: StorageKind,
        key: &'a str,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + 'a;

    /// Providers with shards created at or after `since`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a resolver-specific error if the lookup fails.
    fn provider_list<'a>(
        &'a self,
        name: &'a str,
        kind: StorageKind,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<ShardInfo>, Self::Error>> + Send + 'a;
}

/// Error returned by [`StaticShards`] when a storage kind has no tables.
#[derive(Debug, thiserror::Error)]
#[error("no {kind} shard registered for `{name}`")]
pub struct NoShard {
    pub name: String,
    pub kind: StorageKind,
}

/// Resolver over a fixed, time-ordered table history.
///
/// Every entity key maps to the same table; the table is chosen by time only.
/// Table names are `{name}_{kind}` for the initial shard and
/// `{name}_{kind}_{n}` for each rollover.
#[derive(Clone, Debug)]
pub struct StaticShards {
    provider: String,
    shards: Vec<ShardInfo>,
}

impl StaticShards {
    /// Resolver with no tables yet; every table lives on `provider`.
    #[must_use]
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            shards: Vec::new(),
        }
    }

    /// Register a new table for `kind` that takes writes from `created_at`.
    #[must_use]
    pub fn with_shard(mut self, name: &str, kind: StorageKind, created_at: DateTime<Utc>) -> Self {
        let generation = self.history(name, kind).len();
        let table = if generation == 0 {
            format!("{name}_{kind}")
        } else {
            format!("{name}_{kind}_{generation}")
        };
        self.shards.push(ShardInfo {
            name: name.to_string(),
            provider: self.provider.clone(),
            table,
            kind,
            created_at,
        });
        self.shards.sort_by_key(|s| s.created_at);
        self
    }

    /// Register both an event and a snapshot table for `name`.
    #[must_use]
    pub fn with_entity(self, name: &str, created_at: DateTime<Utc>) -> Self {
        self.with_shard(name, StorageKind::Event, created_at)
            .with_shard(name, StorageKind::Snapshot, created_at)
    }

    fn history(&self, name: &str, kind: StorageKind) -> Vec<&ShardInfo> {
        self.shards
            .iter()
            .filter(|s| s.kind == kind && s.name == name)
            .collect()
    }

    fn current(&self, name: &str, kind: StorageKind) -> Result<&ShardInfo, NoShard> {
        self.history(name, kind).last().copied().ok_or_else(|| NoShard {
            name: name.to_string(),
            kind,
        })
    }
}

impl ShardResolver for StaticShards {
    type Error = NoShard;

    async fn provider<'a>(
        &'a self,
        name: &'a str,
        kind: StorageKind,
        _key: &'a str,
    ) -> Result<String, NoShard> {
        Ok(self.current(name, kind)?.provider.clone())
    }

    async fn table<'a>(
        &'a self,
        name: &'a str,
        kind: StorageKind,
        _key: &'a str,
    ) -> Result<String, NoShard> {
        Ok(self.current(name, kind)?.table.clone())
    }

    async fn table_list<'a>(
        &'a self,
        name: &'a str,
        kind: StorageKind,
        _key: &'a str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, NoShard> {
        let history = self.history(name, kind);
        let Some(since) = since else {
            return Ok(history.iter().map(|s| s.table.clone()).collect());
        };
        // The shard active at `since` is the last one created at or before it.
        let first_active = history
            .iter()
            .rposition(|s| s.created_at <= since)
            .unwrap_or(0);
        Ok(history[first_active..]
            .iter()
            .map(|s| s.table.clone())
            .collect())
    }

    async fn provider_list<'a>(
        &'a self,
        name: &'a str,
        kind: StorageKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ShardInfo>, NoShard> {
        Ok(self
            .history(name, kind)
            .into_iter()
            .filter(|s| since.is_none_or(|since| s.created_at >= since))
            .cloned()
            .collect())
    }
}

/// Resolver that puts everything in one table per storage kind.
///
/// Handy for tests and single-node deployments.
#[derive(Clone, Debug, Default)]
pub struct SingleShard;

impl ShardResolver for SingleShard {
    type Error = Infallible;

    async fn provider<'a>(
        &'a self,
        _name: &'a str,
        _kind: StorageKind,
        _key: &'a str,
    ) -> Result<String, Infallible> {
        Ok("default".to_string())
    }

    async fn table<'a>(
        &'a self,
        name: &'a str,
        kind: StorageKind,
        _key: &'a str,
    ) -> Result<String, Infallible> {
        Ok(format!("{name}_{kind}"))
    }

    async fn table_list<'a>(
        &'a self,
        name: &'a str,
        kind: StorageKind,
        _key: &'a str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, Infallible> {
        Ok(vec![format!("{name}_{kind}")])
    }

    async fn provider_list<'a>(
        &'a self,
        name: &'a str,
        kind: StorageKind,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ShardInfo>, Infallible> {
        Ok(vec![ShardInfo {
            name: name.to_string(),
            provider: "default".to_string(),
            table: format!("{name}_{kind}"),
            kind,
            created_at: DateTime::<Utc>::default(),
        }])
    }
}
