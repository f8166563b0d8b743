//! Best-effort delivery of committed events to an external bus.
//!
//! Publishing happens after an event is stored and applied. A failed publish
//! is logged and dropped; it never undoes a write. Consumers must not rely on
//! exactly-once delivery and should treat messages as idempotent.

use std::{collections::HashMap, convert::Infallible, future::Future};

use serde::{Deserialize, Serialize};

use crate::event::RecordedEvent;

/// Where an event is published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    pub topic: String,
    pub provider: String,
}

impl PublishOptions {
    #[must_use]
    pub fn new(topic: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            provider: provider.into(),
        }
    }
}

/// Publish routing for one entity type.
///
/// An event is routed by its type code override if one exists, otherwise by
/// the entity default. Exactly one route is used per event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishRoutes {
    pub default: Option<PublishOptions>,
    pub overrides: HashMap<String, PublishOptions>,
}

impl PublishRoutes {
    /// Route every event to `options`.
    #[must_use]
    pub fn to(options: PublishOptions) -> Self {
        Self {
            default: Some(options),
            overrides: HashMap::new(),
        }
    }

    /// Route events with `type_code` to `options` instead of the default.
    #[must_use]
    pub fn with_override(mut self, type_code: impl Into<String>, options: PublishOptions) -> Self {
        self.overrides.insert(type_code.into(), options);
        self
    }

    #[must_use]
    pub fn resolve(&self, type_code: &str) -> Option<&PublishOptions> {
        self.overrides.get(type_code).or(self.default.as_ref())
    }
}

/// Message bus seam.
pub trait Publisher<Id>: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Deliver one stored event to `topic` on `provider`.
    ///
    /// # Errors
    ///
    /// Returns a transport-specific error. The pipeline logs and drops it.
    fn publish<'a>(
        &'a self,
        event: &'a RecordedEvent<Id>,
        topic: &'a str,
        provider: &'a str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

/// Publisher that drops every event.
///
/// The default when an entity is built without a publisher.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPublisher;

impl<Id: Sync + 'static> Publisher<Id> for NoPublisher {
    type Error = Infallible;

    async fn publish<'a>(
        &'a self,
        _event: &'a RecordedEvent<Id>,
        _topic: &'a str,
        _provider: &'a str,
    ) -> Result<(), Infallible> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_default() {
        let routes = PublishRoutes::to(PublishOptions::new("accounts", "nats"))
            .with_override("account.closed", PublishOptions::new("closures", "kafka"));

        let closed = routes.resolve("account.closed").unwrap();
        assert_eq!(closed.topic, "closures");
        assert_eq!(closed.provider, "kafka");

        let deposited = routes.resolve("account.deposited").unwrap();
        assert_eq!(deposited.topic, "accounts");
    }

    #[test]
    fn no_routes_resolves_nothing() {
        assert!(PublishRoutes::default().resolve("anything").is_none());
    }

    #[test]
    fn override_without_default_only_routes_its_type() {
        let routes = PublishRoutes::default()
            .with_override("account.closed", PublishOptions::new("closures", "kafka"));
        assert!(routes.resolve("account.closed").is_some());
        assert!(routes.resolve("account.deposited").is_none());
    }
}
