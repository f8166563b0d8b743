//! Shared test domain: a bank account.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use strata::{
    EventKind, Options, State,
    entity::EntityBuilder,
    snapshot::{SnapshotStore, inmemory::Store as SnapshotMemory},
    store::{EventLog, inmemory},
};
use thiserror::Error;

pub const ACCOUNT: &str = "a-1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEvent {
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
    Closed,
    /// Reports no type code at all.
    Untyped,
}

impl EventKind for AccountEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Deposited { .. } => "account.deposited",
            Self::Withdrawn { .. } => "account.withdrawn",
            Self::Closed => "account.closed",
            Self::Untyped => "",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("withdrawal of {requested} exceeds balance {balance}")]
    Overdrawn { requested: i64, balance: i64 },
    #[error("account is closed")]
    Closed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: i64,
    pub closed: bool,
}

impl State for Account {
    const KIND: &'static str = "account";
    type Error = AccountError;
    type Event = AccountEvent;
    type Id = String;

    fn apply(&mut self, event: &AccountEvent) -> Result<(), AccountError> {
        if self.closed {
            return Err(AccountError::Closed);
        }
        match event {
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrawn { amount } => {
                if *amount > self.balance {
                    return Err(AccountError::Overdrawn {
                        requested: *amount,
                        balance: self.balance,
                    });
                }
                self.balance -= amount;
            }
            AccountEvent::Closed => self.closed = true,
            AccountEvent::Untyped => {}
        }
        Ok(())
    }
}

pub const fn deposit(amount: i64) -> AccountEvent {
    AccountEvent::Deposited { amount }
}

pub const fn withdraw(amount: i64) -> AccountEvent {
    AccountEvent::Withdrawn { amount }
}

pub fn account_id() -> String {
    ACCOUNT.to_string()
}

pub fn builder<L, SS>(log: L, snapshots: SS) -> EntityBuilder<Account, L, SS>
where
    L: EventLog<String>,
    SS: SnapshotStore<String>,
{
    EntityBuilder::new(log, snapshots)
}

pub fn memory() -> (inmemory::Log<String>, SnapshotMemory<String>) {
    (inmemory::Log::new(), SnapshotMemory::new())
}

pub fn synchronous() -> Options {
    Options::default().with_snapshot(strata::snapshot::SnapshotPolicy::Synchronous)
}
