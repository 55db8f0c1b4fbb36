//! Client side of the Telegram account-linking flow.
//!
//! A browser profile (or any host with shared local storage) walks through
//! seven stages, from "not started" to "linked" and "unlinked". This crate
//! keeps that progress in local storage, talks to the remote state endpoint,
//! and makes sure that only one tab per profile polls the endpoint.
//!
//! [`LinkAgent`] wires the pieces together for one tab; the individual
//! components are public so hosts and tests can compose them differently.

pub mod agent;
pub mod clock;
pub mod config;
pub mod election;
pub mod engine;
pub mod error;
pub mod flow;
pub mod notify;
pub mod poller;
pub mod progress;
pub mod remote;
pub mod session;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use agent::LinkAgent;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::ClientSettings;
pub use election::{ElectionTimings, LeaderElection};
pub use engine::{RemoteDecision, RemoteEffect, StageEngine, Transition};
pub use error::{FlowError, RemoteError, Result, StorageError};
pub use flow::{FlowTimings, LinkFlow, SyncFailure};
pub use notify::{Notice, Notifier};
pub use poller::{PollingLoop, TickOutcome, Visibility};
pub use progress::{LastTab, ProgressPatch, ProgressRecord, ProgressStore};
pub use remote::{HttpRemoteState, RemoteState, StateWrite, WriteKind};
pub use session::SessionIdProvider;
pub use storage::{FileStorage, LocalStorage, MemoryStorage, SharedStorage, StorageEvent};
