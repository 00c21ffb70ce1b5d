//! Core module - shared plumbing for the protocol engines.
//!
//! This module contains what both engines lean on:
//! - Keyed locks serializing record and queue mutation
//! - Agent events and the bus callers forward them to
//! - Connection lookup and the per-call agent context

pub mod connection;
pub mod context;
pub mod events;
pub mod lock;

pub use connection::{Connection, ConnectionService, ConnectionState, InMemoryConnectionService};
pub use context::AgentContext;
pub use events::{AgentEvent, EventBus, PickupCompleted};
pub use lock::KeyedLocks;
