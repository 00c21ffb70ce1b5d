//! TinyExchange library root.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod pickup;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{AgentContext, AgentEvent, EventBus};
pub use error::{Error, Result};
pub use exchange::{CredentialEngine, ExchangeEngine, ExchangeHandler, ProofEngine};
pub use pickup::{PickupEngine, SessionRegistry, SqliteQueueRepository};
