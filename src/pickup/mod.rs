//! Message pickup: queued and live delivery for intermittently connected recipients.

pub mod engine;
pub mod message;
pub mod queue;
pub mod session;
pub mod sqlite;

pub use engine::{DeliveryOutcome, PickupEngine, PickupOutcome};
pub use message::{PickupBody, PickupMessage};
pub use queue::{InMemoryQueueRepository, QueueRepository, QueuedMessage, SharedQueue, TakeFromQueue};
pub use session::{LiveSession, SessionRegistry, SessionRole};
pub use sqlite::SqliteQueueRepository;
