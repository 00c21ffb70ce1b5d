//! Queue of encrypted messages held for offline recipients.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

/// An encrypted message waiting to be picked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Unique ID (ULID)
    pub id: String,
    pub connection_id: String,
    /// Set when a mediator forwards for several keys on one connection.
    pub recipient_key: Option<String>,
    /// Never inspected by the engine.
    pub encrypted_payload: Vec<u8>,
    /// Unix timestamp (ms)
    pub received_at: i64,
}

impl QueuedMessage {
    pub fn new(connection_id: impl Into<String>, recipient_key: Option<String>, encrypted_payload: Vec<u8>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            connection_id: connection_id.into(),
            recipient_key,
            encrypted_payload,
            received_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Whether this message is visible to a query scoped to `recipient_key`.
    pub fn matches(&self, connection_id: &str, recipient_key: Option<&str>) -> bool {
        self.connection_id == connection_id
            && recipient_key.map_or(true, |key| self.recipient_key.as_deref() == Some(key))
    }
}

/// Parameters for [`QueueRepository::take_from_queue`].
#[derive(Debug, Clone, Default)]
pub struct TakeFromQueue {
    pub connection_id: String,
    pub recipient_key: Option<String>,
    /// `None` takes everything available.
    pub limit: Option<usize>,
    /// `false` deletes the taken messages in the same step.
    pub keep_messages: bool,
}

impl TakeFromQueue {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            keep_messages: true,
            ..Default::default()
        }
    }

    pub fn recipient_key(mut self, recipient_key: Option<String>) -> Self {
        self.recipient_key = recipient_key;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn keep_messages(mut self, keep: bool) -> Self {
        self.keep_messages = keep;
        self
    }
}

/// Storage of queued messages, oldest first.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn get_available_message_count(&self, connection_id: &str, recipient_key: Option<&str>) -> Result<usize>;

    async fn take_from_queue(&self, options: TakeFromQueue) -> Result<Vec<QueuedMessage>>;

    /// Store a message and return its id.
    async fn add_message(&self, connection_id: &str, recipient_key: Option<&str>, payload: Vec<u8>) -> Result<String>;

    /// Delete the given ids from the connection's queue; unknown ids are
    /// ignored. Returns how many were deleted.
    async fn remove_messages(&self, connection_id: &str, message_ids: &[String]) -> Result<usize>;
}

pub type SharedQueue = Arc<dyn QueueRepository>;

/// In-memory queue.
#[derive(Debug, Default)]
pub struct InMemoryQueueRepository {
    messages: RwLock<Vec<QueuedMessage>>,
}

impl InMemoryQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn get_available_message_count(&self, connection_id: &str, recipient_key: Option<&str>) -> Result<usize> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.matches(connection_id, recipient_key))
            .count())
    }

    async fn take_from_queue(&self, options: TakeFromQueue) -> Result<Vec<QueuedMessage>> {
        let mut messages = self.messages.write().await;
        let limit = options.limit.unwrap_or(usize::MAX);
        let taken: Vec<QueuedMessage> = messages
            .iter()
            .filter(|m| m.matches(&options.connection_id, options.recipient_key.as_deref()))
            .take(limit)
            .cloned()
            .collect();

        if !options.keep_messages {
            messages.retain(|m| !taken.iter().any(|t| t.id == m.id));
        }
        Ok(taken)
    }

    async fn add_message(&self, connection_id: &str, recipient_key: Option<&str>, payload: Vec<u8>) -> Result<String> {
        let message = QueuedMessage::new(connection_id, recipient_key.map(str::to_string), payload);
        let id = message.id.clone();
        self.messages.write().await.push(message);
        Ok(id)
    }

    async fn remove_messages(&self, connection_id: &str, message_ids: &[String]) -> Result<usize> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|m| !(m.connection_id == connection_id && message_ids.contains(&m.id)));
        Ok(before - messages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue_with(count: usize) -> InMemoryQueueRepository {
        let queue = InMemoryQueueRepository::new();
        for i in 0..count {
            queue.add_message("conn-1", None, vec![i as u8]).await.unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn test_take_is_an_idempotent_peek() {
        let queue = queue_with(5).await;
        let first = queue.take_from_queue(TakeFromQueue::new("conn-1").limit(3)).await.unwrap();
        let again = queue.take_from_queue(TakeFromQueue::new("conn-1").limit(3)).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first[0].encrypted_payload, vec![0]);
        assert_eq!(queue.get_available_message_count("conn-1", None).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_remove_reduces_count_by_removed_ids() {
        let queue = queue_with(5).await;
        let taken = queue.take_from_queue(TakeFromQueue::new("conn-1").limit(3)).await.unwrap();
        let ids: Vec<String> = taken.iter().map(|m| m.id.clone()).collect();

        assert_eq!(queue.remove_messages("conn-1", &ids).await.unwrap(), 3);
        assert_eq!(queue.get_available_message_count("conn-1", None).await.unwrap(), 2);

        // Acknowledging again is harmless.
        assert_eq!(queue.remove_messages("conn-1", &ids).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_take_without_keep_deletes() {
        let queue = queue_with(4).await;
        let taken = queue
            .take_from_queue(TakeFromQueue::new("conn-1").limit(3).keep_messages(false))
            .await
            .unwrap();
        assert_eq!(taken.len(), 3);
        assert_eq!(queue.get_available_message_count("conn-1", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recipient_key_scoping() {
        let queue = InMemoryQueueRepository::new();
        queue.add_message("conn-1", Some("key-a"), vec![1]).await.unwrap();
        queue.add_message("conn-1", Some("key-b"), vec![2]).await.unwrap();
        queue.add_message("conn-2", Some("key-a"), vec![3]).await.unwrap();

        assert_eq!(queue.get_available_message_count("conn-1", None).await.unwrap(), 2);
        assert_eq!(queue.get_available_message_count("conn-1", Some("key-a")).await.unwrap(), 1);
        let taken = queue
            .take_from_queue(TakeFromQueue::new("conn-1").recipient_key(Some("key-b".to_string())))
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].encrypted_payload, vec![2]);
    }
}
