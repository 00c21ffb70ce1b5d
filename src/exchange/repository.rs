//! Storage seams for exchange records and protocol messages.
//!
//! Persistent engines implement these traits outside the crate; the in-memory
//! versions here back tests and single-process agents.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

use super::message::{MessageKind, MessageRole, ProtocolMessage};
use super::protocol::ExchangeProtocol;
use super::record::ExchangeRecord;

#[async_trait]
pub trait ExchangeRecordStore<P: ExchangeProtocol>: Send + Sync {
    /// Insert a new record. Fails with `Duplicate` when the id or the
    /// (thread, role, connection) triple is taken.
    async fn save(&self, record: &ExchangeRecord<P>) -> Result<()>;

    /// Replace an existing record.
    async fn update(&self, record: &ExchangeRecord<P>) -> Result<()>;

    async fn delete(&self, record_id: &str) -> Result<()>;

    async fn find_by_id(&self, record_id: &str) -> Result<Option<ExchangeRecord<P>>>;

    /// `connection_id = None` matches connection-less records only.
    async fn find_by_properties(
        &self,
        thread_id: &str,
        role: P::Role,
        connection_id: Option<&str>,
    ) -> Result<Option<ExchangeRecord<P>>>;

    async fn get_all(&self) -> Result<Vec<ExchangeRecord<P>>>;

    async fn get_by_id(&self, record_id: &str) -> Result<ExchangeRecord<P>> {
        self.find_by_id(record_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} record {}", P::NAME, record_id)))
    }
}

/// A message as kept by the message repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub associated_record_id: String,
    pub kind: MessageKind,
    pub role: MessageRole,
    pub message: ProtocolMessage,
}

/// Append-only store of protocol messages by associated record.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn save_message(
        &self,
        associated_record_id: &str,
        kind: MessageKind,
        role: MessageRole,
        message: &ProtocolMessage,
    ) -> Result<()>;

    /// Most recent message of `kind` stored with `role`.
    async fn find_message(
        &self,
        associated_record_id: &str,
        kind: MessageKind,
        role: MessageRole,
    ) -> Result<Option<ProtocolMessage>>;

    /// Most recent message of any kind stored with `role`.
    async fn find_latest(
        &self,
        associated_record_id: &str,
        role: MessageRole,
    ) -> Result<Option<StoredMessage>>;

    async fn get_message(
        &self,
        associated_record_id: &str,
        kind: MessageKind,
        role: MessageRole,
    ) -> Result<ProtocolMessage> {
        self.find_message(associated_record_id, kind, role)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "{} message ({:?}) for record {}",
                    kind, role, associated_record_id
                ))
            })
    }
}

/// In-memory record store.
#[derive(Debug)]
pub struct InMemoryRecordStore<P: ExchangeProtocol> {
    records: RwLock<HashMap<String, ExchangeRecord<P>>>,
}

impl<P: ExchangeProtocol> InMemoryRecordStore<P> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<P: ExchangeProtocol> Default for InMemoryRecordStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<P: ExchangeProtocol> ExchangeRecordStore<P> for InMemoryRecordStore<P> {
    async fn save(&self, record: &ExchangeRecord<P>) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(Error::Duplicate(format!("record {}", record.id)));
        }
        let clash = records.values().any(|r| {
            r.thread_id == record.thread_id
                && r.role == record.role
                && r.connection_id == record.connection_id
        });
        if clash {
            return Err(Error::Duplicate(format!(
                "{} record for thread {} as {}",
                P::NAME,
                record.thread_id,
                record.role
            )));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &ExchangeRecord<P>) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("{} record {}", P::NAME, record.id))),
        }
    }

    async fn delete(&self, record_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        records
            .remove(record_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("{} record {}", P::NAME, record_id)))
    }

    async fn find_by_id(&self, record_id: &str) -> Result<Option<ExchangeRecord<P>>> {
        let records = self.records.read().await;
        Ok(records.get(record_id).cloned())
    }

    async fn find_by_properties(
        &self,
        thread_id: &str,
        role: P::Role,
        connection_id: Option<&str>,
    ) -> Result<Option<ExchangeRecord<P>>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|r| {
                r.thread_id == thread_id
                    && r.role == role
                    && r.connection_id.as_deref() == connection_id
            })
            .cloned())
    }

    async fn get_all(&self) -> Result<Vec<ExchangeRecord<P>>> {
        let records = self.records.read().await;
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }
}

/// In-memory message repository.
#[derive(Debug, Default)]
pub struct InMemoryMessageRepository {
    messages: RwLock<Vec<StoredMessage>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn save_message(
        &self,
        associated_record_id: &str,
        kind: MessageKind,
        role: MessageRole,
        message: &ProtocolMessage,
    ) -> Result<()> {
        let mut messages = self.messages.write().await;
        messages.push(StoredMessage {
            associated_record_id: associated_record_id.to_string(),
            kind,
            role,
            message: message.clone(),
        });
        Ok(())
    }

    async fn find_message(
        &self,
        associated_record_id: &str,
        kind: MessageKind,
        role: MessageRole,
    ) -> Result<Option<ProtocolMessage>> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .rev()
            .find(|m| {
                m.associated_record_id == associated_record_id && m.kind == kind && m.role == role
            })
            .map(|m| m.message.clone()))
    }

    async fn find_latest(
        &self,
        associated_record_id: &str,
        role: MessageRole,
    ) -> Result<Option<StoredMessage>> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .rev()
            .find(|m| m.associated_record_id == associated_record_id && m.role == role)
            .cloned())
    }
}
