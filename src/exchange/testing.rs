//! Two-agent harness for exchange tests. Messages are handed across by the
//! test instead of a transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::core::connection::InMemoryConnectionService;
use crate::core::context::AgentContext;
use crate::core::events::EventBus;
use crate::error::{Error, Result};

use super::engine::{ExchangeEngine, ExchangeOutcome, FormatPayloads, InboundMessage};
use super::format::testing::StaticFormat;
use super::format::FormatRegistry;
use super::message::{MessageKind, MessageRole, ProtocolMessage};
use super::protocol::ExchangeProtocol;
use super::record::{AutoAcceptPolicy, ExchangeRecord};
use super::repository::{
    ExchangeRecordStore, InMemoryMessageRepository, InMemoryRecordStore, MessageRepository,
    StoredMessage,
};

/// Connection both peers share.
pub const CONN: &str = "conn-1";

pub struct Peer<P: ExchangeProtocol> {
    pub engine: ExchangeEngine<P>,
    pub ctx: AgentContext,
    pub events: EventBus,
    pub records: Arc<FlakyRecordStore<P>>,
    pub messages: Arc<FlakyMessageRepository>,
}

impl<P: ExchangeProtocol> Peer<P> {
    pub async fn new(label: &str) -> Self {
        Self::build(label, StaticFormat::new("indy", "^hlindy/"), AutoAcceptPolicy::Never).await
    }

    pub async fn with_policy(label: &str, policy: AutoAcceptPolicy) -> Self {
        Self::build(label, StaticFormat::new("indy", "^hlindy/"), policy).await
    }

    pub async fn with_failing_format(label: &str) -> Self {
        Self::build(label, StaticFormat::failing("indy", "^hlindy/"), AutoAcceptPolicy::Never).await
    }

    async fn build(label: &str, indy: StaticFormat, policy: AutoAcceptPolicy) -> Self {
        crate::logging::init_test();
        let connections = Arc::new(InMemoryConnectionService::new());
        connections.insert_ready(CONN).await;

        let registry = FormatRegistry::<P>::new()
            .with(Arc::new(indy))
            .unwrap()
            .with(Arc::new(StaticFormat::new("jsonld", "^aries/ld-proof-vc")))
            .unwrap();
        let records = Arc::new(FlakyRecordStore::<P>::default());
        let messages = Arc::new(FlakyMessageRepository::default());
        let engine = ExchangeEngine::new("v2", Arc::new(registry), records.clone(), messages.clone())
            .with_default_policy(policy);

        Self {
            engine,
            ctx: AgentContext::new(label, connections),
            events: EventBus::default(),
            records,
            messages,
        }
    }
}

/// The outbound message of `outcome`, as delivered over the shared connection.
pub fn inbound<P: ExchangeProtocol>(outcome: &ExchangeOutcome<P>) -> InboundMessage {
    let message = outcome.message.clone().expect("outcome carries no message");
    InboundMessage::new(message, Some(CONN.to_string()))
}

/// Empty options for each of `keys`.
pub fn payloads(keys: &[&str]) -> FormatPayloads {
    keys.iter().map(|k| (k.to_string(), json!({}))).collect()
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Record store that can be told to fail its next updates.
pub struct FlakyRecordStore<P: ExchangeProtocol> {
    inner: InMemoryRecordStore<P>,
    failing_updates: AtomicUsize,
}

impl<P: ExchangeProtocol> Default for FlakyRecordStore<P> {
    fn default() -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            failing_updates: AtomicUsize::new(0),
        }
    }
}

impl<P: ExchangeProtocol> FlakyRecordStore<P> {
    pub fn fail_next_update(&self) {
        self.failing_updates.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<P: ExchangeProtocol> ExchangeRecordStore<P> for FlakyRecordStore<P> {
    async fn save(&self, record: &ExchangeRecord<P>) -> Result<()> {
        self.inner.save(record).await
    }

    async fn update(&self, record: &ExchangeRecord<P>) -> Result<()> {
        if take_failure(&self.failing_updates) {
            return Err(Error::Storage("disk".to_string()));
        }
        self.inner.update(record).await
    }

    async fn delete(&self, record_id: &str) -> Result<()> {
        self.inner.delete(record_id).await
    }

    async fn find_by_id(&self, record_id: &str) -> Result<Option<ExchangeRecord<P>>> {
        self.inner.find_by_id(record_id).await
    }

    async fn find_by_properties(
        &self,
        thread_id: &str,
        role: P::Role,
        connection_id: Option<&str>,
    ) -> Result<Option<ExchangeRecord<P>>> {
        self.inner.find_by_properties(thread_id, role, connection_id).await
    }

    async fn get_all(&self) -> Result<Vec<ExchangeRecord<P>>> {
        self.inner.get_all().await
    }
}

/// Message repository that can be told to fail its next saves.
#[derive(Default)]
pub struct FlakyMessageRepository {
    inner: InMemoryMessageRepository,
    failing_saves: AtomicUsize,
}

impl FlakyMessageRepository {
    pub fn fail_next_save(&self) {
        self.failing_saves.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.inner.len().await
    }
}

#[async_trait]
impl MessageRepository for FlakyMessageRepository {
    async fn save_message(
        &self,
        associated_record_id: &str,
        kind: MessageKind,
        role: MessageRole,
        message: &ProtocolMessage,
    ) -> Result<()> {
        if take_failure(&self.failing_saves) {
            return Err(Error::Storage("disk".to_string()));
        }
        self.inner.save_message(associated_record_id, kind, role, message).await
    }

    async fn find_message(
        &self,
        associated_record_id: &str,
        kind: MessageKind,
        role: MessageRole,
    ) -> Result<Option<ProtocolMessage>> {
        self.inner.find_message(associated_record_id, kind, role).await
    }

    async fn find_latest(
        &self,
        associated_record_id: &str,
        role: MessageRole,
    ) -> Result<Option<StoredMessage>> {
        self.inner.find_latest(associated_record_id, role).await
    }
}
