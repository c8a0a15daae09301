//! Collaborator interfaces.
//!
//! User accounts, chat messages, and the realtime push transport are owned
//! by other subsystems. The attachment engine consumes them through these
//! narrow traits; the in-memory implementations back the test suites and
//! the standalone demo wiring.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::Id;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("User not found: {0}")]
    UserNotFound(String),
    #[error("Publish failed: {0}")]
    PublishFailed(String),
    #[error("Gateway error: {0}")]
    Other(String),
}

/// Minimal view of a chat message the attachment engine needs: who may see
/// the attachments hanging off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub id: Id,
    pub sender_id: Id,
    pub recipient_id: Id,
}

/// "Verify identity, return user id" boundary to account management.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Option<Id>;
}

/// Boundary to the conversation feature: create the message that carries a
/// batch of attachments, and look one up for access checks.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn create_message(
        &self,
        sender_id: Id,
        recipient_id: Id,
        content: &str,
    ) -> Result<MessageRef, GatewayError>;

    async fn find_message(&self, id: Id) -> Option<MessageRef>;
}

/// Boundary to the realtime transport: tell live viewers a message changed
/// so they re-render its attachments without polling.
#[async_trait]
pub trait UpdatePublisher: Send + Sync {
    async fn message_updated(&self, message_id: Id) -> Result<(), GatewayError>;
}

/// In-memory user directory.
#[derive(Default)]
pub struct MemoryDirectory {
    users: RwLock<Vec<(Id, String)>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, id: Id, username: impl Into<String>) {
        self.users.write().await.push((id, username.into()));
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn find_by_username(&self, username: &str) -> Option<Id> {
        self.users
            .read()
            .await
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(username))
            .map(|(id, _)| *id)
    }
}

/// In-memory message gateway.
#[derive(Default)]
pub struct MemoryMessageGateway {
    messages: RwLock<Vec<MessageRef>>,
    next_id: std::sync::atomic::AtomicI64,
}

impl MemoryMessageGateway {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            next_id: std::sync::atomic::AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl MessageGateway for MemoryMessageGateway {
    async fn create_message(
        &self,
        sender_id: Id,
        recipient_id: Id,
        _content: &str,
    ) -> Result<MessageRef, GatewayError> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let message = MessageRef {
            id,
            sender_id,
            recipient_id,
        };
        self.messages.write().await.push(message);
        Ok(message)
    }

    async fn find_message(&self, id: Id) -> Option<MessageRef> {
        self.messages
            .read()
            .await
            .iter()
            .find(|m| m.id == id)
            .copied()
    }
}

/// Publisher that records events for assertions in tests.
#[derive(Default)]
pub struct MemoryPublisher {
    published: RwLock<Vec<Id>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message ids published so far, in order.
    pub async fn published(&self) -> Vec<Id> {
        self.published.read().await.clone()
    }
}

#[async_trait]
impl UpdatePublisher for MemoryPublisher {
    async fn message_updated(&self, message_id: Id) -> Result<(), GatewayError> {
        self.published.write().await.push(message_id);
        Ok(())
    }
}
