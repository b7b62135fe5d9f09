//! Wire protocol for the persistent connection: JSON events tagged by
//! `event`, payload under `data`, camelCase fields.
//!
//! Every server event that refers to a message carries the durable,
//! store-assigned message id. A client-generated temporary id is echoed
//! back (`localId`) so optimistic UI entries can be merged, but it is
//! never the canonical identity; clients de-duplicate by message id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{MessageKind, StoredMessage};

/// Client-originated events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    SendMessage {
        receiver_id: String,
        business_id: String,
        content: String,
        #[serde(default)]
        message_type: MessageKind,
        /// Optional client-side temporary id for optimistic inserts.
        #[serde(default)]
        local_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TypingStart {
        receiver_id: String,
        business_id: String,
        /// Checked against the key derived from the authenticated pairing
        /// when present.
        #[serde(default)]
        conversation_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TypingStop {
        receiver_id: String,
        business_id: String,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MarkRead {
        message_ids: Vec<i64>,
        conversation_id: String,
    },
    #[serde(rename_all = "camelCase")]
    DeleteMessage {
        message_id: i64,
        /// Advisory; the persisted row is the authority on which
        /// conversation the message belongs to.
        #[serde(default)]
        conversation_id: Option<String>,
    },
}

/// A persisted message as delivered over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: i64,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub message_type: String,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<StoredMessage> for MessagePayload {
    fn from(m: StoredMessage) -> Self {
        Self {
            id: m.id,
            conversation_id: m.conversation_key,
            sender_id: m.sender_id,
            receiver_id: m.receiver_id,
            content: m.body,
            message_type: m.kind,
            read: m.read,
            read_at: m.read_at,
            created_at: m.created_at,
        }
    }
}

/// Server-originated events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    NewMessage {
        conversation_id: String,
        message: MessagePayload,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        local_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UserTyping {
        conversation_id: String,
        user_id: String,
        user_name: String,
    },
    #[serde(rename_all = "camelCase")]
    UserStoppedTyping {
        conversation_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    MessageRead {
        conversation_id: String,
        message_id: i64,
        read_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        conversation_id: String,
        message_id: i64,
    },
    #[serde(rename_all = "camelCase")]
    DeleteMessageSuccess {
        conversation_id: String,
        message_id: i64,
    },
    #[serde(rename_all = "camelCase")]
    DeleteMessageError {
        message_id: i64,
        code: String,
        message: String,
    },
    /// Negative acknowledgment, delivered only to the originating
    /// connection. Never broadcast.
    #[serde(rename_all = "camelCase")]
    Error { code: String, message: String },
}
