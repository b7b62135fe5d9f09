use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::errors::{ChatError, ChatResult};

/// Deterministic identifier for a (customer, business) pair, independent of
/// argument order: the two ids sorted and joined with `'|'`.
///
/// Both participant ids are recoverable from the key, which lets the typing
/// sweep address notifications without a store read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn for_pair(a: &str, b: &str) -> Self {
        if a <= b {
            Self(format!("{a}|{b}"))
        } else {
            Self(format!("{b}|{a}"))
        }
    }

    /// Parse a client-supplied key, rejecting anything that is not a pair.
    pub fn parse(raw: &str) -> ChatResult<Self> {
        match raw.split_once('|') {
            Some((a, b)) if !a.is_empty() && !b.is_empty() && !b.contains('|') => {
                Ok(Self::for_pair(a, b))
            }
            _ => Err(ChatError::Validation(format!(
                "malformed conversation key: {raw:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two participant ids, in sorted order.
    pub fn participants(&self) -> (&str, &str) {
        self.0.split_once('|').expect("key is always a joined pair")
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message payload kind. Text-only today; the wire field exists so richer
/// kinds can be added without a protocol change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "text" => Ok(Self::Text),
            other => Err(ChatError::Validation(format!(
                "unsupported message kind: {other:?}"
            ))),
        }
    }
}

/// A conversation row: the durable pairing of one customer and one business,
/// with denormalized last-message preview and per-side unread counters.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Conversation {
    pub key: String,
    pub customer_id: String,
    pub business_id: String,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub customer_unread: i64,
    pub business_unread: i64,
    #[serde(skip)]
    pub customer_deleted: bool,
    #[serde(skip)]
    pub business_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, id: &str) -> bool {
        self.customer_id == id || self.business_id == id
    }

    /// The counterpart of `id` in this conversation.
    pub fn peer_of(&self, id: &str) -> &str {
        if self.customer_id == id {
            &self.business_id
        } else {
            &self.customer_id
        }
    }

    pub fn unread_for(&self, id: &str) -> i64 {
        if self.customer_id == id {
            self.customer_unread
        } else {
            self.business_unread
        }
    }

    pub fn deleted_for(&self, id: &str) -> bool {
        if self.customer_id == id {
            self.customer_deleted
        } else {
            self.business_deleted
        }
    }
}

/// A persisted message. `id` is assigned by the store and is the monotonic
/// creation order within the conversation; it is the canonical identity every
/// delivered event carries.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_key: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub kind: String,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// What a conversation list entry looks like to one participant.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub key: String,
    pub peer_id: String,
    pub peer_name: Option<String>,
    pub peer_avatar: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread: i64,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a message soft-delete, carried to the gateway so it can adjust
/// fan-out without re-reading the store.
#[derive(Debug, Clone)]
pub struct MessageDeletion {
    pub message_id: i64,
    pub conversation_key: ConversationKey,
    pub sender_id: String,
    pub receiver_id: String,
    pub was_unread: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_order_independent() {
        assert_eq!(
            ConversationKey::for_pair("cust-9", "biz-2"),
            ConversationKey::for_pair("biz-2", "cust-9"),
        );
    }

    #[test]
    fn key_exposes_both_participants() {
        let key = ConversationKey::for_pair("cust-9", "biz-2");
        assert_eq!(key.participants(), ("biz-2", "cust-9"));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(ConversationKey::parse("no-separator").is_err());
        assert!(ConversationKey::parse("a|b|c").is_err());
        assert!(ConversationKey::parse("|b").is_err());
        assert!(ConversationKey::parse("a|b").is_ok());
    }
}
