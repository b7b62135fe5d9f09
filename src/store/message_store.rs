use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::errors::{ChatError, ChatResult};
use crate::identity::{Directory, Role};
use crate::pagination::{paginate, PageInfo};

use super::models::{
    Conversation, ConversationKey, ConversationSummary, MessageDeletion, MessageKind,
    StoredMessage,
};

/// Characters of the message body kept as the conversation's denormalized
/// preview.
const PREVIEW_CHARS: usize = 120;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    key              TEXT PRIMARY KEY,
    customer_id      TEXT NOT NULL,
    business_id      TEXT NOT NULL,
    last_message     TEXT,
    last_message_at  TEXT,
    customer_unread  INTEGER NOT NULL DEFAULT 0,
    business_unread  INTEGER NOT NULL DEFAULT 0,
    customer_deleted INTEGER NOT NULL DEFAULT 0,
    business_deleted INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_key TEXT NOT NULL REFERENCES conversations(key),
    sender_id        TEXT NOT NULL,
    receiver_id      TEXT NOT NULL,
    body             TEXT NOT NULL,
    kind             TEXT NOT NULL DEFAULT 'text',
    read             INTEGER NOT NULL DEFAULT 0,
    read_at          TEXT,
    deleted          INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_key, id);
CREATE INDEX IF NOT EXISTS idx_messages_unread ON messages (conversation_key, receiver_id, read);
"#;

/// Durable persistence for conversations and messages.
///
/// Owns uniqueness (one conversation per pair), ordering (store-assigned
/// message ids) and read/delete state. Every mutation is scoped to one
/// conversation and serialized through that conversation's lock, so unread
/// counters never drift from the true count of unread rows while unrelated
/// conversations proceed concurrently.
pub struct MessageStore {
    pool: SqlitePool,
    directory: Arc<dyn Directory>,
    max_body_chars: usize,
    conv_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MessageStore {
    pub async fn connect(
        database_url: &str,
        directory: Arc<dyn Directory>,
        max_body_chars: usize,
    ) -> ChatResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            directory,
            max_body_chars,
            conv_locks: DashMap::new(),
        })
    }

    pub async fn ping(&self) -> ChatResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn lock_for(&self, key: &ConversationKey) -> Arc<Mutex<()>> {
        self.conv_locks
            .entry(key.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// Resolve (or lazily create) the conversation for a (customer, business)
    /// pair. Idempotent: the same two participants always resolve to the same
    /// row, regardless of argument order at the call sites.
    pub async fn get_or_create_conversation(
        &self,
        customer_id: &str,
        business_id: &str,
    ) -> ChatResult<Conversation> {
        if customer_id == business_id {
            return Err(ChatError::InvalidParticipants(
                "customer and business denote the same account".into(),
            ));
        }
        let customer = self.directory.lookup(customer_id).ok_or_else(|| {
            ChatError::InvalidParticipants(format!("unknown customer: {customer_id}"))
        })?;
        let business = self.directory.lookup(business_id).ok_or_else(|| {
            ChatError::InvalidParticipants(format!("unknown business: {business_id}"))
        })?;
        if customer.role != Role::Customer || business.role != Role::Business {
            return Err(ChatError::InvalidParticipants(
                "pair is not a (customer, business) pairing".into(),
            ));
        }

        let key = ConversationKey::for_pair(customer_id, business_id);
        let guard = self.lock_for(&key);
        let _held = guard.lock().await;

        sqlx::query(
            "INSERT INTO conversations (key, customer_id, business_id, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(key.as_str())
        .bind(customer_id)
        .bind(business_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.conversation(&key)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {key}")))
    }

    pub async fn conversation(&self, key: &ConversationKey) -> ChatResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Conversation summaries for one participant, most recent activity
    /// first, excluding conversations deleted on that side.
    pub async fn conversations_for(
        &self,
        participant_id: &str,
    ) -> ChatResult<Vec<ConversationSummary>> {
        let rows = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations
             WHERE (customer_id = ?1 AND customer_deleted = 0)
                OR (business_id = ?1 AND business_deleted = 0)
             ORDER BY COALESCE(last_message_at, created_at) DESC",
        )
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|c| {
                let peer_id = c.peer_of(participant_id).to_string();
                let profile = self.directory.lookup(&peer_id);
                ConversationSummary {
                    unread: c.unread_for(participant_id),
                    key: c.key,
                    peer_name: profile.as_ref().map(|p| p.name.clone()),
                    peer_avatar: profile.and_then(|p| p.avatar),
                    peer_id,
                    last_message: c.last_message,
                    last_message_at: c.last_message_at,
                    created_at: c.created_at,
                }
            })
            .collect())
    }

    /// Mark the conversation deleted for the requester's side only. The row
    /// and its messages are physically removed once both sides have deleted.
    pub async fn delete_conversation(
        &self,
        key: &ConversationKey,
        requester_id: &str,
    ) -> ChatResult<()> {
        let guard = self.lock_for(key);
        let _held = guard.lock().await;

        let mut tx = self.pool.begin().await?;

        let conv = sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {key}")))?;

        if !conv.is_participant(requester_id) {
            return Err(ChatError::Forbidden(
                "requester is not a participant of this conversation".into(),
            ));
        }

        let column = if conv.customer_id == requester_id {
            "customer_deleted"
        } else {
            "business_deleted"
        };
        sqlx::query(&format!(
            "UPDATE conversations SET {column} = 1 WHERE key = ?"
        ))
        .bind(key.as_str())
        .execute(&mut *tx)
        .await?;

        let other_side_deleted = if conv.customer_id == requester_id {
            conv.business_deleted
        } else {
            conv.customer_deleted
        };
        if other_side_deleted {
            sqlx::query("DELETE FROM messages WHERE conversation_key = ?")
                .bind(key.as_str())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM conversations WHERE key = ?")
                .bind(key.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        if other_side_deleted {
            // The row is gone; a recreated conversation gets a fresh guard.
            self.conv_locks.remove(key.as_str());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Append a message and, in the same transaction, refresh the preview and
    /// increment the receiver-side unread counter. A concurrent reader never
    /// observes one without the other.
    pub async fn append_message(
        &self,
        key: &ConversationKey,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
        kind: MessageKind,
    ) -> ChatResult<StoredMessage> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::Validation("message body is empty".into()));
        }
        if body.chars().count() > self.max_body_chars {
            return Err(ChatError::Validation(format!(
                "message body exceeds {} characters",
                self.max_body_chars
            )));
        }

        let guard = self.lock_for(key);
        let _held = guard.lock().await;

        let mut tx = self.pool.begin().await?;

        let conv = sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {key}")))?;

        if sender_id == receiver_id
            || !conv.is_participant(sender_id)
            || !conv.is_participant(receiver_id)
        {
            return Err(ChatError::Validation(
                "sender and receiver must be the conversation's two participants".into(),
            ));
        }

        let now = Utc::now();
        let message = sqlx::query_as::<_, StoredMessage>(
            "INSERT INTO messages (conversation_key, sender_id, receiver_id, body, kind, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(key.as_str())
        .bind(sender_id)
        .bind(receiver_id)
        .bind(body)
        .bind(kind.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let unread_column = if conv.customer_id == receiver_id {
            "customer_unread"
        } else {
            "business_unread"
        };
        // A new message also resurfaces the conversation for a side that had
        // deleted it; visibility flags are per-side, not permanent.
        sqlx::query(&format!(
            "UPDATE conversations
             SET last_message = ?, last_message_at = ?,
                 {unread_column} = {unread_column} + 1,
                 customer_deleted = 0, business_deleted = 0
             WHERE key = ?"
        ))
        .bind(preview_of(body))
        .bind(now)
        .bind(key.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    /// One page of messages in creation order (newest-last), soft-deleted
    /// rows excluded. Page-based, so a client can restart from any point.
    pub async fn list_messages(
        &self,
        key: &ConversationKey,
        page: u64,
        per_page: u64,
    ) -> ChatResult<(Vec<StoredMessage>, PageInfo)> {
        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE conversation_key = ? AND deleted = 0",
        )
        .bind(key.as_str())
        .fetch_one(&self.pool)
        .await?;

        let info = paginate(total as u64, page, per_page);
        let rows = sqlx::query_as::<_, StoredMessage>(
            "SELECT * FROM messages
             WHERE conversation_key = ? AND deleted = 0
             ORDER BY id ASC
             LIMIT ? OFFSET ?",
        )
        .bind(key.as_str())
        .bind(info.per_page as i64)
        .bind(info.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok((rows, info))
    }

    /// Flip the given messages to read, for rows actually addressed to the
    /// reader and still unread. Already-read ids are no-ops, not errors. The
    /// side's unread counter is decremented by exactly the number of rows
    /// flipped. Returns the flipped ids with their read timestamp, for read
    /// receipts.
    pub async fn mark_read(
        &self,
        message_ids: &[i64],
        key: &ConversationKey,
        reader_id: &str,
    ) -> ChatResult<Vec<(i64, DateTime<Utc>)>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let guard = self.lock_for(key);
        let _held = guard.lock().await;

        let mut tx = self.pool.begin().await?;

        let read_at = Utc::now();
        let mut qb = sqlx::QueryBuilder::new("UPDATE messages SET read = 1, read_at = ");
        qb.push_bind(read_at);
        qb.push(" WHERE conversation_key = ");
        qb.push_bind(key.as_str());
        qb.push(" AND receiver_id = ");
        qb.push_bind(reader_id);
        qb.push(" AND read = 0 AND deleted = 0 AND id IN (");
        let mut ids = qb.separated(", ");
        for id in message_ids {
            ids.push_bind(id);
        }
        qb.push(") RETURNING id");

        let flipped: Vec<(i64,)> = qb.build_query_as().fetch_all(&mut *tx).await?;

        if !flipped.is_empty() {
            self.decrement_unread(&mut tx, key, reader_id, flipped.len() as i64)
                .await?;
        }

        tx.commit().await?;
        Ok(flipped.into_iter().map(|(id,)| (id, read_at)).collect())
    }

    /// Bulk form of [`mark_read`]: flips every unread message addressed to
    /// the reader and zeroes that side's counter. Returns the flipped ids.
    pub async fn mark_conversation_read(
        &self,
        key: &ConversationKey,
        reader_id: &str,
    ) -> ChatResult<Vec<(i64, DateTime<Utc>)>> {
        let guard = self.lock_for(key);
        let _held = guard.lock().await;

        let mut tx = self.pool.begin().await?;

        let read_at = Utc::now();
        let flipped: Vec<(i64,)> = sqlx::query_as(
            "UPDATE messages SET read = 1, read_at = ?
             WHERE conversation_key = ? AND receiver_id = ? AND read = 0 AND deleted = 0
             RETURNING id",
        )
        .bind(read_at)
        .bind(key.as_str())
        .bind(reader_id)
        .fetch_all(&mut *tx)
        .await?;

        let conv = sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {key}")))?;
        let column = if conv.customer_id == reader_id {
            "customer_unread"
        } else {
            "business_unread"
        };
        sqlx::query(&format!("UPDATE conversations SET {column} = 0 WHERE key = ?"))
            .bind(key.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(flipped.into_iter().map(|(id,)| (id, read_at)).collect())
    }

    /// Soft-delete a message. Only the sender may delete; if the message was
    /// still unread the receiver's counter is decremented with it.
    pub async fn delete_message(
        &self,
        message_id: i64,
        requester_id: &str,
    ) -> ChatResult<MessageDeletion> {
        let existing = sqlx::query_as::<_, StoredMessage>(
            "SELECT * FROM messages WHERE id = ? AND deleted = 0",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;

        if existing.sender_id != requester_id {
            return Err(ChatError::Forbidden(
                "only the sender may delete a message".into(),
            ));
        }

        let key = ConversationKey::parse(&existing.conversation_key)?;
        let guard = self.lock_for(&key);
        let _held = guard.lock().await;

        let mut tx = self.pool.begin().await?;

        // Re-check under the lock; the row may have raced another delete.
        let row: Option<(bool,)> = sqlx::query_as(
            "UPDATE messages SET deleted = 1 WHERE id = ? AND deleted = 0 RETURNING read = 0",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?;
        let was_unread = match row {
            Some((unread,)) => unread,
            None => return Err(ChatError::NotFound(format!("message {message_id}"))),
        };

        if was_unread {
            self.decrement_unread(&mut tx, &key, &existing.receiver_id, 1)
                .await?;
        }

        tx.commit().await?;
        Ok(MessageDeletion {
            message_id,
            conversation_key: key,
            sender_id: existing.sender_id,
            receiver_id: existing.receiver_id,
            was_unread,
        })
    }

    /// Sum of unread counters across all of the participant's non-deleted
    /// conversations.
    pub async fn unread_count_for(&self, participant_id: &str) -> ChatResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(CASE WHEN customer_id = ?1 THEN customer_unread
                                      ELSE business_unread END), 0)
             FROM conversations
             WHERE (customer_id = ?1 AND customer_deleted = 0)
                OR (business_id = ?1 AND business_deleted = 0)",
        )
        .bind(participant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn decrement_unread(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        key: &ConversationKey,
        side_participant: &str,
        by: i64,
    ) -> ChatResult<()> {
        let conv = sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {key}")))?;
        let column = if conv.customer_id == side_participant {
            "customer_unread"
        } else {
            "business_unread"
        };
        // `by` is the count of rows actually flipped under the conversation
        // lock; the MAX clamp holds the never-negative invariant regardless.
        sqlx::query(&format!(
            "UPDATE conversations SET {column} = MAX({column} - ?, 0) WHERE key = ?"
        ))
        .bind(by)
        .bind(key.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn preview_of(body: &str) -> String {
    if body.chars().count() <= PREVIEW_CHARS {
        body.to_string()
    } else {
        body.chars().take(PREVIEW_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{InMemoryDirectory, Profile};

    async fn seeded_store(tmp: &tempfile::TempDir) -> MessageStore {
        let url = format!(
            "sqlite://{}?mode=rwc",
            tmp.path().join("store.db").display()
        );
        let directory = Arc::new(InMemoryDirectory::new());
        directory.insert(Profile {
            id: "cust-1".into(),
            role: Role::Customer,
            name: "Alice".into(),
            avatar: None,
        });
        directory.insert(Profile {
            id: "biz-1".into(),
            role: Role::Business,
            name: "Corner Bakery".into(),
            avatar: None,
        });
        MessageStore::connect(&url, directory, 1000).await.unwrap()
    }

    #[tokio::test]
    async fn lock_registry_is_evicted_with_the_conversation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = seeded_store(&tmp).await;

        let conv = store
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();
        let key = ConversationKey::parse(&conv.key).unwrap();
        store
            .append_message(&key, "cust-1", "biz-1", "hi", MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(store.conv_locks.len(), 1);

        // One side deleting keeps the row, and with it the guard.
        store.delete_conversation(&key, "cust-1").await.unwrap();
        assert_eq!(store.conv_locks.len(), 1);

        // Physical removal drops the guard too.
        store.delete_conversation(&key, "biz-1").await.unwrap();
        assert_eq!(store.conv_locks.len(), 0);

        // The pair can start over with a fresh row and a fresh guard.
        let recreated = store
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();
        assert_eq!(recreated.business_unread, 0);
        assert!(recreated.last_message.is_none());
    }
}
