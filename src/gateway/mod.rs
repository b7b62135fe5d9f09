//! Real-time protocol handler.
//!
//! Receives client events from the persistent connection, validates and
//! applies them against the message store, and fans the results out through
//! the session manager. Errors are returned only to the originating
//! connection as a negative ack; nothing is ever broadcast for a failed
//! operation, and no "new message" event is emitted without a successful
//! durable append.

pub mod protocol;
pub mod ws;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::{ChatError, ChatResult};
use crate::identity::{Participant, Role};
use crate::plog_debug;
use crate::presence::{TypingExpiry, TypingTracker};
use crate::session::{ConnectionId, SessionManager};
use crate::store::{ConversationKey, MessageKind, MessageStore};

use protocol::{ClientEvent, ServerEvent};

pub struct Gateway {
    store: Arc<MessageStore>,
    sessions: Arc<SessionManager>,
    typing: Arc<TypingTracker>,
    store_retries: u32,
}

impl Gateway {
    pub fn new(
        store: Arc<MessageStore>,
        sessions: Arc<SessionManager>,
        typing: Arc<TypingTracker>,
        store_retries: u32,
    ) -> Self {
        Self {
            store,
            sessions,
            typing,
            store_retries,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn typing(&self) -> &Arc<TypingTracker> {
        &self.typing
    }

    /// Dispatch one client event. Failures become a negative ack to the
    /// originating connection; they never close it and never broadcast.
    pub async fn handle_event(
        &self,
        conn_id: ConnectionId,
        sender: &Participant,
        event: ClientEvent,
    ) {
        match event {
            ClientEvent::SendMessage {
                receiver_id,
                business_id,
                content,
                message_type,
                local_id,
            } => {
                if let Err(err) = self
                    .handle_send(sender, &receiver_id, &business_id, &content, message_type, local_id)
                    .await
                {
                    self.nack(conn_id, &err);
                }
            }
            ClientEvent::TypingStart {
                receiver_id,
                business_id,
                conversation_id,
            } => {
                if let Err(err) = self.handle_typing(
                    sender,
                    &receiver_id,
                    &business_id,
                    conversation_id.as_deref(),
                    true,
                ) {
                    self.nack(conn_id, &err);
                }
            }
            ClientEvent::TypingStop {
                receiver_id,
                business_id,
                conversation_id,
            } => {
                if let Err(err) = self.handle_typing(
                    sender,
                    &receiver_id,
                    &business_id,
                    conversation_id.as_deref(),
                    false,
                ) {
                    self.nack(conn_id, &err);
                }
            }
            ClientEvent::MarkRead {
                message_ids,
                conversation_id,
            } => {
                if let Err(err) = self.handle_mark_read(sender, &message_ids, &conversation_id).await
                {
                    self.nack(conn_id, &err);
                }
            }
            ClientEvent::DeleteMessage {
                message_id,
                conversation_id: _,
            } => {
                if let Err(err) = self.handle_delete(conn_id, sender, message_id).await {
                    // Delete gets its dedicated error ack, requester only.
                    self.sessions.deliver_to_connection(
                        conn_id,
                        ServerEvent::DeleteMessageError {
                            message_id,
                            code: err.error_name().to_string(),
                            message: err.to_string(),
                        },
                    );
                }
            }
        }
    }

    /// Connection loss: drop the routing entries and emit synthetic
    /// stopped-typing notifications for anything the participant left open.
    pub fn handle_disconnect(&self, conn_id: ConnectionId) {
        if let Some(participant_id) = self.sessions.unregister(conn_id) {
            // Only heal typing state once the last connection is gone; other
            // tabs of the same participant may still be composing.
            if !self.sessions.is_online(&participant_id) {
                let cleared = self.typing.clear_participant(&participant_id);
                self.publish_typing_expiries(&cleared);
            }
            plog_debug!("connection {conn_id} unregistered ({participant_id})");
        }
    }

    /// Turn sweep evictions (or disconnect clears) into stopped-typing
    /// events for the affected peers.
    pub fn publish_typing_expiries(&self, expiries: &[TypingExpiry]) {
        for expiry in expiries {
            let event = ServerEvent::UserStoppedTyping {
                conversation_id: expiry.conversation_key.to_string(),
                user_id: expiry.participant_id.clone(),
            };
            self.sessions.deliver_to_participant(&expiry.peer_id, &event);
        }
    }

    /// Fan out read receipts to the original sender of the flipped messages.
    /// Shared by the real-time mark-read path and the synchronization API's
    /// bulk mark-read, so both surfaces stay consistent.
    pub fn publish_read_receipts(
        &self,
        key: &ConversationKey,
        reader: &Participant,
        flipped: &[(i64, DateTime<Utc>)],
    ) {
        let (a, b) = key.participants();
        let original_sender = if reader.id == a { b } else { a };
        let sender_role = opposite(reader.role);
        for (message_id, read_at) in flipped {
            let event = ServerEvent::MessageRead {
                conversation_id: key.to_string(),
                message_id: *message_id,
                read_at: *read_at,
            };
            self.deliver_to_side(original_sender, sender_role, &event);
        }
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    async fn handle_send(
        &self,
        sender: &Participant,
        receiver_id: &str,
        business_id: &str,
        content: &str,
        kind: MessageKind,
        local_id: Option<String>,
    ) -> ChatResult<()> {
        let pairing = resolve_pairing(sender, receiver_id, business_id)?;

        let conv = with_retries(self.store_retries, || {
            self.store
                .get_or_create_conversation(&pairing.customer_id, &pairing.business_id)
        })
        .await?;
        let key = ConversationKey::parse(&conv.key)?;

        let message = with_retries(self.store_retries, || {
            self.store
                .append_message(&key, &sender.id, &pairing.receiver_id, content, kind)
        })
        .await?;

        // Sending implies no longer composing.
        if self.typing.stop_typing(&key, &sender.id) {
            let stopped = ServerEvent::UserStoppedTyping {
                conversation_id: key.to_string(),
                user_id: sender.id.clone(),
            };
            self.sessions
                .deliver_to_participant(&pairing.receiver_id, &stopped);
        }

        let event = ServerEvent::NewMessage {
            conversation_id: key.to_string(),
            message: message.into(),
            local_id,
        };
        self.deliver_to_side(&pairing.customer_id, Role::Customer, &event);
        self.deliver_to_side(&pairing.business_id, Role::Business, &event);
        Ok(())
    }

    fn handle_typing(
        &self,
        sender: &Participant,
        receiver_id: &str,
        business_id: &str,
        conversation_id: Option<&str>,
        start: bool,
    ) -> ChatResult<()> {
        let pairing = resolve_pairing(sender, receiver_id, business_id)?;
        let key = ConversationKey::for_pair(&pairing.customer_id, &pairing.business_id);
        if let Some(supplied) = conversation_id {
            if ConversationKey::parse(supplied)? != key {
                return Err(ChatError::Validation(
                    "conversationId does not match the addressed pair".into(),
                ));
            }
        }

        let event = if start {
            self.typing
                .start_typing(&key, &sender.id, &pairing.receiver_id);
            ServerEvent::UserTyping {
                conversation_id: key.to_string(),
                user_id: sender.id.clone(),
                user_name: sender.name.clone(),
            }
        } else {
            if !self.typing.stop_typing(&key, &sender.id) {
                return Ok(());
            }
            ServerEvent::UserStoppedTyping {
                conversation_id: key.to_string(),
                user_id: sender.id.clone(),
            }
        };

        self.deliver_to_side(&pairing.receiver_id, opposite(sender.role), &event);
        Ok(())
    }

    async fn handle_mark_read(
        &self,
        reader: &Participant,
        message_ids: &[i64],
        conversation_id: &str,
    ) -> ChatResult<()> {
        let key = ConversationKey::parse(conversation_id)?;
        let (a, b) = key.participants();
        if reader.id != a && reader.id != b {
            return Err(ChatError::Forbidden(
                "reader is not a participant of this conversation".into(),
            ));
        }

        let flipped = with_retries(self.store_retries, || {
            self.store.mark_read(message_ids, &key, &reader.id)
        })
        .await?;
        self.publish_read_receipts(&key, reader, &flipped);
        Ok(())
    }

    async fn handle_delete(
        &self,
        conn_id: ConnectionId,
        requester: &Participant,
        message_id: i64,
    ) -> ChatResult<()> {
        let deletion = with_retries(self.store_retries, || {
            self.store.delete_message(message_id, &requester.id)
        })
        .await?;

        let key = &deletion.conversation_key;
        self.sessions.deliver_to_connection(
            conn_id,
            ServerEvent::DeleteMessageSuccess {
                conversation_id: key.to_string(),
                message_id,
            },
        );

        let event = ServerEvent::MessageDeleted {
            conversation_id: key.to_string(),
            message_id,
        };
        self.deliver_to_side(&deletion.sender_id, requester.role, &event);
        self.deliver_to_side(&deletion.receiver_id, opposite(requester.role), &event);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn nack(&self, conn_id: ConnectionId, err: &ChatError) {
        self.sessions.deliver_to_connection(
            conn_id,
            ServerEvent::Error {
                code: err.error_name().to_string(),
                message: err.to_string(),
            },
        );
    }

    /// Business-side events go through the business room; everything else
    /// through the participant index.
    fn deliver_to_side(&self, participant_id: &str, role: Role, event: &ServerEvent) -> usize {
        match role {
            Role::Business => self.sessions.deliver_to_business(participant_id, event),
            Role::Customer => self.sessions.deliver_to_participant(participant_id, event),
        }
    }

}

/// Retry transient store failures a bounded number of times before
/// surfacing. Non-transient errors surface immediately.
async fn with_retries<T, F, Fut>(retries: u32, mut op: F) -> ChatResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChatResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                plog_debug!("transient store failure, retry {attempt}: {err}");
                tokio::time::sleep(Duration::from_millis(25 * attempt as u64)).await;
            }
            other => return other,
        }
    }
}

struct Pairing {
    customer_id: String,
    business_id: String,
    /// The counterpart the event is addressed to.
    receiver_id: String,
}

/// Derive the (customer, business) pairing from the authenticated sender's
/// role and the event payload. The sender's own side always comes from the
/// credential, never from payload fields.
fn resolve_pairing(
    sender: &Participant,
    receiver_id: &str,
    business_id: &str,
) -> ChatResult<Pairing> {
    match sender.role {
        Role::Customer => {
            if business_id.is_empty() {
                return Err(ChatError::Validation("businessId is required".into()));
            }
            Ok(Pairing {
                customer_id: sender.id.clone(),
                business_id: business_id.to_string(),
                receiver_id: business_id.to_string(),
            })
        }
        Role::Business => {
            if receiver_id.is_empty() {
                return Err(ChatError::Validation("receiverId is required".into()));
            }
            Ok(Pairing {
                customer_id: receiver_id.to_string(),
                business_id: sender.id.clone(),
                receiver_id: receiver_id.to_string(),
            })
        }
    }
}

fn opposite(role: Role) -> Role {
    match role {
        Role::Customer => Role::Business,
        Role::Business => Role::Customer,
    }
}
