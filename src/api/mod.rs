//! Synchronization API: the request/response surface for clients that are
//! offline, reconnecting, or loading history. Reads through the same
//! message store as the gateway with the same visibility rules, so the two
//! surfaces never diverge.

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::{ChatError, ChatResult};
use crate::gateway::protocol::MessagePayload;
use crate::identity::Participant;
use crate::pagination::PageInfo;
use crate::server::AppState;
use crate::store::{Conversation, ConversationKey, ConversationSummary};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{key}/messages", get(get_messages))
        .route("/api/conversations/{key}/read", post(mark_conversation_read))
        .route("/api/conversations/{key}", delete(delete_conversation))
        .route("/api/unread-count", get(unread_count))
        .route("/_health", get(health))
}

/// Pull the bearer credential out of the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

/// Extractor: the authenticated caller, resolved from the bearer credential
/// by the external identity collaborator. Every conversation-scoped endpoint
/// requires it.
pub struct Authed(pub Participant);

impl FromRequestParts<AppState> for Authed {
    type Rejection = ChatError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ChatError::Unauthorized("missing credential".into()))?;
        let participant = state
            .verifier
            .verify(&token)
            .ok_or_else(|| ChatError::Unauthorized("invalid credential".into()))?;
        Ok(Authed(participant))
    }
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    page: Option<u64>,
    #[serde(default)]
    per_page: Option<u64>,
}

#[derive(Serialize)]
pub struct MessagesPage {
    pub messages: Vec<MessagePayload>,
    pub page: PageInfo,
}

async fn list_conversations(
    State(state): State<AppState>,
    Authed(caller): Authed,
) -> ChatResult<Json<Vec<ConversationSummary>>> {
    let summaries = state.store.conversations_for(&caller.id).await?;
    Ok(Json(summaries))
}

async fn get_messages(
    State(state): State<AppState>,
    Authed(caller): Authed,
    Path(key): Path<String>,
    Query(query): Query<PageQuery>,
) -> ChatResult<Json<MessagesPage>> {
    let key = ConversationKey::parse(&key)?;
    visible_conversation(&state, &key, &caller).await?;

    let (messages, page) = state
        .store
        .list_messages(&key, query.page.unwrap_or(1), query.per_page.unwrap_or(50))
        .await?;

    Ok(Json(MessagesPage {
        messages: messages.into_iter().map(MessagePayload::from).collect(),
        page,
    }))
}

async fn unread_count(
    State(state): State<AppState>,
    Authed(caller): Authed,
) -> ChatResult<Json<serde_json::Value>> {
    let unread = state.store.unread_count_for(&caller.id).await?;
    Ok(Json(json!({ "unread": unread })))
}

async fn mark_conversation_read(
    State(state): State<AppState>,
    Authed(caller): Authed,
    Path(key): Path<String>,
) -> ChatResult<Json<serde_json::Value>> {
    let key = ConversationKey::parse(&key)?;
    visible_conversation(&state, &key, &caller).await?;

    let flipped = state.store.mark_conversation_read(&key, &caller.id).await?;
    // Connected senders get their read receipts immediately; everyone else
    // reconciles from the store.
    state.gateway.publish_read_receipts(&key, &caller, &flipped);

    Ok(Json(json!({ "updated": flipped.len() })))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Authed(caller): Authed,
    Path(key): Path<String>,
) -> ChatResult<StatusCode> {
    let key = ConversationKey::parse(&key)?;
    state.store.delete_conversation(&key, &caller.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health(State(state): State<AppState>) -> ChatResult<Json<serde_json::Value>> {
    state.store.ping().await?;
    Ok(Json(json!({
        "status": "ok",
        "sessions": state.gateway.sessions().stats(),
        "typing": state.gateway.typing().active_count(),
    })))
}

/// `Forbidden` for non-participants, `NotFound` for conversations the caller
/// has deleted on their side.
async fn visible_conversation(
    state: &AppState,
    key: &ConversationKey,
    caller: &Participant,
) -> ChatResult<Conversation> {
    let conv = state
        .store
        .conversation(key)
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("conversation {key}")))?;
    if !conv.is_participant(&caller.id) {
        return Err(ChatError::Forbidden(
            "caller is not a participant of this conversation".into(),
        ));
    }
    if conv.deleted_for(&caller.id) {
        return Err(ChatError::NotFound(format!("conversation {key}")));
    }
    Ok(conv)
}
