//! Ephemeral typing state, auto-expiring.
//!
//! Entries are never persisted and never required to be explicitly stopped:
//! a client that disconnects or goes silent is healed by the sweep, so a
//! stale "typing..." indicator cannot outlive its deadline plus one sweep
//! interval.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::store::ConversationKey;

#[derive(Debug, Clone)]
struct TypingState {
    peer_id: String,
    deadline: Instant,
}

/// A typing entry that expired (or was cleared on disconnect) without an
/// explicit stop; the gateway turns these into synthetic stopped-typing
/// notifications.
#[derive(Debug, Clone)]
pub struct TypingExpiry {
    pub conversation_key: ConversationKey,
    pub participant_id: String,
    pub peer_id: String,
}

/// Tracks "participant X is composing in conversation Y" with a forward
/// deadline. At most one entry per (conversation, participant); a repeated
/// start refreshes the deadline in place.
pub struct TypingTracker {
    deadline: Duration,
    entries: DashMap<(String, String), TypingState>,
}

impl TypingTracker {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            entries: DashMap::new(),
        }
    }

    /// Insert or refresh the entry for (conversation, participant).
    pub fn start_typing(&self, key: &ConversationKey, participant_id: &str, peer_id: &str) {
        self.entries.insert(
            (key.as_str().to_string(), participant_id.to_string()),
            TypingState {
                peer_id: peer_id.to_string(),
                deadline: Instant::now() + self.deadline,
            },
        );
    }

    /// Remove the entry immediately. Returns whether one existed.
    pub fn stop_typing(&self, key: &ConversationKey, participant_id: &str) -> bool {
        self.entries
            .remove(&(key.as_str().to_string(), participant_id.to_string()))
            .is_some()
    }

    /// Clear every entry owned by a participant (connection loss). Returns
    /// the cleared entries so stopped-typing notifications can still go out.
    pub fn clear_participant(&self, participant_id: &str) -> Vec<TypingExpiry> {
        let stale: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().1 == participant_id)
            .map(|e| e.key().clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .map(|((conv, participant), state)| TypingExpiry {
                conversation_key: ConversationKey::parse(&conv)
                    .expect("tracked keys are well-formed"),
                participant_id: participant,
                peer_id: state.peer_id,
            })
            .collect()
    }

    /// Evict every entry past its deadline, returning the evictions.
    pub fn sweep(&self) -> Vec<TypingExpiry> {
        let now = Instant::now();
        let expired: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| e.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .map(|((conv, participant), state)| TypingExpiry {
                conversation_key: ConversationKey::parse(&conv)
                    .expect("tracked keys are well-formed"),
                participant_id: participant,
                peer_id: state.peer_id,
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }
}
