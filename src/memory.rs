//! Per-session conversation memory.
//!
//! Accumulates prior turns and explicitly added research context, keyed
//! strictly by session id — nothing leaks across sessions. Context is
//! append-only within a session; `clear_context` and `delete` are the only
//! shrinking operations. Sessions do not expire on their own.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{ConversationSession, ConversationTurn, ResearchResult};

/// How many recent turns are summarized into the synthesis context.
const CONTEXT_TURNS: usize = 6;

#[derive(Default)]
pub struct ConversationMemory {
    sessions: RwLock<HashMap<String, ConversationSession>>,
}

impl ConversationMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a new empty session and return its id.
    pub async fn create_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            id.clone(),
            ConversationSession {
                id: id.clone(),
                ..ConversationSession::default()
            },
        );
        id
    }

    /// Record one research turn. Creates the session when the id is new,
    /// so callers may bring their own ids.
    pub async fn append(&self, session_id: &str, query: &str, result: &ResearchResult) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ConversationSession {
                id: session_id.to_string(),
                ..ConversationSession::default()
            });
        session.turns.push(ConversationTurn {
            query: query.to_string(),
            synthesis: result.synthesis.clone(),
            asked_at: Utc::now(),
        });
    }

    /// Accumulated context for prompt injection: explicitly added context
    /// entries plus a compact summary of recent turns.
    pub async fn get_context(&self, session_id: &str) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let session = match sessions.get(session_id) {
            Some(s) => s,
            None => return Vec::new(),
        };

        let mut context = session.context.clone();
        let recent = session
            .turns
            .iter()
            .rev()
            .take(CONTEXT_TURNS)
            .collect::<Vec<_>>();
        for turn in recent.into_iter().rev() {
            let summary: String = turn.synthesis.chars().take(300).collect();
            context.push(format!("Earlier question: {}\nFinding: {}", turn.query, summary));
        }
        context
    }

    /// Append an explicit research-context note to a session.
    pub async fn add_context(&self, session_id: &str, entry: &str) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ConversationSession {
                id: session_id.to_string(),
                ..ConversationSession::default()
            });
        session.context.push(entry.to_string());
    }

    /// Drop the explicitly added context but keep the turn history.
    pub async fn clear_context(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.context.clear();
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<ConversationSession> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    /// Remove a session entirely.
    pub async fn delete(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(text: &str) -> ResearchResult {
        ResearchResult {
            query: "q".to_string(),
            synthesis: text.to_string(),
            sources: vec![],
            raw_model_output: text.to_string(),
            is_partial: false,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn turns_accumulate_within_a_session() {
        let memory = ConversationMemory::new();
        let id = memory.create_session().await;

        memory
            .append(&id, "eviction law in NJ", &result("NJ requires notice."))
            .await;
        memory
            .append(&id, "what about children?", &result("Familial status is protected."))
            .await;

        let session = memory.get(&id).await.unwrap();
        assert_eq!(session.turns.len(), 2);

        let context = memory.get_context(&id).await;
        assert_eq!(context.len(), 2);
        assert!(context[0].contains("eviction law in NJ"));
        assert!(context[1].contains("Familial status"));
    }

    #[tokio::test]
    async fn no_cross_session_leakage() {
        let memory = ConversationMemory::new();
        let a = memory.create_session().await;
        let b = memory.create_session().await;

        memory.append(&a, "question A", &result("answer A")).await;
        memory.add_context(&a, "note for A").await;

        assert!(memory.get_context(&b).await.is_empty());
        let b_session = memory.get(&b).await.unwrap();
        assert!(b_session.turns.is_empty());
    }

    #[tokio::test]
    async fn clear_context_keeps_turns() {
        let memory = ConversationMemory::new();
        let id = memory.create_session().await;

        memory.append(&id, "q", &result("a")).await;
        memory.add_context(&id, "pinned note").await;
        assert!(memory.clear_context(&id).await);

        let session = memory.get(&id).await.unwrap();
        assert!(session.context.is_empty());
        assert_eq!(session.turns.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let memory = ConversationMemory::new();
        let id = memory.create_session().await;
        assert!(memory.delete(&id).await);
        assert!(!memory.delete(&id).await);
        assert!(memory.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn unknown_session_has_empty_context() {
        let memory = ConversationMemory::new();
        assert!(memory.get_context("missing").await.is_empty());
    }
}
