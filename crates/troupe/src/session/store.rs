//! Session persistence interface.
//!
//! The orchestrator reads and writes session state only through the narrow
//! [`SessionStore`] trait; where the data actually lives is a deployment
//! concern. [`MemoryStore`] is the in-process implementation used by the
//! daemon and by tests.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use troupe_protocol::worker::Usage;

use super::models::{
    DecisionLogEntry, Deliverable, Session, SessionStatus, StoredMessage, StoredQuestion,
};

/// Narrow persistence interface for session state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Session>>;
    async fn children_of(&self, parent_id: &str) -> Result<Vec<Session>>;
    async fn set_status(&self, id: &str, status: SessionStatus) -> Result<()>;
    async fn set_runtime_session(&self, id: &str, token: &str) -> Result<()>;
    async fn add_usage(&self, id: &str, usage: &Usage) -> Result<()>;

    /// Append a message to a session's conversation (cross-session
    /// injection only; see [`StoredMessage`]).
    async fn append_message(&self, message: StoredMessage) -> Result<()>;
    async fn messages(&self, session_id: &str) -> Result<Vec<StoredMessage>>;

    async fn record_deliverable(&self, deliverable: Deliverable) -> Result<()>;
    async fn deliverables_for(&self, session_id: &str) -> Result<Vec<Deliverable>>;

    /// Append a decision, returning its assigned id.
    async fn log_decision(&self, entry: DecisionLogEntry) -> Result<String>;
    /// Most recent decisions for a hierarchy root, newest first.
    async fn recent_decisions(&self, root_id: &str, limit: usize) -> Result<Vec<DecisionLogEntry>>;

    // Question durability (questions must survive a client restart).
    async fn save_question(&self, question: StoredQuestion) -> Result<()>;
    async fn remove_question(&self, request_id: &str) -> Result<()>;
    async fn questions_for_session(&self, session_id: &str) -> Result<Vec<StoredQuestion>>;
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    messages: RwLock<HashMap<String, Vec<StoredMessage>>>,
    deliverables: RwLock<Vec<Deliverable>>,
    decisions: RwLock<Vec<DecisionLogEntry>>,
    questions: RwLock<HashMap<String, StoredQuestion>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            anyhow::bail!("session '{}' already exists", session.id);
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn children_of(&self, parent_id: &str) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn set_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("session '{}' not found", id))?;
        session.status = status;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn set_runtime_session(&self, id: &str, token: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("session '{}' not found", id))?;
        session.runtime_session_id = Some(token.to_string());
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn add_usage(&self, id: &str, usage: &Usage) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("session '{}' not found", id))?;
        session.usage.add(usage);
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn append_message(&self, message: StoredMessage) -> Result<()> {
        self.messages
            .write()
            .await
            .entry(message.session_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_deliverable(&self, deliverable: Deliverable) -> Result<()> {
        self.deliverables.write().await.push(deliverable);
        Ok(())
    }

    async fn deliverables_for(&self, session_id: &str) -> Result<Vec<Deliverable>> {
        Ok(self
            .deliverables
            .read()
            .await
            .iter()
            .filter(|d| d.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn log_decision(&self, entry: DecisionLogEntry) -> Result<String> {
        let id = entry.id.clone();
        self.decisions.write().await.push(entry);
        Ok(id)
    }

    async fn recent_decisions(&self, root_id: &str, limit: usize) -> Result<Vec<DecisionLogEntry>> {
        let decisions = self.decisions.read().await;
        Ok(decisions
            .iter()
            .rev()
            .filter(|d| d.root_id == root_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_question(&self, question: StoredQuestion) -> Result<()> {
        self.questions
            .write()
            .await
            .insert(question.request_id.clone(), question);
        Ok(())
    }

    async fn remove_question(&self, request_id: &str) -> Result<()> {
        self.questions.write().await.remove(request_id);
        Ok(())
    }

    async fn questions_for_session(&self, session_id: &str) -> Result<Vec<StoredQuestion>> {
        Ok(self
            .questions
            .read()
            .await
            .values()
            .filter(|q| q.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let store = MemoryStore::new();
        let session = Session::new_root("Main", "task");
        store.create(session.clone()).await.unwrap();
        assert!(store.create(session).await.is_err());
    }

    #[tokio::test]
    async fn test_children_of() {
        let store = MemoryStore::new();
        let root = Session::new_root("Main", "task");
        let a = Session::child_of(&root, "A", "tester", "t");
        let b = Session::child_of(&root, "B", "reviewer", "r");
        store.create(root.clone()).await.unwrap();
        store.create(a).await.unwrap();
        store.create(b).await.unwrap();

        let children = store.children_of(&root.id).await.unwrap();
        assert_eq!(children.len(), 2);
    }

    #[tokio::test]
    async fn test_usage_accumulates() {
        let store = MemoryStore::new();
        let root = Session::new_root("Main", "task");
        let id = root.id.clone();
        store.create(root).await.unwrap();

        let turn = Usage {
            input_tokens: 10,
            output_tokens: 5,
            cost_usd: 0.01,
        };
        store.add_usage(&id, &turn).await.unwrap();
        store.add_usage(&id, &turn).await.unwrap();

        let session = store.get(&id).await.unwrap().unwrap();
        assert_eq!(session.usage.input_tokens, 20);
        assert!((session.usage.cost_usd - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_recent_decisions_newest_first_scoped_to_root() {
        let store = MemoryStore::new();
        for (i, root) in [(0, "root-a"), (1, "root-a"), (2, "root-b"), (3, "root-a")] {
            store
                .log_decision(DecisionLogEntry {
                    id: format!("dec-{}", i),
                    root_id: root.to_string(),
                    decision: format!("decision {}", i),
                    category: "architecture".to_string(),
                    rationale: String::new(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let recent = store.recent_decisions("root-a", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "dec-3");
        assert_eq!(recent[1].id, "dec-1");
    }

    #[tokio::test]
    async fn test_question_lifecycle() {
        let store = MemoryStore::new();
        store
            .save_question(StoredQuestion {
                request_id: "req-1".to_string(),
                session_id: "ses_1".to_string(),
                questions: serde_json::json!(["which db?"]),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(store.questions_for_session("ses_1").await.unwrap().len(), 1);
        store.remove_question("req-1").await.unwrap();
        assert!(store.questions_for_session("ses_1").await.unwrap().is_empty());
    }
}
