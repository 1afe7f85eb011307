//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use troupe_protocol::worker::Usage;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// A worker is running a turn for this session.
    Working,
    /// The last turn finished; the session is waiting for input.
    Waiting,
    /// The session handed its deliverable to its parent.
    Delivered,
    /// The session escalated and is blocked on a decision.
    Blocked,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Working => write!(f, "working"),
            SessionStatus::Waiting => write!(f, "waiting"),
            SessionStatus::Delivered => write!(f, "delivered"),
            SessionStatus::Blocked => write!(f, "blocked"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "working" => Ok(SessionStatus::Working),
            "waiting" => Ok(SessionStatus::Waiting),
            "delivered" => Ok(SessionStatus::Delivered),
            "blocked" => Ok(SessionStatus::Blocked),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// One node in the session hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID.
    pub id: String,
    /// Parent session ID (None for a root session).
    pub parent_id: Option<String>,
    /// Root of this session's hierarchy (self for a root session).
    pub root_id: String,
    /// 0 at root; always `parent.depth + 1` for a child.
    pub depth: u32,
    /// Human-readable title.
    pub title: String,
    /// Role within the hierarchy (e.g. "tester", "reviewer").
    pub role: String,
    /// Task description the session works on.
    pub task: String,
    /// Current status.
    pub status: SessionStatus,
    /// Backing-runtime session token, set once the worker reports it.
    /// Used to resume the runtime conversation on the next turn.
    pub runtime_session_id: Option<String>,
    /// Accumulated token/cost usage across turns.
    pub usage: Usage,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new root session.
    pub fn new_root(title: impl Into<String>, task: impl Into<String>) -> Self {
        let id = new_session_id();
        let now = Utc::now();
        Self {
            id: id.clone(),
            parent_id: None,
            root_id: id,
            depth: 0,
            title: title.into(),
            role: "root".to_string(),
            task: task.into(),
            status: SessionStatus::Waiting,
            runtime_session_id: None,
            usage: Usage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a child of `parent`. Depth and root derivation are fixed here
    /// so every construction path preserves the hierarchy invariants.
    pub fn child_of(
        parent: &Session,
        title: impl Into<String>,
        role: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_session_id(),
            parent_id: Some(parent.id.clone()),
            root_id: parent.root_id.clone(),
            depth: parent.depth + 1,
            title: title.into(),
            role: role.into(),
            task: task.into(),
            status: SessionStatus::Working,
            runtime_session_id: None,
            usage: Usage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this session sits at the top of its hierarchy.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Generate a session ID.
pub fn new_session_id() -> String {
    format!("ses_{}", uuid::Uuid::new_v4().simple())
}

/// A message in a session's conversation, as the orchestrator persists it.
///
/// The orchestrator only writes these for cross-session injection (a child's
/// deliverable summarized into the parent's conversation); regular turn
/// content is persisted by the storage layer outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    /// "assistant" or "user".
    pub role: String,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only decision log entry, scoped to a hierarchy root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub id: String,
    pub root_id: String,
    pub decision: String,
    pub category: String,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

/// A child session's recorded final output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deliverable {
    pub session_id: String,
    pub deliverable_type: String,
    pub summary: String,
    pub content: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A pending user question persisted for durability.
///
/// Questions survive a full client restart; permission requests do not need
/// this because their subprocess would need re-spawning anyway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredQuestion {
    pub request_id: String,
    pub session_id: String,
    pub questions: Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_roundtrip() {
        for status in [
            SessionStatus::Working,
            SessionStatus::Waiting,
            SessionStatus::Delivered,
            SessionStatus::Blocked,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_root_session_is_its_own_root() {
        let root = Session::new_root("Main", "build the thing");
        assert!(root.is_root());
        assert_eq!(root.root_id, root.id);
        assert_eq!(root.depth, 0);
    }

    #[test]
    fn test_child_depth_and_root_derivation() {
        let root = Session::new_root("Main", "build the thing");
        let child = Session::child_of(&root, "Tests", "tester", "write tests");
        let grandchild = Session::child_of(&child, "Fixtures", "helper", "make fixtures");

        assert_eq!(child.depth, root.depth + 1);
        assert_eq!(grandchild.depth, child.depth + 1);
        assert_eq!(child.root_id, root.id);
        assert_eq!(grandchild.root_id, root.id);
        assert_eq!(grandchild.parent_id.as_deref(), Some(child.id.as_str()));
    }
}
