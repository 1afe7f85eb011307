//! Session hierarchy models and the persistence boundary.

pub mod models;
pub mod store;

pub use models::{
    DecisionLogEntry, Deliverable, Session, SessionStatus, StoredMessage, StoredQuestion,
    new_session_id,
};
pub use store::{MemoryStore, SessionStore};
