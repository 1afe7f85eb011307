//! WebSocket boundary between UI clients and the orchestrator.

pub mod handler;
pub mod hub;

pub use handler::{AppState, ws_handler};
pub use hub::{ConnectionId, WsHub};
