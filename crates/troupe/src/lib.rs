//! Troupe orchestration library.
//!
//! Core components for the multi-agent session orchestration daemon: the
//! worker process supervisor, the WebSocket message router, the
//! multi-session coordinator, and the until-done continuation loop.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod supervisor;
pub mod ws;
