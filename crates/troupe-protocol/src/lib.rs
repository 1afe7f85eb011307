//! Canonical protocol types for troupe.
//!
//! Two protocols live here:
//!
//! - **Worker protocol** ([`worker`]): newline-delimited JSON between the
//!   orchestrator and one worker subprocess per session, over the worker's
//!   stdin/stdout. Every coordination request carries a `request_id` that is
//!   answered by exactly one response message.
//! - **Client protocol** ([`client`]): JSON messages between a UI client and
//!   the orchestrator over a WebSocket connection.
//!
//! The [`codec`] module provides the newline framing used by the worker
//! protocol: a byte-stream splitter that buffers partial trailing lines and
//! treats undecodable lines as recoverable skips.

pub mod client;
pub mod codec;
pub mod worker;

pub use client::{ClientCommand, ClientEvent};
pub use codec::{DecodeError, LineDecoder};
pub use worker::{MessagePayload, OrchestratorMessage, PermissionMode, Usage, WorkerMessage};
