//! A2A (Agent-to-Agent) protocol support for Sage
//!
//! Implements the wire contract spoken between the host orchestrator and
//! remote agents: unary task submission, server-streamed incremental results,
//! out-of-band cancellation, caller input supply, and push-notification
//! registration.

pub mod client;
pub mod protocol;

pub use client::{
    A2aClient, AgentTransport, SessionEvent, SessionHandle, TransportConfig, TransportError,
};
pub use protocol::{
    AgentCard, AuthConfig, CancelRequest, ChunkFrame, ErrorResponse, PushRegistration,
    StreamChunk, TaskRequest,
};
