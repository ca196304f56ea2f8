//! A2A (Agent-to-Agent) protocol types
//!
//! The wire contract between the host orchestrator and remote agents:
//! a task request goes up, a newline-delimited stream of chunk frames comes
//! back, and cancellation / input / push registration travel out-of-band.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent Card — advertises capabilities at /.well-known/agent.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub authentication: AuthConfig,
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub schemes: Vec<String>,
}

/// Task submission request sent to a remote agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub capability: String,
    #[serde(default)]
    pub payload: Value,
}

/// One frame of a remote agent's streamed response.
///
/// The session already identifies the task and the agent, so the frame only
/// carries the sequence number and payload. `input_required` signals that the
/// agent is paused waiting for additional caller input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub sequence_number: u64,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub input_required: bool,
}

/// A chunk frame stamped with its session identity, as handed to the task
/// manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub task_id: String,
    pub agent_id: String,
    pub sequence_number: u64,
    pub payload: Value,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub input_required: bool,
}

impl StreamChunk {
    pub fn from_frame(task_id: &str, agent_id: &str, frame: ChunkFrame) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            sequence_number: frame.sequence_number,
            payload: frame.payload,
            is_final: frame.is_final,
            error: frame.error,
            input_required: frame.input_required,
        }
    }
}

/// Out-of-band cancellation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub task_id: String,
    pub reason: String,
}

/// Push-notification registration: if the primary stream is lost, the remote
/// agent delivers the final result to the callback endpoint instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRegistration {
    pub task_id: String,
    pub callback_endpoint: String,
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
