//! Error taxonomy for the orchestration engine
//!
//! Routing and caller-usage errors surface synchronously; transport errors
//! are scoped to one session and recorded on the owning task. Nothing here is
//! fatal to the process.

use sage_a2a::TransportError;

use crate::task::TaskState;

#[derive(Debug, thiserror::Error)]
pub enum OrchestrateError {
    /// No UP agent advertises the requested capability.
    #[error("no capable agent for '{capability}'")]
    NoCapableAgent { capability: String },

    /// An agent with this id is already registered under a different endpoint.
    #[error("agent '{agent_id}' already registered with a different endpoint")]
    DuplicateAgent { agent_id: String },

    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("unknown task '{task_id}'")]
    UnknownTask { task_id: String },

    #[error("task '{task_id}' is already terminal ({state})")]
    AlreadyTerminal { task_id: String, state: TaskState },

    #[error("task '{task_id}' is {actual}, expected {expected}")]
    InvalidState {
        task_id: String,
        expected: TaskState,
        actual: TaskState,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestrateError::NoCapableAgent {
            capability: "translate".to_string(),
        };
        assert!(err.to_string().contains("translate"));

        let err = OrchestrateError::AlreadyTerminal {
            task_id: "t-1".to_string(),
            state: TaskState::Completed,
        };
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn test_transport_error_converts() {
        let transport = TransportError::Protocol {
            agent_id: "parser".to_string(),
            reason: "bad frame".to_string(),
        };
        let err: OrchestrateError = transport.into();
        assert!(matches!(err, OrchestrateError::Transport(_)));
    }
}
