//! Task lifecycle types
//!
//! A `Task` is the central stateful entity: one caller intent, fanned out to
//! one or more remote agents, with per-agent partial results and a monotonic
//! state machine. Tasks are owned by the task manager; everything external
//! sees cloned snapshots.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sage_a2a::StreamChunk;

/// A structured request produced by the upstream interpreter. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub capability: String,
    #[serde(default)]
    pub payload: Value,
    pub correlation_id: String,
}

impl Intent {
    pub fn new(capability: &str, payload: Value) -> Self {
        Self {
            capability: capability.to_string(),
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Task lifecycle state.
///
/// `Created → Submitted → Working ⇄ InputRequired → Completed | Failed |
/// Canceled`. Terminal states absorb every later event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Created, Submitted) => true,
            (Created, Canceled) => true,
            (Submitted, Working | Failed | Canceled) => true,
            (Working, InputRequired | Completed | Failed | Canceled) => true,
            (InputRequired, Working | Completed | Failed | Canceled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Submitted => write!(f, "submitted"),
            Self::Working => write!(f, "working"),
            Self::InputRequired => write!(f, "input_required"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// The latest accumulated output of one agent's session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResult {
    /// Merged payload of every applied chunk.
    pub payload: Value,
    /// Highest applied sequence number; the next expected is this plus one.
    pub last_sequence: u64,
    /// The agent reported a final chunk.
    pub final_received: bool,
    /// The agent's session failed (transport error or error result).
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The agent is paused waiting for caller input.
    pub awaiting_input: bool,
}

impl AgentResult {
    /// A settled agent will produce no further output.
    pub fn is_settled(&self) -> bool {
        self.final_received || self.failed
    }

    pub fn is_success(&self) -> bool {
        self.final_received && !self.failed
    }
}

/// Outcome of applying one stream chunk to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Applied { is_final: bool },
    /// Out-of-order or duplicate sequence number; the chunk was dropped.
    UnexpectedSequence { expected: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub intent: Intent,
    /// Router selection, insertion order is dispatch priority.
    pub assigned_agents: Vec<String>,
    pub state: TaskState,
    pub results: HashMap<String, AgentResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

impl Task {
    pub fn new(intent: Intent, assigned_agents: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            intent,
            assigned_agents,
            state: TaskState::Created,
            results: HashMap::new(),
            created_at: now,
            updated_at: now,
            cancel_requested: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move to `next` if the state machine allows it. Illegal transitions
    /// leave the task untouched and return false.
    pub fn transition(&mut self, next: TaskState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.touch();
        true
    }

    /// Apply one chunk: validate the sequence number is the expected next
    /// value for this agent, merge the payload, record final/error flags.
    pub fn apply_chunk(&mut self, chunk: &StreamChunk) -> ChunkOutcome {
        let result = self.results.entry(chunk.agent_id.clone()).or_default();
        let expected = result.last_sequence + 1;
        if chunk.sequence_number != expected {
            return ChunkOutcome::UnexpectedSequence { expected };
        }

        result.last_sequence = chunk.sequence_number;
        merge_payload(&mut result.payload, &chunk.payload);
        result.awaiting_input = chunk.input_required;
        if let Some(err) = &chunk.error {
            result.failed = true;
            result.error = Some(err.clone());
        }
        if chunk.is_final {
            result.final_received = true;
        }
        self.touch();
        ChunkOutcome::Applied {
            is_final: chunk.is_final,
        }
    }

    /// Record a session-level failure for one agent.
    pub fn record_agent_failure(&mut self, agent_id: &str, error: String) {
        let result = self.results.entry(agent_id.to_string()).or_default();
        result.failed = true;
        result.error = Some(error);
        self.touch();
    }

    /// Every assigned agent has either finished or failed.
    pub fn all_agents_settled(&self) -> bool {
        self.assigned_agents
            .iter()
            .all(|a| self.results.get(a).is_some_and(|r| r.is_settled()))
    }

    pub fn any_agent_succeeded(&self) -> bool {
        self.results.values().any(|r| r.is_success())
    }

    /// The most recent successfully finished agent, if any. Surfaced with
    /// `Failed` tasks so callers can see partial fan-out progress.
    pub fn last_successful_agent(&self) -> Option<&str> {
        self.assigned_agents
            .iter()
            .rev()
            .find(|a| self.results.get(*a).is_some_and(|r| r.is_success()))
            .map(|s| s.as_str())
    }
}

/// Merge an incoming chunk payload into the accumulated one: text appends,
/// arrays extend, anything else replaces.
fn merge_payload(existing: &mut Value, incoming: &Value) {
    match (existing, incoming) {
        (_, Value::Null) => {}
        (Value::String(acc), Value::String(new)) => acc.push_str(new),
        (Value::Array(acc), Value::Array(new)) => acc.extend(new.iter().cloned()),
        (slot, new) => *slot = new.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(agent_id: &str, seq: u64, payload: Value, is_final: bool) -> StreamChunk {
        StreamChunk {
            task_id: "t-1".to_string(),
            agent_id: agent_id.to_string(),
            sequence_number: seq,
            payload,
            is_final,
            error: None,
            input_required: false,
        }
    }

    fn working_task() -> Task {
        let mut task = Task::new(
            Intent::new("parse", json!({"doc": "x"})),
            vec!["agent-a".to_string()],
        );
        assert!(task.transition(TaskState::Submitted));
        assert!(task.transition(TaskState::Working));
        task
    }

    #[test]
    fn test_state_machine_valid_path() {
        let mut task = Task::new(Intent::new("parse", Value::Null), vec![]);
        assert_eq!(task.state, TaskState::Created);
        assert!(task.transition(TaskState::Submitted));
        assert!(task.transition(TaskState::Working));
        assert!(task.transition(TaskState::InputRequired));
        assert!(task.transition(TaskState::Working));
        assert!(task.transition(TaskState::Completed));
        assert!(task.is_terminal());
    }

    #[test]
    fn test_state_machine_rejects_skips() {
        let mut task = Task::new(Intent::new("parse", Value::Null), vec![]);
        assert!(!task.transition(TaskState::Working));
        assert!(!task.transition(TaskState::Completed));
        assert_eq!(task.state, TaskState::Created);
    }

    #[test]
    fn test_input_required_only_reachable_from_working() {
        let mut task = Task::new(Intent::new("parse", Value::Null), vec![]);
        task.transition(TaskState::Submitted);
        assert!(!task.transition(TaskState::InputRequired));
        assert_eq!(task.state, TaskState::Submitted);

        assert!(task.transition(TaskState::Working));
        assert!(task.transition(TaskState::InputRequired));
    }

    #[test]
    fn test_terminal_states_absorb() {
        let mut task = working_task();
        assert!(task.transition(TaskState::Completed));
        assert!(!task.transition(TaskState::Working));
        assert!(!task.transition(TaskState::Canceled));
        assert_eq!(task.state, TaskState::Completed);
    }

    #[test]
    fn test_apply_chunk_in_order() {
        let mut task = working_task();
        let outcome = task.apply_chunk(&chunk("agent-a", 1, json!("par"), false));
        assert_eq!(outcome, ChunkOutcome::Applied { is_final: false });
        let outcome = task.apply_chunk(&chunk("agent-a", 2, json!("tial"), true));
        assert_eq!(outcome, ChunkOutcome::Applied { is_final: true });

        let result = &task.results["agent-a"];
        assert_eq!(result.payload, json!("partial"));
        assert_eq!(result.last_sequence, 2);
        assert!(result.is_success());
    }

    #[test]
    fn test_apply_chunk_duplicate_dropped() {
        let mut task = working_task();
        task.apply_chunk(&chunk("agent-a", 1, json!("a"), false));
        let outcome = task.apply_chunk(&chunk("agent-a", 1, json!("a"), false));
        assert_eq!(outcome, ChunkOutcome::UnexpectedSequence { expected: 2 });
        assert_eq!(task.results["agent-a"].payload, json!("a"));
    }

    #[test]
    fn test_apply_chunk_gap_dropped() {
        let mut task = working_task();
        task.apply_chunk(&chunk("agent-a", 1, json!("a"), false));
        let outcome = task.apply_chunk(&chunk("agent-a", 3, json!("c"), true));
        assert_eq!(outcome, ChunkOutcome::UnexpectedSequence { expected: 2 });
        assert!(!task.results["agent-a"].final_received);
    }

    #[test]
    fn test_apply_chunk_error_marks_failed() {
        let mut task = working_task();
        let mut failing = chunk("agent-a", 1, Value::Null, true);
        failing.error = Some("unsupported payload".to_string());
        task.apply_chunk(&failing);

        let result = &task.results["agent-a"];
        assert!(result.failed);
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("unsupported payload"));
    }

    #[test]
    fn test_merge_payload_arrays_extend() {
        let mut task = working_task();
        task.apply_chunk(&chunk("agent-a", 1, json!([1, 2]), false));
        task.apply_chunk(&chunk("agent-a", 2, json!([3]), true));
        assert_eq!(task.results["agent-a"].payload, json!([1, 2, 3]));
    }

    #[test]
    fn test_merge_payload_object_replaces() {
        let mut task = working_task();
        task.apply_chunk(&chunk("agent-a", 1, json!({"rows": 1}), false));
        task.apply_chunk(&chunk("agent-a", 2, json!({"rows": 7}), true));
        assert_eq!(task.results["agent-a"].payload, json!({"rows": 7}));
    }

    #[test]
    fn test_merge_payload_null_keeps_existing() {
        let mut task = working_task();
        task.apply_chunk(&chunk("agent-a", 1, json!("kept"), false));
        task.apply_chunk(&chunk("agent-a", 2, Value::Null, true));
        assert_eq!(task.results["agent-a"].payload, json!("kept"));
    }

    #[test]
    fn test_settlement_fan_out() {
        let mut task = Task::new(
            Intent::new("search", Value::Null),
            vec!["a1".to_string(), "a2".to_string()],
        );
        task.transition(TaskState::Submitted);
        task.transition(TaskState::Working);

        task.record_agent_failure("a1", "rejected".to_string());
        assert!(!task.all_agents_settled());

        task.apply_chunk(&chunk("a2", 1, json!("done"), true));
        assert!(task.all_agents_settled());
        assert!(task.any_agent_succeeded());
        assert_eq!(task.last_successful_agent(), Some("a2"));
    }

    #[test]
    fn test_task_snapshot_serializes() {
        let task = working_task();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["state"], "working");
        assert_eq!(json["intent"]["capability"], "parse");
    }

    #[test]
    fn test_task_state_display() {
        assert_eq!(TaskState::InputRequired.to_string(), "input_required");
        assert_eq!(TaskState::Canceled.to_string(), "canceled");
    }
}
