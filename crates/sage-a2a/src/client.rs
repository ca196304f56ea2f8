//! A2A transport client — opens streaming sessions against remote agents
//!
//! A session is one task submission to one remote agent. The response body is
//! a newline-delimited stream of [`ChunkFrame`]s which a spawned reader
//! validates for sequence monotonicity, stamps with the session identity, and
//! forwards to the task manager as [`SessionEvent`]s.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{
    AgentCard, CancelRequest, ChunkFrame, ErrorResponse, PushRegistration, StreamChunk,
    TaskRequest,
};

/// Transport-level failures, per session.
///
/// `Unreachable` is a network-level failure (retried with backoff before
/// surfacing); `Rejected` is a definitive protocol-level refusal from the
/// remote agent and is never retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("agent '{agent_id}' unreachable at {endpoint}: {reason}")]
    Unreachable {
        agent_id: String,
        endpoint: String,
        reason: String,
    },

    #[error("agent '{agent_id}' rejected the task: HTTP {status} — {body}")]
    Rejected {
        agent_id: String,
        status: u16,
        body: String,
    },

    #[error("protocol error from agent '{agent_id}': {reason}")]
    Protocol { agent_id: String, reason: String },
}

/// Transport tuning knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connect timeout per attempt, in seconds
    pub connect_timeout_secs: u64,
    /// Retries on network errors before a session open fails
    pub connect_retries: u32,
    /// Base backoff between connect retries, doubled per attempt
    pub connect_backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            connect_retries: 3,
            connect_backoff_ms: 250,
        }
    }
}

/// Handle to one open streaming session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub task_id: String,
    pub agent_id: String,
    pub endpoint: String,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(task_id: &str, agent_id: &str, endpoint: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            endpoint: endpoint.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Tear the session down locally; the reader task exits on next poll.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Events a session emits toward the task manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Chunk(StreamChunk),
    Failed {
        task_id: String,
        agent_id: String,
        error: TransportError,
    },
}

/// The seam between the task manager and the network.
///
/// The HTTP client below is the production implementation; tests drive the
/// manager with scripted in-memory transports.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Submit the task and start streaming chunks into `events`.
    async fn open_session(
        &self,
        endpoint: &str,
        agent_id: &str,
        request: TaskRequest,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<SessionHandle, TransportError>;

    /// Best-effort remote cancellation. The local token is tripped first, so
    /// the session is torn down locally even if the peer never answers.
    async fn cancel_session(
        &self,
        session: &SessionHandle,
        reason: &str,
    ) -> Result<(), TransportError>;

    /// Forward caller-supplied input to a paused session.
    async fn supply_input(
        &self,
        session: &SessionHandle,
        payload: Value,
    ) -> Result<(), TransportError>;

    /// Register a push callback with the remote agent for this session's task.
    async fn register_push(
        &self,
        session: &SessionHandle,
        callback_endpoint: &str,
    ) -> Result<(), TransportError>;
}

/// A2A client for communicating with remote agents
#[derive(Clone)]
pub struct A2aClient {
    http: Client,
    config: TransportConfig,
}

impl Default for A2aClient {
    fn default() -> Self {
        Self::new()
    }
}

impl A2aClient {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            http: Client::builder()
                .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
                .build()
                .expect("failed to build HTTP client"),
            config,
        }
    }

    /// Fetch an agent's capability card
    pub async fn fetch_agent_card(&self, base_url: &str) -> Result<AgentCard> {
        let url = format!("{}/.well-known/agent.json", base_url.trim_end_matches('/'));
        debug!("Fetching agent card from {}", url);

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to agent at {}", url))?;

        if !resp.status().is_success() {
            return Err(anyhow!("Agent card request failed: HTTP {}", resp.status()));
        }

        let card: AgentCard = resp.json().await.context("Failed to parse agent card")?;

        info!(
            "Fetched agent card: {} ({} capabilities)",
            card.name,
            card.capabilities.len()
        );
        Ok(card)
    }

    fn tasks_url(endpoint: &str) -> String {
        format!("{}/a2a/tasks", endpoint.trim_end_matches('/'))
    }

    fn task_url(endpoint: &str, task_id: &str, suffix: &str) -> String {
        format!(
            "{}/a2a/tasks/{}/{}",
            endpoint.trim_end_matches('/'),
            task_id,
            suffix
        )
    }
}

#[async_trait]
impl AgentTransport for A2aClient {
    async fn open_session(
        &self,
        endpoint: &str,
        agent_id: &str,
        request: TaskRequest,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<SessionHandle, TransportError> {
        let url = Self::tasks_url(endpoint);
        debug!("Opening session to {} for task {}", url, request.task_id);

        let mut attempt: u32 = 0;
        let resp = loop {
            match self.http.post(&url).json(&request).send().await {
                Ok(resp) => break resp,
                Err(e) => {
                    if attempt >= self.config.connect_retries {
                        return Err(TransportError::Unreachable {
                            agent_id: agent_id.to_string(),
                            endpoint: endpoint.to_string(),
                            reason: e.to_string(),
                        });
                    }
                    let backoff =
                        Duration::from_millis(self.config.connect_backoff_ms << attempt.min(8));
                    warn!(
                        "Connect to {} failed ({}), retrying in {:?}",
                        url, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = rejection_message(resp.text().await.unwrap_or_default());
            return Err(TransportError::Rejected {
                agent_id: agent_id.to_string(),
                status,
                body,
            });
        }

        let handle = SessionHandle::new(&request.task_id, agent_id, endpoint);

        info!(
            "Session open: task {} on agent '{}'",
            handle.task_id, handle.agent_id
        );
        tokio::spawn(read_stream(resp, handle.clone(), events));
        Ok(handle)
    }

    async fn cancel_session(
        &self,
        session: &SessionHandle,
        reason: &str,
    ) -> Result<(), TransportError> {
        // Local teardown is authoritative; the remote signal is advisory.
        session.close();

        let url = Self::task_url(&session.endpoint, &session.task_id, "cancel");
        let cancel = CancelRequest {
            task_id: session.task_id.clone(),
            reason: reason.to_string(),
        };

        let resp = self
            .http
            .post(&url)
            .json(&cancel)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                agent_id: session.agent_id.clone(),
                endpoint: session.endpoint.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(TransportError::Rejected {
                agent_id: session.agent_id.clone(),
                status: resp.status().as_u16(),
                body: rejection_message(resp.text().await.unwrap_or_default()),
            });
        }

        info!("Task {} cancelled on agent '{}'", session.task_id, session.agent_id);
        Ok(())
    }

    async fn supply_input(
        &self,
        session: &SessionHandle,
        payload: Value,
    ) -> Result<(), TransportError> {
        let url = Self::task_url(&session.endpoint, &session.task_id, "input");
        debug!("Forwarding input for task {} to {}", session.task_id, url);

        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                agent_id: session.agent_id.clone(),
                endpoint: session.endpoint.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(TransportError::Rejected {
                agent_id: session.agent_id.clone(),
                status: resp.status().as_u16(),
                body: rejection_message(resp.text().await.unwrap_or_default()),
            });
        }
        Ok(())
    }

    async fn register_push(
        &self,
        session: &SessionHandle,
        callback_endpoint: &str,
    ) -> Result<(), TransportError> {
        let url = Self::task_url(&session.endpoint, &session.task_id, "notifications");
        let registration = PushRegistration {
            task_id: session.task_id.clone(),
            callback_endpoint: callback_endpoint.to_string(),
        };

        let resp = self
            .http
            .post(&url)
            .json(&registration)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                agent_id: session.agent_id.clone(),
                endpoint: session.endpoint.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(TransportError::Rejected {
                agent_id: session.agent_id.clone(),
                status: resp.status().as_u16(),
                body: rejection_message(resp.text().await.unwrap_or_default()),
            });
        }

        info!(
            "Push callback {} registered for task {} on agent '{}'",
            callback_endpoint, session.task_id, session.agent_id
        );
        Ok(())
    }
}

/// Agents report rejections as an `ErrorResponse` body; fall back to the raw
/// text when the body is something else.
fn rejection_message(raw: String) -> String {
    serde_json::from_str::<ErrorResponse>(&raw)
        .map(|e| e.error)
        .unwrap_or(raw)
}

/// Read NDJSON chunk frames off the response body until the final frame, a
/// stream error, or local cancellation.
async fn read_stream(
    resp: reqwest::Response,
    handle: SessionHandle,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut body = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut last_seq: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = handle.cancel.cancelled() => {
                debug!(
                    "Session for task {} on '{}' closed locally",
                    handle.task_id, handle.agent_id
                );
                return;
            }
            next = body.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                buf.extend_from_slice(&bytes);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }

                    let frame: ChunkFrame = match serde_json::from_slice(line) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(
                                "Malformed frame from agent '{}' for task {}: {} — dropped",
                                handle.agent_id, handle.task_id, e
                            );
                            continue;
                        }
                    };

                    // Transport-level monotonicity check; the task manager
                    // re-validates the exact expected sequence.
                    if frame.sequence_number <= last_seq {
                        warn!(
                            "Non-increasing sequence {} (last {}) from agent '{}' for task {} — dropped",
                            frame.sequence_number, last_seq, handle.agent_id, handle.task_id
                        );
                        continue;
                    }
                    last_seq = frame.sequence_number;

                    let is_final = frame.is_final;
                    let chunk =
                        StreamChunk::from_frame(&handle.task_id, &handle.agent_id, frame);
                    if events.send(SessionEvent::Chunk(chunk)).await.is_err() {
                        return;
                    }
                    if is_final {
                        debug!(
                            "Final chunk received for task {} from agent '{}'",
                            handle.task_id, handle.agent_id
                        );
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(
                    "Stream error from agent '{}' for task {}: {}",
                    handle.agent_id, handle.task_id, e
                );
                let _ = events
                    .send(SessionEvent::Failed {
                        task_id: handle.task_id.clone(),
                        agent_id: handle.agent_id.clone(),
                        error: TransportError::Unreachable {
                            agent_id: handle.agent_id.clone(),
                            endpoint: handle.endpoint.clone(),
                            reason: e.to_string(),
                        },
                    })
                    .await;
                return;
            }
            None => {
                let _ = events
                    .send(SessionEvent::Failed {
                        task_id: handle.task_id.clone(),
                        agent_id: handle.agent_id.clone(),
                        error: TransportError::Protocol {
                            agent_id: handle.agent_id.clone(),
                            reason: "stream closed before final chunk".to_string(),
                        },
                    })
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_client() -> A2aClient {
        A2aClient::with_config(TransportConfig {
            connect_timeout_secs: 1,
            connect_retries: 0,
            connect_backoff_ms: 1,
        })
    }

    fn dead_session() -> SessionHandle {
        SessionHandle::new("task-1", "agent-a", "http://127.0.0.1:1")
    }

    #[test]
    fn test_client_creation() {
        let client = A2aClient::new();
        let _ = client.clone();
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.connect_retries, 3);
        assert_eq!(config.connect_backoff_ms, 250);
    }

    #[test]
    fn test_url_construction_trailing_slash() {
        assert_eq!(
            A2aClient::tasks_url("http://host:8001/"),
            "http://host:8001/a2a/tasks"
        );
        assert_eq!(
            A2aClient::task_url("http://host:8001/", "t-1", "cancel"),
            "http://host:8001/a2a/tasks/t-1/cancel"
        );
    }

    #[test]
    fn test_session_handle_close() {
        let session = dead_session();
        assert!(!session.is_closed());
        session.close();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_open_session_connection_refused() {
        let client = fast_client();
        let (tx, _rx) = mpsc::channel(8);
        let request = TaskRequest {
            task_id: "t-1".to_string(),
            capability: "parse".to_string(),
            payload: serde_json::json!({}),
        };
        let result = client
            .open_session("http://127.0.0.1:1", "agent-a", request, tx)
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_cancel_session_connection_refused_still_closes() {
        let client = fast_client();
        let session = dead_session();
        let result = client.cancel_session(&session, "caller requested").await;
        assert!(result.is_err());
        // Local teardown happens regardless of remote reachability
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_supply_input_connection_refused() {
        let client = fast_client();
        let session = dead_session();
        let result = client
            .supply_input(&session, serde_json::json!({"answer": 42}))
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_register_push_connection_refused() {
        let client = fast_client();
        let session = dead_session();
        let result = client
            .register_push(&session, "http://caller:9000/notify")
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_fetch_agent_card_connection_refused() {
        let client = fast_client();
        let result = client.fetch_agent_card("http://127.0.0.1:1").await;
        assert!(result.is_err());
    }

    #[test]
    fn test_rejection_message_decodes_error_body() {
        assert_eq!(
            rejection_message(r#"{"error":"unsupported capability"}"#.to_string()),
            "unsupported capability"
        );
        // Non-JSON rejection bodies pass through untouched
        assert_eq!(
            rejection_message("503 Service Unavailable".to_string()),
            "503 Service Unavailable"
        );
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Rejected {
            agent_id: "parser".to_string(),
            status: 422,
            body: "unsupported payload".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("parser"));
        assert!(msg.contains("422"));
    }
}
