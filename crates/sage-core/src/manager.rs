//! Task manager — owns the task lifecycle
//!
//! `submit` routes an intent, creates the task, and opens one transport
//! session per selected agent without blocking the caller. Each task gets a
//! dedicated event pump, so chunk handling for one task is serialized (the
//! monotonic state machine holds under concurrent fan-out arrivals) while
//! unrelated tasks proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

use sage_a2a::{AgentTransport, SessionEvent, SessionHandle, StreamChunk, TaskRequest};

use crate::config::OrchestratorConfig;
use crate::dispatcher::CallbackDispatcher;
use crate::error::OrchestrateError;
use crate::registry::AgentRegistry;
use crate::router::CapabilityRouter;
use crate::task::{ChunkOutcome, Intent, Task, TaskState};

struct TaskEntry {
    task: Mutex<Task>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    watchers: broadcast::Sender<Task>,
}

struct ManagerInner {
    registry: Arc<AgentRegistry>,
    router: CapabilityRouter,
    transport: Arc<dyn AgentTransport>,
    dispatcher: CallbackDispatcher,
    config: OrchestratorConfig,
    tasks: RwLock<HashMap<String, Arc<TaskEntry>>>,
}

/// The orchestration engine. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    pub fn new(
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn AgentTransport>,
        dispatcher: CallbackDispatcher,
        config: OrchestratorConfig,
    ) -> Self {
        let router = CapabilityRouter::new(Arc::clone(&registry), config.routing_policy);
        let manager = Self {
            inner: Arc::new(ManagerInner {
                registry,
                router,
                transport,
                dispatcher,
                config,
                tasks: RwLock::new(HashMap::new()),
            }),
        };
        manager.spawn_sweeper();
        manager
    }

    /// Periodically drop terminal tasks past their retention window. Holds
    /// only a weak handle so the sweeper dies with the manager.
    fn spawn_sweeper(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = Duration::from_secs(self.inner.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                TaskManager { inner }.sweep_expired().await;
            }
        });
    }

    /// Route the intent and dispatch sessions. Returns as soon as the task is
    /// submitted; progress is observed via `watch`, `get_status`, or push
    /// subscriptions. Routing failure surfaces before any task exists.
    pub async fn submit(&self, intent: Intent) -> Result<String, OrchestrateError> {
        let assigned = self.inner.router.select(&intent).await?;

        let task = Task::new(intent, assigned.clone());
        let task_id = task.task_id.clone();
        info!(
            "Task {} created for capability '{}', assigned to {:?}",
            task_id, task.intent.capability, assigned
        );

        let (events_tx, mut events_rx) = mpsc::channel(self.inner.config.channel_capacity);
        let (watchers, _) = broadcast::channel(self.inner.config.channel_capacity);
        let entry = Arc::new(TaskEntry {
            task: Mutex::new(task),
            sessions: Mutex::new(HashMap::new()),
            watchers,
        });
        self.inner
            .tasks
            .write()
            .await
            .insert(task_id.clone(), Arc::clone(&entry));

        // Per-task event pump; exits once every session sender is gone.
        let pump = self.clone();
        let pump_entry = Arc::clone(&entry);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                pump.handle_event(&pump_entry, event).await;
            }
        });

        {
            let mut task = entry.task.lock().await;
            task.transition(TaskState::Submitted);
            self.publish(&entry, &task);
        }

        for agent_id in assigned {
            let manager = self.clone();
            let entry = Arc::clone(&entry);
            let events = events_tx.clone();
            tokio::spawn(async move {
                manager.open_agent_session(entry, agent_id, events).await;
            });
        }

        Ok(task_id)
    }

    /// Request cancellation: cooperative toward the remote agents, bounded by
    /// the grace timeout, authoritative locally once it expires.
    pub async fn cancel(&self, task_id: &str) -> Result<(), OrchestrateError> {
        let entry = self.entry(task_id).await?;
        {
            let mut task = entry.task.lock().await;
            if task.is_terminal() {
                return Err(OrchestrateError::AlreadyTerminal {
                    task_id: task_id.to_string(),
                    state: task.state,
                });
            }
            task.cancel_requested = true;
            task.touch();
            info!("Cancellation requested for task {}", task_id);
        }

        let handles: Vec<SessionHandle> = entry.sessions.lock().await.values().cloned().collect();
        let grace = Duration::from_millis(self.inner.config.cancel_grace_ms);
        let transport = Arc::clone(&self.inner.transport);
        let remote_cancel = async {
            for handle in &handles {
                if let Err(e) = transport.cancel_session(handle, "canceled by caller").await {
                    warn!(
                        "Remote cancel of task {} on '{}' failed: {} (best-effort)",
                        task_id, handle.agent_id, e
                    );
                }
            }
        };
        if tokio::time::timeout(grace, remote_cancel).await.is_err() {
            warn!(
                "Cancellation grace expired for task {}, forcing local teardown",
                task_id
            );
        }
        for handle in &handles {
            handle.close();
        }
        entry.sessions.lock().await.clear();

        let mut task = entry.task.lock().await;
        if !task.is_terminal() && task.transition(TaskState::Canceled) {
            info!("Task {} canceled", task_id);
            self.publish(&entry, &task);
        }
        Ok(())
    }

    /// Read-only snapshot of a task.
    pub async fn get_status(&self, task_id: &str) -> Result<Task, OrchestrateError> {
        let entry = self.entry(task_id).await?;
        let task = entry.task.lock().await;
        Ok(task.clone())
    }

    /// Live snapshot stream; ends with the terminal snapshot. Subscribing to
    /// an already-terminal task still yields that final snapshot.
    pub async fn watch(
        &self,
        task_id: &str,
    ) -> Result<broadcast::Receiver<Task>, OrchestrateError> {
        let entry = self.entry(task_id).await?;
        let receiver = entry.watchers.subscribe();
        let task = entry.task.lock().await;
        if task.is_terminal() {
            // Replay for the late subscriber; earlier watchers already
            // stopped at this snapshot.
            let _ = entry.watchers.send(task.clone());
        }
        Ok(receiver)
    }

    /// Forward caller input to the paused agent session(s) and resume.
    pub async fn supply_input(
        &self,
        task_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), OrchestrateError> {
        let entry = self.entry(task_id).await?;
        let awaiting: Vec<String> = {
            let task = entry.task.lock().await;
            if task.state != TaskState::InputRequired {
                return Err(OrchestrateError::InvalidState {
                    task_id: task_id.to_string(),
                    expected: TaskState::InputRequired,
                    actual: task.state,
                });
            }
            task.results
                .iter()
                .filter(|(_, r)| r.awaiting_input)
                .map(|(agent_id, _)| agent_id.clone())
                .collect()
        };

        let handles: Vec<SessionHandle> = {
            let sessions = entry.sessions.lock().await;
            awaiting.iter().filter_map(|a| sessions.get(a).cloned()).collect()
        };
        for handle in &handles {
            self.inner
                .transport
                .supply_input(handle, payload.clone())
                .await?;
        }

        let mut task = entry.task.lock().await;
        for agent_id in &awaiting {
            if let Some(result) = task.results.get_mut(agent_id) {
                result.awaiting_input = false;
            }
        }
        if task.transition(TaskState::Working) {
            info!("Task {} resumed with caller input", task_id);
            self.publish(&entry, &task);
        }
        Ok(())
    }

    /// Register a push subscriber for this task, and best-effort register the
    /// callback with every open remote session so a lost stream still ends in
    /// a delivered final result.
    pub async fn subscribe_push(
        &self,
        task_id: &str,
        endpoint: &str,
    ) -> Result<String, OrchestrateError> {
        let entry = self.entry(task_id).await?;
        let sub_id = self
            .inner
            .dispatcher
            .subscribe(Some(task_id), endpoint)
            .await?;

        {
            let task = entry.task.lock().await;
            if task.is_terminal() {
                // The terminal snapshot is the only update left; deliver it
                // now instead of leaving the subscription pending forever.
                self.inner.dispatcher.notify(&task);
                return Ok(sub_id);
            }
        }

        let handles: Vec<SessionHandle> = entry.sessions.lock().await.values().cloned().collect();
        for handle in handles {
            if let Err(e) = self.inner.transport.register_push(&handle, endpoint).await {
                warn!(
                    "Push registration with agent '{}' failed: {} (best-effort)",
                    handle.agent_id, e
                );
            }
        }
        Ok(sub_id)
    }

    pub async fn task_count(&self) -> usize {
        self.inner.tasks.read().await.len()
    }

    /// Drop terminal tasks whose last update is older than the retention
    /// window.
    pub async fn sweep_expired(&self) {
        let retention = chrono::Duration::seconds(self.inner.config.retention_secs as i64);
        let now = Utc::now();
        let mut tasks = self.inner.tasks.write().await;
        let mut expired = Vec::new();
        for (id, entry) in tasks.iter() {
            let task = entry.task.lock().await;
            if task.is_terminal() && now - task.updated_at > retention {
                expired.push(id.clone());
            }
        }
        for id in expired {
            tasks.remove(&id);
            debug!("Archived terminal task {}", id);
        }
    }

    async fn entry(&self, task_id: &str) -> Result<Arc<TaskEntry>, OrchestrateError> {
        self.inner
            .tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| OrchestrateError::UnknownTask {
                task_id: task_id.to_string(),
            })
    }

    async fn open_agent_session(
        &self,
        entry: Arc<TaskEntry>,
        agent_id: String,
        events: mpsc::Sender<SessionEvent>,
    ) {
        let (task_id, request) = {
            let task = entry.task.lock().await;
            (
                task.task_id.clone(),
                TaskRequest {
                    task_id: task.task_id.clone(),
                    capability: task.intent.capability.clone(),
                    payload: task.intent.payload.clone(),
                },
            )
        };

        let Some(agent) = self.inner.registry.get(&agent_id).await else {
            warn!(
                "Agent '{}' vanished before dispatch of task {}",
                agent_id, task_id
            );
            self.fail_agent(&entry, &agent_id, "agent deregistered before dispatch".to_string())
                .await;
            return;
        };

        match self
            .inner
            .transport
            .open_session(&agent.endpoint, &agent_id, request, events)
            .await
        {
            Ok(handle) => {
                entry.sessions.lock().await.insert(agent_id.clone(), handle);
                let mut close_after = false;
                {
                    let mut task = entry.task.lock().await;
                    if task.is_terminal() || task.cancel_requested {
                        close_after = true;
                    } else if task.state == TaskState::Submitted {
                        task.transition(TaskState::Working);
                        self.publish(&entry, &task);
                    }
                }
                if close_after {
                    if let Some(handle) = entry.sessions.lock().await.remove(&agent_id) {
                        handle.close();
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Session open for task {} on '{}' failed: {}",
                    task_id, agent_id, e
                );
                self.fail_agent(&entry, &agent_id, e.to_string()).await;
            }
        }
    }

    async fn handle_event(&self, entry: &Arc<TaskEntry>, event: SessionEvent) {
        match event {
            SessionEvent::Chunk(chunk) => self.handle_chunk(entry, chunk).await,
            SessionEvent::Failed {
                agent_id, error, ..
            } => self.fail_agent(entry, &agent_id, error.to_string()).await,
        }
    }

    async fn handle_chunk(&self, entry: &Arc<TaskEntry>, chunk: StreamChunk) {
        let mut finished_agent: Option<(String, bool)> = None;
        {
            let mut task = entry.task.lock().await;
            if task.is_terminal() {
                debug!(
                    "Late chunk seq {} for task {} from '{}' dropped",
                    chunk.sequence_number, task.task_id, chunk.agent_id
                );
                return;
            }

            match task.apply_chunk(&chunk) {
                ChunkOutcome::UnexpectedSequence { expected } => {
                    warn!(
                        "Sequence anomaly for task {} from '{}': got {}, expected {}, dropped",
                        task.task_id, chunk.agent_id, chunk.sequence_number, expected
                    );
                    return;
                }
                ChunkOutcome::Applied { is_final } => {
                    // A chunk can race the post-open Working transition
                    if task.state == TaskState::Submitted {
                        task.transition(TaskState::Working);
                    }
                    if chunk.input_required {
                        task.transition(TaskState::InputRequired);
                    }
                    if is_final {
                        let success = task
                            .results
                            .get(&chunk.agent_id)
                            .is_some_and(|r| r.is_success());
                        finished_agent = Some((chunk.agent_id.clone(), success));
                        self.settle_if_done(&mut task);
                    }
                    self.publish(entry, &task);
                }
            }
        }

        if let Some((agent_id, success)) = finished_agent {
            if success {
                self.inner.registry.record_success(&agent_id).await;
            }
            entry.sessions.lock().await.remove(&agent_id);
        }
    }

    async fn fail_agent(&self, entry: &Arc<TaskEntry>, agent_id: &str, error: String) {
        let mut task = entry.task.lock().await;
        if task.is_terminal() {
            debug!(
                "Late failure for task {} from '{}' dropped",
                task.task_id, agent_id
            );
            return;
        }
        task.record_agent_failure(agent_id, error);
        self.settle_if_done(&mut task);
        self.publish(entry, &task);
    }

    /// Once every assigned agent has settled, any single success completes
    /// the task (partial fan-out failures stay recorded per agent); only a
    /// full wipeout fails it.
    fn settle_if_done(&self, task: &mut Task) {
        if task.is_terminal() || !task.all_agents_settled() {
            return;
        }
        if task.any_agent_succeeded() {
            if task.transition(TaskState::Completed) {
                info!(
                    "Task {} completed ({} of {} agents succeeded)",
                    task.task_id,
                    task.results.values().filter(|r| r.is_success()).count(),
                    task.assigned_agents.len()
                );
            }
        } else if task.transition(TaskState::Failed) {
            let first_error = task
                .results
                .values()
                .filter_map(|r| r.error.as_deref())
                .next()
                .unwrap_or("unknown");
            warn!("Task {} failed: {}", task.task_id, first_error);
        }
    }

    fn publish(&self, entry: &TaskEntry, task: &Task) {
        let _ = entry.watchers.send(task.clone());
        self.inner.dispatcher.notify(task);
    }
}
