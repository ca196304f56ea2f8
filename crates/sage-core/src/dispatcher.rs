//! Callback dispatcher — asynchronous task-update delivery
//!
//! Subscribers register an HTTP endpoint (optionally filtered to one task)
//! and receive every task-update snapshot. Delivery is best-effort with
//! bounded exponential-backoff retries: the task's own state stays
//! authoritative, an exhausted retry budget only moves the subscription to
//! `Failed` and logs it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::OrchestrateError;
use crate::task::{AgentResult, Task, TaskState};

/// The JSON body posted to a subscriber on each task update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNotification {
    pub task_id: String,
    pub correlation_id: String,
    pub state: TaskState,
    pub results: HashMap<String, AgentResult>,
    pub timestamp: DateTime<Utc>,
}

impl PushNotification {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            correlation_id: task.intent.correlation_id.clone(),
            state: task.state,
            results: task.results.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

/// One registered subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub id: String,
    pub subscriber_endpoint: String,
    /// `None` subscribes to every task.
    pub task_id: Option<String>,
    pub delivery_state: DeliveryState,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
}

impl PushSubscription {
    fn matches(&self, task_id: &str) -> bool {
        self.task_id.as_deref().is_none_or(|t| t == task_id)
    }
}

/// Delivery seam; the HTTP implementation below is the production one.
#[async_trait]
pub trait PushDelivery: Send + Sync {
    async fn deliver(&self, endpoint: &str, notification: &PushNotification) -> Result<()>;
}

/// POSTs the notification JSON to the subscriber endpoint.
pub struct HttpPushDelivery {
    http: reqwest::Client,
}

impl HttpPushDelivery {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

impl Default for HttpPushDelivery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushDelivery for HttpPushDelivery {
    async fn deliver(&self, endpoint: &str, notification: &PushNotification) -> Result<()> {
        let resp = self.http.post(endpoint).json(notification).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("notification rejected: HTTP {}", resp.status()));
        }
        debug!(
            "Delivered {} update for task {} to {}",
            notification.state, notification.task_id, endpoint
        );
        Ok(())
    }
}

/// Fans task updates out to subscribers, retrying failed deliveries.
#[derive(Clone)]
pub struct CallbackDispatcher {
    delivery: Arc<dyn PushDelivery>,
    subscriptions: Arc<RwLock<Vec<PushSubscription>>>,
    max_attempts: u32,
    backoff_ms: u64,
}

impl CallbackDispatcher {
    pub fn new(delivery: Arc<dyn PushDelivery>, max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            delivery,
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            max_attempts,
            backoff_ms,
        }
    }

    /// Register a subscriber. `task_id = None` receives every task's updates.
    pub async fn subscribe(
        &self,
        task_id: Option<&str>,
        endpoint: &str,
    ) -> Result<String, OrchestrateError> {
        if let Err(e) = url::Url::parse(endpoint) {
            return Err(OrchestrateError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            });
        }

        let subscription = PushSubscription {
            id: uuid::Uuid::new_v4().to_string(),
            subscriber_endpoint: endpoint.to_string(),
            task_id: task_id.map(|t| t.to_string()),
            delivery_state: DeliveryState::Pending,
            attempt_count: 0,
            created_at: Utc::now(),
        };
        let id = subscription.id.clone();
        info!(
            "Push subscription {} registered for {} ({})",
            id,
            endpoint,
            task_id.unwrap_or("*")
        );
        self.subscriptions.write().await.push(subscription);
        Ok(id)
    }

    pub async fn subscription(&self, id: &str) -> Option<PushSubscription> {
        self.subscriptions
            .read()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Fire-and-forget fan-out of one task update.
    pub fn notify(&self, task: &Task) {
        let notification = PushNotification::from_task(task);
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(&notification).await;
        });
    }

    /// Deliver one update to every matching subscriber, retrying each with
    /// exponential backoff up to the attempt budget.
    pub async fn dispatch(&self, notification: &PushNotification) {
        let terminal = notification.state.is_terminal();
        let targets: Vec<(String, String)> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.delivery_state != DeliveryState::Failed)
            .filter(|s| s.matches(&notification.task_id))
            .map(|s| (s.id.clone(), s.subscriber_endpoint.clone()))
            .collect();

        for (sub_id, endpoint) in targets {
            self.deliver_with_retry(&sub_id, &endpoint, notification, terminal)
                .await;
        }
    }

    async fn deliver_with_retry(
        &self,
        sub_id: &str,
        endpoint: &str,
        notification: &PushNotification,
        terminal: bool,
    ) {
        for attempt in 0..self.max_attempts {
            match self.delivery.deliver(endpoint, notification).await {
                Ok(()) => {
                    let mut subs = self.subscriptions.write().await;
                    if terminal {
                        // Final delivery done; the subscription has served
                        // its purpose.
                        subs.retain(|s| s.id != sub_id);
                        debug!("Subscription {} completed and removed", sub_id);
                    } else if let Some(sub) = subs.iter_mut().find(|s| s.id == sub_id) {
                        sub.delivery_state = DeliveryState::Delivered;
                        sub.attempt_count = attempt + 1;
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        "Push delivery to {} failed (attempt {}/{}): {}",
                        endpoint,
                        attempt + 1,
                        self.max_attempts,
                        e
                    );
                    if let Some(sub) = self
                        .subscriptions
                        .write()
                        .await
                        .iter_mut()
                        .find(|s| s.id == sub_id)
                    {
                        sub.attempt_count = attempt + 1;
                    }
                    if attempt + 1 < self.max_attempts {
                        let backoff =
                            Duration::from_millis(self.backoff_ms << attempt.min(8));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        warn!(
            "Push delivery to {} exhausted {} attempts, marking subscription failed",
            endpoint, self.max_attempts
        );
        if let Some(sub) = self
            .subscriptions
            .write()
            .await
            .iter_mut()
            .find(|s| s.id == sub_id)
        {
            sub.delivery_state = DeliveryState::Failed;
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
