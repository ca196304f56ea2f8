//! Remote agent registry
//!
//! Holds the known remote agents and their advertised capabilities. Writes
//! (registration, status updates) take the write lock; lookups clone a
//! consistent snapshot so routing never observes a half-updated entry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use sage_a2a::AgentCard;

use crate::error::OrchestrateError;

/// Liveness status, fed by an external health prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Up,
    Down,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A registered remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAgent {
    pub agent_id: String,
    pub endpoint: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    /// Static routing priority, higher ranks first under `StaticPriority`.
    #[serde(default)]
    pub priority: u32,
    /// Last successful task completion, used by `RecentSuccess` ranking.
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl RemoteAgent {
    pub fn new(agent_id: &str, endpoint: &str, capabilities: Vec<String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            endpoint: endpoint.to_string(),
            capabilities,
            status: AgentStatus::Up,
            priority: 0,
            last_success: None,
            registered_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Build a registry entry from a fetched agent card.
    pub fn from_card(card: &AgentCard) -> Self {
        Self::new(&card.name, &card.url, card.capabilities.clone())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// How `find_by_capability` orders candidates. Both policies are total
/// orders (agent id breaks ties), so routing is reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingPolicy {
    #[default]
    StaticPriority,
    RecentSuccess,
}

/// Shared registry of remote agents. Read-mostly.
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, RemoteAgent>>>,
    ranking: RankingPolicy,
}

impl AgentRegistry {
    pub fn new(ranking: RankingPolicy) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            ranking,
        }
    }

    /// Register an agent. Re-registering the same id with the same endpoint
    /// refreshes capabilities and priority; a different endpoint is rejected.
    pub async fn register(&self, agent: RemoteAgent) -> Result<(), OrchestrateError> {
        if let Err(e) = url::Url::parse(&agent.endpoint) {
            return Err(OrchestrateError::InvalidEndpoint {
                endpoint: agent.endpoint,
                reason: e.to_string(),
            });
        }

        let mut agents = self.agents.write().await;
        match agents.get_mut(&agent.agent_id) {
            Some(existing) if existing.endpoint != agent.endpoint => {
                Err(OrchestrateError::DuplicateAgent {
                    agent_id: agent.agent_id,
                })
            }
            Some(existing) => {
                existing.capabilities = agent.capabilities;
                existing.priority = agent.priority;
                debug!("Re-registered agent '{}'", existing.agent_id);
                Ok(())
            }
            None => {
                info!(
                    "Registered agent '{}' at {} ({} capabilities)",
                    agent.agent_id,
                    agent.endpoint,
                    agent.capabilities.len()
                );
                agents.insert(agent.agent_id.clone(), agent);
                Ok(())
            }
        }
    }

    /// Remove an agent. Absent ids are fine.
    pub async fn deregister(&self, agent_id: &str) -> bool {
        let removed = self.agents.write().await.remove(agent_id).is_some();
        if removed {
            info!("Deregistered agent '{}'", agent_id);
        }
        removed
    }

    /// Apply a health signal. An absent id is observable but not an error.
    pub async fn update_status(&self, agent_id: &str, status: AgentStatus) {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(agent) => {
                if agent.status != status {
                    info!("Agent '{}' is now {}", agent_id, status);
                }
                agent.status = status;
            }
            None => warn!("Health signal for unknown agent '{}' ignored", agent_id),
        }
    }

    /// Record a successful task completion for ranking purposes.
    pub async fn record_success(&self, agent_id: &str) {
        if let Some(agent) = self.agents.write().await.get_mut(agent_id) {
            agent.last_success = Some(Utc::now());
        }
    }

    /// All UP agents advertising `capability`, ranked per policy. The result
    /// is a snapshot; no registry lock outlives this call.
    pub async fn find_by_capability(&self, capability: &str) -> Vec<RemoteAgent> {
        let agents = self.agents.read().await;
        let mut matches: Vec<RemoteAgent> = agents
            .values()
            .filter(|a| a.status == AgentStatus::Up && a.has_capability(capability))
            .cloned()
            .collect();
        drop(agents);

        match self.ranking {
            RankingPolicy::StaticPriority => {
                matches.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then_with(|| a.agent_id.cmp(&b.agent_id))
                });
            }
            RankingPolicy::RecentSuccess => {
                matches.sort_by(|a, b| {
                    b.last_success
                        .cmp(&a.last_success)
                        .then_with(|| a.agent_id.cmp(&b.agent_id))
                });
            }
        }
        matches
    }

    pub async fn get(&self, agent_id: &str) -> Option<RemoteAgent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<RemoteAgent> {
        let mut list: Vec<RemoteAgent> = self.agents.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RankingPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, caps: &[&str]) -> RemoteAgent {
        RemoteAgent::new(
            id,
            &format!("http://{}.local:8001", id),
            caps.iter().map(|c| c.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = AgentRegistry::default();
        registry.register(agent("parser", &["parse"])).await.unwrap();
        registry.register(agent("search", &["web_search"])).await.unwrap();

        assert_eq!(registry.count().await, 2);
        let found = registry.find_by_capability("parse").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id, "parser");
    }

    #[tokio::test]
    async fn test_register_idempotent_same_endpoint() {
        let registry = AgentRegistry::default();
        registry.register(agent("parser", &["parse"])).await.unwrap();
        registry
            .register(agent("parser", &["parse", "ocr"]))
            .await
            .unwrap();

        assert_eq!(registry.count().await, 1);
        let stored = registry.get("parser").await.unwrap();
        assert_eq!(stored.capabilities.len(), 2);
    }

    #[tokio::test]
    async fn test_register_duplicate_different_endpoint() {
        let registry = AgentRegistry::default();
        registry.register(agent("parser", &["parse"])).await.unwrap();

        let clash = RemoteAgent::new("parser", "http://other:9000", vec!["parse".to_string()]);
        let result = registry.register(clash).await;
        assert!(matches!(
            result,
            Err(OrchestrateError::DuplicateAgent { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_invalid_endpoint() {
        let registry = AgentRegistry::default();
        let bad = RemoteAgent::new("parser", "not a url", vec!["parse".to_string()]);
        assert!(matches!(
            registry.register(bad).await,
            Err(OrchestrateError::InvalidEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_down_agents_excluded() {
        let registry = AgentRegistry::default();
        registry.register(agent("parser", &["parse"])).await.unwrap();
        registry.update_status("parser", AgentStatus::Down).await;

        assert!(registry.find_by_capability("parse").await.is_empty());

        registry.update_status("parser", AgentStatus::Up).await;
        assert_eq!(registry.find_by_capability("parse").await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_status_unknown_agent_is_noop() {
        let registry = AgentRegistry::default();
        registry.update_status("ghost", AgentStatus::Down).await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_deregister_absent_is_fine() {
        let registry = AgentRegistry::default();
        assert!(!registry.deregister("ghost").await);

        registry.register(agent("parser", &["parse"])).await.unwrap();
        assert!(registry.deregister("parser").await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_static_priority_ranking_deterministic() {
        let registry = AgentRegistry::new(RankingPolicy::StaticPriority);
        registry
            .register(agent("beta", &["parse"]).with_priority(5))
            .await
            .unwrap();
        registry
            .register(agent("alpha", &["parse"]).with_priority(5))
            .await
            .unwrap();
        registry
            .register(agent("gamma", &["parse"]).with_priority(9))
            .await
            .unwrap();

        for _ in 0..3 {
            let ranked: Vec<String> = registry
                .find_by_capability("parse")
                .await
                .into_iter()
                .map(|a| a.agent_id)
                .collect();
            // Highest priority first, ties broken by id
            assert_eq!(ranked, vec!["gamma", "alpha", "beta"]);
        }
    }

    #[tokio::test]
    async fn test_recent_success_ranking() {
        let registry = AgentRegistry::new(RankingPolicy::RecentSuccess);
        registry.register(agent("alpha", &["parse"])).await.unwrap();
        registry.register(agent("beta", &["parse"])).await.unwrap();

        registry.record_success("beta").await;

        let ranked: Vec<String> = registry
            .find_by_capability("parse")
            .await
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        assert_eq!(ranked, vec!["beta", "alpha"]);
    }

    #[tokio::test]
    async fn test_from_card() {
        let card = AgentCard {
            name: "websearch".to_string(),
            description: "Web search agent".to_string(),
            url: "http://localhost:8003".to_string(),
            capabilities: vec!["web_search".to_string()],
            authentication: Default::default(),
        };
        let entry = RemoteAgent::from_card(&card);
        assert_eq!(entry.agent_id, "websearch");
        assert_eq!(entry.endpoint, "http://localhost:8003");
        assert_eq!(entry.status, AgentStatus::Up);
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let registry = AgentRegistry::default();
        registry.register(agent("zeta", &["a"])).await.unwrap();
        registry.register(agent("alpha", &["b"])).await.unwrap();
        let ids: Vec<String> = registry.list().await.into_iter().map(|a| a.agent_id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}
