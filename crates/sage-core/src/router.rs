//! Capability routing
//!
//! Pure selection over a registry snapshot: no network I/O, no lock held
//! beyond the lookup itself.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::OrchestrateError;
use crate::registry::AgentRegistry;
use crate::task::Intent;

/// How many of the ranked candidates a task is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Dispatch to the first ranked agent only.
    #[default]
    SingleBest,
    /// Dispatch to every ranked agent; the task aggregates all responses.
    FanOutAll,
}

pub struct CapabilityRouter {
    registry: Arc<AgentRegistry>,
    policy: RoutingPolicy,
}

impl CapabilityRouter {
    pub fn new(registry: Arc<AgentRegistry>, policy: RoutingPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Select the agents for an intent, in dispatch-priority order.
    /// Deterministic for identical registry state and intent.
    pub async fn select(&self, intent: &Intent) -> Result<Vec<String>, OrchestrateError> {
        let ranked = self.registry.find_by_capability(&intent.capability).await;
        if ranked.is_empty() {
            return Err(OrchestrateError::NoCapableAgent {
                capability: intent.capability.clone(),
            });
        }

        let selected: Vec<String> = match self.policy {
            RoutingPolicy::SingleBest => vec![ranked[0].agent_id.clone()],
            RoutingPolicy::FanOutAll => ranked.into_iter().map(|a| a.agent_id).collect(),
        };

        debug!(
            "Routed intent {} ({}) to {:?}",
            intent.correlation_id, intent.capability, selected
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RankingPolicy, RemoteAgent};
    use serde_json::json;

    async fn registry_with(agents: &[(&str, u32)]) -> Arc<AgentRegistry> {
        let registry = Arc::new(AgentRegistry::new(RankingPolicy::StaticPriority));
        for (id, priority) in agents {
            registry
                .register(
                    RemoteAgent::new(
                        id,
                        &format!("http://{}.local:8001", id),
                        vec!["parse".to_string()],
                    )
                    .with_priority(*priority),
                )
                .await
                .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_no_capable_agent() {
        let registry = registry_with(&[]).await;
        let router = CapabilityRouter::new(registry, RoutingPolicy::SingleBest);
        let result = router.select(&Intent::new("translate", json!({}))).await;
        assert!(matches!(
            result,
            Err(OrchestrateError::NoCapableAgent { .. })
        ));
    }

    #[tokio::test]
    async fn test_single_best_picks_top_ranked() {
        let registry = registry_with(&[("slow", 1), ("fast", 8)]).await;
        let router = CapabilityRouter::new(registry, RoutingPolicy::SingleBest);
        let selected = router.select(&Intent::new("parse", json!({}))).await.unwrap();
        assert_eq!(selected, vec!["fast"]);
    }

    #[tokio::test]
    async fn test_fan_out_all_keeps_rank_order() {
        let registry = registry_with(&[("slow", 1), ("fast", 8), ("mid", 4)]).await;
        let router = CapabilityRouter::new(registry, RoutingPolicy::FanOutAll);
        let selected = router.select(&Intent::new("parse", json!({}))).await.unwrap();
        assert_eq!(selected, vec!["fast", "mid", "slow"]);
    }

    #[tokio::test]
    async fn test_routing_deterministic() {
        let registry = registry_with(&[("a", 3), ("b", 3), ("c", 3)]).await;
        let router = CapabilityRouter::new(registry, RoutingPolicy::FanOutAll);
        let intent = Intent::new("parse", json!({}));

        let first = router.select(&intent).await.unwrap();
        for _ in 0..5 {
            assert_eq!(router.select(&intent).await.unwrap(), first);
        }
    }
}
