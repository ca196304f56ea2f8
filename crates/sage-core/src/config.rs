//! Orchestrator configuration

use anyhow::{Context, Result};
use serde::Deserialize;

use sage_a2a::TransportConfig;

use crate::registry::RankingPolicy;
use crate::router::RoutingPolicy;

/// Tuning knobs for the orchestration engine. Every field has a sensible
/// default, so a partial TOML document is enough.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub routing_policy: RoutingPolicy,
    pub ranking_policy: RankingPolicy,
    /// How long a cancellation waits for remote acknowledgment before the
    /// sessions are torn down locally.
    pub cancel_grace_ms: u64,
    /// How long terminal tasks stay queryable before the sweeper drops them.
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Push delivery retry budget and base backoff (doubled per attempt).
    pub push_max_attempts: u32,
    pub push_backoff_ms: u64,
    /// Capacity of per-task event and watcher channels.
    pub channel_capacity: usize,
    pub transport: TransportConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            routing_policy: RoutingPolicy::default(),
            ranking_policy: RankingPolicy::default(),
            cancel_grace_ms: 5_000,
            retention_secs: 3_600,
            sweep_interval_secs: 60,
            push_max_attempts: 5,
            push_backoff_ms: 500,
            channel_capacity: 64,
            transport: TransportConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse orchestrator config")
    }
}
