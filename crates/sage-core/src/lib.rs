//! Sage core — multi-agent task orchestration
//!
//! The host-side engine that turns structured intents into remote agent
//! work: a capability registry, a deterministic router, a streaming task
//! lifecycle manager, and a push-notification dispatcher, all speaking the
//! A2A protocol from `sage-a2a`.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod registry;
pub mod router;
pub mod task;

pub use config::OrchestratorConfig;
pub use dispatcher::{
    CallbackDispatcher, DeliveryState, HttpPushDelivery, PushDelivery, PushNotification,
    PushSubscription,
};
pub use error::OrchestrateError;
pub use manager::TaskManager;
pub use registry::{AgentRegistry, AgentStatus, RankingPolicy, RemoteAgent};
pub use router::{CapabilityRouter, RoutingPolicy};
pub use task::{AgentResult, ChunkOutcome, Intent, Task, TaskState};
