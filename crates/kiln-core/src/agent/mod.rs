//! Agent invocation contract.
//!
//! The engine is agnostic to how agents run; it hands an agent type and
//! the step's input snapshot to an executor and gets back structured
//! output plus token and cost accounting. Failures are plain errors --
//! the executor does not encode domain error codes.

pub mod mock;

use async_trait::async_trait;
use rust_decimal::Decimal;

use kiln_db::models::AgentType;

pub use mock::MockAgentExecutor;

/// What one agent invocation produced.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Structured output; merged into the running context and stored on
    /// the artifact.
    pub output: serde_json::Value,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    /// Cost the agent reports for this invocation, in credits.
    pub estimated_cost_credits: Decimal,
}

/// Pluggable agent invocation.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// The model identifier recorded on agent-run rows.
    fn model(&self) -> &str;

    /// Run one agent over the given inputs.
    async fn execute(
        &self,
        agent_type: AgentType,
        inputs: &serde_json::Value,
    ) -> anyhow::Result<AgentOutcome>;
}
