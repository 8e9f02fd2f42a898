//! The fixed step table.
//!
//! Every pipeline runs the same four steps in the same order, each bound
//! to one agent and one artifact type. Costs are the hardcoded MVP
//! estimates used by pre-flight validation; actual billing uses the
//! amounts reported by the agent executor.

use rust_decimal::Decimal;

use kiln_db::models::{AgentType, ArtifactType, StepType};

/// One row of the step table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSpec {
    /// 1-based position in the sequence.
    pub number: i32,
    pub step_type: StepType,
    pub agent_type: AgentType,
    pub artifact_type: ArtifactType,
    /// Human-readable name, lowercase; uppercased for replay reporting.
    pub name: &'static str,
    /// Estimated cost in credits for pre-flight validation.
    pub estimated_cost_credits: i64,
}

/// The pipeline, in execution order.
pub const STEPS: [StepSpec; 4] = [
    StepSpec {
        number: 1,
        step_type: StepType::Analysis,
        agent_type: AgentType::Architect,
        artifact_type: ArtifactType::AnalysisReport,
        name: "analysis",
        estimated_cost_credits: 50,
    },
    StepSpec {
        number: 2,
        step_type: StepType::UserStories,
        agent_type: AgentType::Pm,
        artifact_type: ArtifactType::UserStories,
        name: "user stories",
        estimated_cost_credits: 30,
    },
    StepSpec {
        number: 3,
        step_type: StepType::CodeSkeleton,
        agent_type: AgentType::Engineer,
        artifact_type: ArtifactType::CodeFiles,
        name: "code skeleton",
        estimated_cost_credits: 40,
    },
    StepSpec {
        number: 4,
        step_type: StepType::TestCases,
        agent_type: AgentType::Qa,
        artifact_type: ArtifactType::TestSuite,
        name: "test cases",
        estimated_cost_credits: 30,
    },
];

/// Number of steps in every pipeline.
pub const STEP_COUNT: i32 = STEPS.len() as i32;

/// Look up the spec for a 1-based step number.
pub fn spec_for_number(number: i32) -> Option<&'static StepSpec> {
    STEPS.iter().find(|s| s.number == number)
}

/// Look up the spec for a step type.
pub fn spec_for_type(step_type: StepType) -> &'static StepSpec {
    STEPS
        .iter()
        .find(|s| s.step_type == step_type)
        .expect("every step type appears in the step table")
}

/// The agent bound to a step type (fixed 1-to-1 mapping).
pub fn agent_for(step_type: StepType) -> AgentType {
    spec_for_type(step_type).agent_type
}

/// The artifact type a step produces.
pub fn artifact_type_for(step_type: StepType) -> ArtifactType {
    spec_for_type(step_type).artifact_type
}

/// Estimated cost of a full pipeline, as billed decimal credits.
pub fn estimated_pipeline_cost() -> Decimal {
    Decimal::from(STEPS.iter().map(|s| s.estimated_cost_credits).sum::<i64>())
}
