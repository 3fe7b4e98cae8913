//! 自适应编排层：专家注册表、规划、依赖图调度与综合

pub mod adaptive;
pub mod events;
pub mod plan;
pub mod registry;
pub mod synthesis;
pub mod types;

pub use adaptive::{AdaptiveOrchestrator, OrchestratorBuilder};
pub use events::OrchestratorEvent;
pub use plan::{compile_plan, parse_plan, LlmPlanner, PlanDocument, PlanError, PlannedStep, Planner, StaticPlanner, StepId};
pub use registry::{SpecialistInfo, SpecialistRegistry};
pub use synthesis::{LastOutputSynthesizer, LlmSynthesizer, Synthesizer};
pub use types::{
    NodeError, NodeFailure, NodeOutput, NodeStatus, OrchestratorError, RunOutcome, RunPhase, RunReport, TaskNode,
};
