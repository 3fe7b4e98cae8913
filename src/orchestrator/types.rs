//! 编排运行的数据结构：任务节点、运行阶段、运行结果与错误

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::agent::TaskValue;
use crate::core::{AgentError, StoreError};
use crate::memory::SessionId;
use crate::orchestrator::{PlanDocument, PlanError, StepId};
use crate::workflow::NodeIndex;

fn as_display<T: std::fmt::Display, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(value)
}

/// 节点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Failed)
    }
}

/// 单个节点的失败原因
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    /// 依赖的节点失败，本节点未执行
    #[error("Dependency node {dependency} failed")]
    DependencyFailure { dependency: NodeIndex },

    #[error("Cancelled")]
    Cancelled,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Task(AgentError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AgentError> for NodeError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Cancelled => NodeError::Cancelled,
            AgentError::Timeout(d) => NodeError::Timeout(d),
            AgentError::Scratchpad(e) => NodeError::Store(e),
            other => NodeError::Task(other),
        }
    }
}

/// 运行时的任务图节点
#[derive(Debug, Clone, Serialize)]
pub struct TaskNode {
    pub index: NodeIndex,
    pub step_id: StepId,
    /// 实际执行的专家（未知名称已退回到第一个专家）
    pub specialist: String,
    pub instruction: String,
    pub dependencies: Vec<NodeIndex>,
    pub status: NodeStatus,
    pub result: Option<TaskValue>,
    #[serde(serialize_with = "serialize_node_error")]
    pub error: Option<NodeError>,
    /// 已执行的尝试次数（含首次）
    pub attempts: u32,
    /// 最后一次尝试所在的分支（仅隔离节点）
    pub branch: Option<SessionId>,
    /// 成功时分支中被遮蔽的逻辑键
    pub shadow_keys: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

fn serialize_node_error<S: Serializer>(err: &Option<NodeError>, s: S) -> Result<S::Ok, S::Error> {
    match err {
        Some(e) => s.collect_str(e),
        None => s.serialize_none(),
    }
}

impl TaskNode {
    pub fn new(
        index: NodeIndex,
        step_id: StepId,
        specialist: impl Into<String>,
        instruction: impl Into<String>,
        dependencies: Vec<NodeIndex>,
    ) -> Self {
        Self {
            index,
            step_id,
            specialist: specialist.into(),
            instruction: instruction.into(),
            dependencies,
            status: NodeStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            branch: None,
            shadow_keys: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn fail(&mut self, error: NodeError) {
        self.status = NodeStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }
}

/// 成功节点的输出（交给综合步骤）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutput {
    pub index: NodeIndex,
    pub step_id: StepId,
    pub specialist: String,
    pub instruction: String,
    pub output: TaskValue,
}

/// 失败节点的摘要（聚合错误中逐一列出）
#[derive(Debug, Clone, Serialize)]
pub struct NodeFailure {
    pub index: NodeIndex,
    pub step_id: StepId,
    pub specialist: String,
    #[serde(serialize_with = "as_display")]
    pub error: NodeError,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step {} ({}): {}", self.step_id, self.specialist, self.error)
    }
}

fn list_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// 编排运行的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    Dispatching,
    Collecting,
    Synthesizing,
    Succeeded,
    Failed,
}

/// 运行级失败
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("Planning failed: {0}")]
    PlanningError(#[from] PlanError),

    /// 没有任何节点成功，未进行综合
    #[error("All {} nodes failed: {}", .failures.len(), list_failures(.failures))]
    AllNodesFailed { failures: Vec<NodeFailure> },

    /// 部分节点失败且不允许部分综合
    #[error("{} nodes failed: {}", .failures.len(), list_failures(.failures))]
    NodesFailed { failures: Vec<NodeFailure> },

    #[error("Run cancelled ({} nodes did not complete)", .failures.len())]
    Cancelled { failures: Vec<NodeFailure> },

    #[error("Synthesis failed: {0}")]
    SynthesisFailed(AgentError),
}

impl OrchestratorError {
    /// 参与失败的节点（规划失败与综合失败时为空）
    pub fn failures(&self) -> &[NodeFailure] {
        match self {
            OrchestratorError::AllNodesFailed { failures }
            | OrchestratorError::NodesFailed { failures }
            | OrchestratorError::Cancelled { failures } => failures,
            OrchestratorError::PlanningError(_) | OrchestratorError::SynthesisFailed(_) => &[],
        }
    }
}

/// 运行结果：完全成功、带综合的部分成功、失败
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Succeeded(TaskValue),
    PartialSuccess {
        result: TaskValue,
        failures: Vec<NodeFailure>,
    },
    Failed(OrchestratorError),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded(_))
    }

    /// 综合结果（部分成功时同样返回）
    pub fn result(&self) -> Option<&TaskValue> {
        match self {
            RunOutcome::Succeeded(result) | RunOutcome::PartialSuccess { result, .. } => Some(result),
            RunOutcome::Failed(_) => None,
        }
    }
}

/// 一次编排运行的完整记录
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub objective: String,
    pub plan: Option<PlanDocument>,
    pub nodes: Vec<TaskNode>,
    /// 依次经过的阶段
    pub phases: Vec<RunPhase>,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn final_phase(&self) -> Option<RunPhase> {
        self.phases.last().copied()
    }

    pub fn node(&self, index: NodeIndex) -> Option<&TaskNode> {
        self.nodes.get(index)
    }

    /// 部分成功视为 Ok（调用方可从 outcome 中区分）
    pub fn into_result(self) -> Result<TaskValue, OrchestratorError> {
        match self.outcome {
            RunOutcome::Succeeded(result) | RunOutcome::PartialSuccess { result, .. } => Ok(result),
            RunOutcome::Failed(err) => Err(err),
        }
    }
}
