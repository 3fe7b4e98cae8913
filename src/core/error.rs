//! 错误类型与恢复动作
//!
//! - StoreError：草稿本 / 分支管理的使用错误（关闭的分支、未知父会话、根分支），永不重试
//! - AgentError：单个 Agent 任务的失败（LLM、工具、超时、取消、嵌套流程）
//! - RecoveryAction：RecoveryEngine 根据 AgentError 给出的重试或终止建议

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;
use crate::memory::SessionId;
use crate::workflow::FlowError;

/// 草稿本（Session Store / Branch Manager）错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// 会话已被提交或丢弃，不再接受写入
    #[error("Session {0} is closed")]
    InvalidSession(SessionId),

    #[error("Unknown parent session: {0}")]
    UnknownParent(SessionId),

    #[error("Branch {0} is closed")]
    BranchClosed(SessionId),

    #[error("Session {0} has no parent branch")]
    RootBranch(SessionId),

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Key '{key}' not found from session {session}")]
    NotFound { session: SessionId, key: String },
}

/// Agent 任务运行过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Max turns reached ({0})")]
    MaxTurnsReached(usize),

    /// 节点级截止时间触发
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Scratchpad error: {0}")]
    Scratchpad(#[from] StoreError),

    /// 嵌套流程作为不透明任务失败
    #[error("Flow failed: {0}")]
    Flow(Box<FlowError>),

    /// 调用方自定义任务的失败
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// 任务内部已用尽自身的重试预算；外层不再重试
    #[error("Retries exhausted after {retries} retries: {source}")]
    RetriesExhausted { retries: u32, source: Box<AgentError> },
}

impl AgentError {
    /// 是否可在本地重试：限流、LLM 超时、节点超时
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::LlmError(LlmError::RateLimited { .. })
                | AgentError::LlmError(LlmError::Timeout)
                | AgentError::Timeout(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}

impl From<FlowError> for AgentError {
    fn from(err: FlowError) -> Self {
        AgentError::Flow(Box::new(err))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待指定时长后重试
    RetryAfter(Duration),
    /// 终止，错误向上传递
    Abort,
}
