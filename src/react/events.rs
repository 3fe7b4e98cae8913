//! Agent 运行过程事件：用于流式展示阶段切换、工具调用、观察与最终回复

use serde::Serialize;

/// 单次运行的阶段：Retrieving -> AwaitingModel -> ExecutingTool -> AwaitingModel … -> Done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Retrieving,
    AwaitingModel,
    ExecutingTool,
    Done,
}

/// 过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    PhaseChanged {
        agent: String,
        phase: AgentPhase,
        turn: usize,
    },
    /// 检索到的长期记忆条数
    MemoryRecalled { agent: String, hits: usize },
    /// 检索失败，继续无上下文推理
    MemoryDegraded { agent: String, reason: String },
    ToolCall {
        agent: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        agent: String,
        tool: String,
        ok: bool,
        preview: String,
    },
    /// 推理调用退避重试
    Retry {
        agent: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    Finished { agent: String, preview: String },
}
