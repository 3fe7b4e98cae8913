//! 编排运行事件：阶段切换、计划、节点调度与分支处理，可序列化为 JSON 推送给前端

use serde::Serialize;

use crate::memory::SessionId;
use crate::orchestrator::{NodeStatus, RunPhase};
use crate::workflow::NodeIndex;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunStarted {
        run_id: String,
        objective: String,
    },
    PhaseChanged {
        run_id: String,
        phase: RunPhase,
    },
    /// 计划已编译为依赖图
    PlanCreated {
        run_id: String,
        steps: usize,
    },
    NodeStarted {
        run_id: String,
        node: NodeIndex,
        specialist: String,
        attempt: u32,
        branch: Option<SessionId>,
    },
    NodeRetrying {
        run_id: String,
        node: NodeIndex,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    NodeFinished {
        run_id: String,
        node: NodeIndex,
        status: NodeStatus,
        /// 失败原因（成功时为空）
        error: Option<String>,
    },
    BranchCommitted {
        run_id: String,
        node: NodeIndex,
        branch: SessionId,
        keys: Vec<String>,
    },
    BranchDiscarded {
        run_id: String,
        node: NodeIndex,
        branch: SessionId,
    },
}
