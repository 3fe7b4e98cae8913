//! Hive - Rust 多智能体编排内核
//!
//! 模块划分：
//! - **agent**: Agent 任务接口（AgentTask、TaskContext、闭包任务）
//! - **config**: 应用配置（TOML + 环境变量 HIVE__*）
//! - **core**: 错误与恢复、运行监管、并发准入与节点截止时间
//! - **llm**: LLM 客户端抽象与 Mock 实现
//! - **memory**: 会话草稿本（追加日志、TTL、分支 / 提交 / 丢弃）、对话消息、长期记忆
//! - **observability**: tracing 订阅器初始化
//! - **orchestrator**: 自适应编排（规划 -> 依赖图调度 -> 综合）
//! - **react**: LLM 驱动的专家 Agent（检索 -> 推理 -> 工具 状态机）
//! - **tools**: 工具 trait、注册表与执行器
//! - **workflow**: 静态流程（顺序 / 并行 / 嵌套）与任务依赖图

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod react;
pub mod tools;
pub mod workflow;

pub use agent::{AgentTask, FnTask, TaskContext, TaskValue};
pub use config::{load_config, AppConfig};
pub use memory::{BranchManager, SessionStore};
pub use orchestrator::{AdaptiveOrchestrator, RunOutcome, RunReport};
pub use workflow::{Flow, FlowBuilder, FlowRunner};
