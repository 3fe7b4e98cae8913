//! Agent 任务接口
//!
//! 编排器与流程引擎只通过 AgentTask 调度工作：给定输入与执行上下文，返回结果或结构化失败。
//! TaskContext 携带草稿本句柄、本次执行所在的会话（根会话或分支）与取消令牌，
//! 由调度方显式传入，任务之间不共享任何全局状态。

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, StoreError};
use crate::memory::{BranchManager, Entry, NewEntry, SequenceNo, SessionId};

/// 任务输入 / 输出的不透明载荷
pub type TaskValue = serde_json::Value;

/// 载荷的文本形式：字符串直接使用，其余序列化为 JSON
pub fn value_text(value: &TaskValue) -> String {
    match value {
        TaskValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 单次任务执行的上下文
#[derive(Clone)]
pub struct TaskContext {
    scratchpad: Arc<BranchManager>,
    session_id: SessionId,
    cancel: CancellationToken,
}

impl TaskContext {
    /// 在根会话上执行的上下文
    pub fn new(scratchpad: Arc<BranchManager>) -> Self {
        let session_id = scratchpad.root().to_string();
        Self {
            scratchpad,
            session_id,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn scratchpad(&self) -> &Arc<BranchManager> {
        &self.scratchpad
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 写入当前会话；key 非空时遮蔽该逻辑键
    pub fn write(&self, key: Option<&str>, entry: NewEntry) -> Result<Entry, StoreError> {
        self.scratchpad.write(&self.session_id, key, entry)
    }

    /// 沿分支链解析逻辑键
    pub fn resolve(&self, key: &str) -> Result<Entry, StoreError> {
        self.scratchpad.resolve(&self.session_id, key)
    }

    /// 轮询当前会话中 sequence_no > after 的条目
    pub fn read_after(&self, after: SequenceNo) -> Vec<Entry> {
        self.scratchpad.store().read(&self.session_id, Some(after), None)
    }
}

/// Agent 任务：编排的最小执行单元
#[async_trait]
pub trait AgentTask: Send + Sync {
    fn name(&self) -> &str;

    /// 供规划步骤挑选专家时参考
    fn description(&self) -> &str {
        ""
    }

    async fn run(&self, input: TaskValue, ctx: &TaskContext) -> Result<TaskValue, AgentError>;
}

type BoxedTaskFn =
    Box<dyn Fn(TaskValue, TaskContext) -> BoxFuture<'static, Result<TaskValue, AgentError>> + Send + Sync>;

/// 闭包任务：把异步函数包装为 AgentTask
pub struct FnTask {
    name: String,
    description: String,
    func: BoxedTaskFn,
}

impl FnTask {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(TaskValue, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskValue, AgentError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            func: Box::new(move |input, ctx| Box::pin(func(input, ctx))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn into_arc(self) -> Arc<dyn AgentTask> {
        Arc::new(self)
    }
}

#[async_trait]
impl AgentTask for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, input: TaskValue, ctx: &TaskContext) -> Result<TaskValue, AgentError> {
        (self.func)(input, ctx.clone()).await
    }
}
