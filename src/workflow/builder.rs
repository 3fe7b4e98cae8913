//! 流程构建器
//!
//! 提供流畅的 API 来组合顺序链与并行扇出

use std::future::Future;
use std::sync::Arc;

use crate::agent::{AgentTask, FnTask, TaskContext, TaskValue};
use crate::core::AgentError;
use crate::workflow::Flow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Composition {
    Sequential,
    Parallel,
}

/// 流程构建器
pub struct FlowBuilder {
    name: String,
    kind: Composition,
    children: Vec<Flow>,
}

impl FlowBuilder {
    /// 顺序链构建器
    pub fn sequential(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: Composition::Sequential,
            children: Vec::new(),
        }
    }

    /// 并行扇出构建器
    pub fn parallel(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: Composition::Parallel,
            children: Vec::new(),
        }
    }

    /// 添加 Agent 任务
    pub fn task(mut self, task: Arc<dyn AgentTask>) -> Self {
        self.children.push(Flow::Task(task));
        self
    }

    /// 添加闭包任务
    pub fn step<F, Fut>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(TaskValue, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskValue, AgentError>> + Send + 'static,
    {
        self.task(FnTask::new(name, func).into_arc())
    }

    /// 嵌套子流程（对父流程而言是一个不透明节点）
    pub fn flow(mut self, flow: Flow) -> Self {
        self.children.push(flow);
        self
    }

    /// 嵌套由另一个构建器生成的子流程
    pub fn nest(self, builder: FlowBuilder) -> Self {
        self.flow(builder.build())
    }

    pub fn build(self) -> Flow {
        match self.kind {
            Composition::Sequential => Flow::sequential(self.name, self.children),
            Composition::Parallel => Flow::parallel(self.name, self.children),
        }
    }
}
