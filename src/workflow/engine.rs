//! 流程引擎
//!
//! 递归执行 Flow：顺序链失败即停，并行扇出等待全部分支结束后汇总失败。
//! 只有叶子任务从 TaskScheduler 获取许可，组合节点本身不占并发额度，嵌套再深也不会互相等待许可。
//! 每个叶子在自己的子取消令牌下运行，节点超时即取消该令牌。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;

use crate::agent::{AgentTask, TaskContext, TaskValue};
use crate::config::OrchestratorSection;
use crate::core::{run_with_deadline, AgentError, TaskScheduler};
use crate::workflow::{BranchFailure, Flow, FlowError};

/// 流程执行器：共享准入门与节点超时
#[derive(Debug, Clone)]
pub struct FlowRunner {
    scheduler: Arc<TaskScheduler>,
    node_timeout: Option<Duration>,
}

impl FlowRunner {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            scheduler,
            node_timeout: None,
        }
    }

    pub fn from_config(cfg: &OrchestratorSection) -> Self {
        Self::new(Arc::new(TaskScheduler::new(cfg.max_concurrency))).with_node_timeout(cfg.per_node_timeout())
    }

    pub fn with_node_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// 执行任意流程节点；组合节点的失败以 AgentError::Flow 返回
    pub async fn run(&self, flow: &Flow, input: TaskValue, ctx: &TaskContext) -> Result<TaskValue, AgentError> {
        self.run_boxed(flow, input, ctx).await
    }

    fn run_boxed<'a>(
        &'a self,
        flow: &'a Flow,
        input: TaskValue,
        ctx: &'a TaskContext,
    ) -> BoxFuture<'a, Result<TaskValue, AgentError>> {
        async move {
            match flow {
                Flow::Task(task) => self.run_leaf(task, input, ctx).await,
                Flow::Sequential { name, steps } => self
                    .run_sequential(name, steps, input, ctx)
                    .await
                    .map_err(AgentError::from),
                Flow::Parallel { name, branches } => self
                    .run_parallel(name, branches, input, ctx)
                    .await
                    .map(TaskValue::Array)
                    .map_err(AgentError::from),
            }
        }
        .boxed()
    }

    async fn run_leaf(
        &self,
        task: &Arc<dyn AgentTask>,
        input: TaskValue,
        ctx: &TaskContext,
    ) -> Result<TaskValue, AgentError> {
        let _permit = self.scheduler.acquire(ctx.cancel_token()).await?;
        let token = ctx.cancel_token().child_token();
        let leaf_ctx = ctx.clone().with_cancel(token.clone());
        tracing::debug!(task = task.name(), "Flow task started");
        let result = run_with_deadline(&token, self.node_timeout, task.run(input, &leaf_ctx)).await;
        if let Err(e) = &result {
            tracing::warn!(task = task.name(), error = %e, "Flow task failed");
        }
        result
    }

    /// 顺序执行：第 i 步的输出作为第 i+1 步的输入；空链原样返回输入
    pub async fn run_sequential(
        &self,
        name: &str,
        steps: &[Flow],
        input: TaskValue,
        ctx: &TaskContext,
    ) -> Result<TaskValue, FlowError> {
        let mut value = input;
        for (index, step) in steps.iter().enumerate() {
            value = self
                .run_boxed(step, value, ctx)
                .await
                .map_err(|source| FlowError::StepFailed {
                    index,
                    task: step.name().to_string(),
                    source,
                })?;
        }
        tracing::debug!(flow = name, steps = steps.len(), "Sequential flow finished");
        Ok(value)
    }

    /// 并行执行：所有分支使用同一输入，输出按声明顺序排列；
    /// 任一分支失败时仍等待其余分支结束，再汇总全部失败
    pub async fn run_parallel(
        &self,
        name: &str,
        branches: &[Flow],
        input: TaskValue,
        ctx: &TaskContext,
    ) -> Result<Vec<TaskValue>, FlowError> {
        let results = join_all(
            branches
                .iter()
                .map(|branch| self.run_boxed(branch, input.clone(), ctx)),
        )
        .await;

        let total = results.len();
        let mut outputs = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (index, (branch, result)) in branches.iter().zip(results).enumerate() {
            match result {
                Ok(value) => outputs.push(value),
                Err(error) => failures.push(BranchFailure {
                    index,
                    task: branch.name().to_string(),
                    error,
                }),
            }
        }

        if failures.is_empty() {
            tracing::debug!(flow = name, branches = total, "Parallel flow finished");
            Ok(outputs)
        } else {
            tracing::warn!(flow = name, failed = failures.len(), total, "Parallel flow failed");
            Err(FlowError::ParallelFailed { total, failures })
        }
    }
}

/// 把组合好的流程包装成 AgentTask，可作为专家注册或嵌入其他流程
pub struct FlowTask {
    flow: Flow,
    runner: FlowRunner,
    description: String,
}

impl FlowTask {
    pub fn new(flow: Flow, runner: FlowRunner) -> Self {
        Self {
            flow,
            runner,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl AgentTask for FlowTask {
    fn name(&self) -> &str {
        self.flow.name()
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, input: TaskValue, ctx: &TaskContext) -> Result<TaskValue, AgentError> {
        self.runner.run(&self.flow, input, ctx).await
    }
}
