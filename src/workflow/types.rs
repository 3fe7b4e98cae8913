//! 流程类型定义
//!
//! Flow 是静态组合的执行图：叶子为 Agent 任务，内部节点为顺序链或并行扇出，可任意嵌套。

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::agent::AgentTask;
use crate::core::AgentError;

/// 执行图节点
#[derive(Clone)]
pub enum Flow {
    /// 叶子：单个 Agent 任务
    Task(Arc<dyn AgentTask>),
    /// 顺序链：上一步输出作为下一步输入，失败即停
    Sequential { name: String, steps: Vec<Flow> },
    /// 并行扇出：所有分支使用同一输入，按声明顺序汇总输出，失败时等待全部分支结束
    Parallel { name: String, branches: Vec<Flow> },
}

impl Flow {
    pub fn task(task: Arc<dyn AgentTask>) -> Self {
        Flow::Task(task)
    }

    pub fn sequential(name: impl Into<String>, steps: Vec<Flow>) -> Self {
        Flow::Sequential {
            name: name.into(),
            steps,
        }
    }

    pub fn parallel(name: impl Into<String>, branches: Vec<Flow>) -> Self {
        Flow::Parallel {
            name: name.into(),
            branches,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Flow::Task(task) => task.name(),
            Flow::Sequential { name, .. } | Flow::Parallel { name, .. } => name,
        }
    }

    /// 叶子任务总数
    pub fn leaf_count(&self) -> usize {
        match self {
            Flow::Task(_) => 1,
            Flow::Sequential { steps: children, .. } | Flow::Parallel { branches: children, .. } => {
                children.iter().map(Flow::leaf_count).sum()
            }
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Task(task) => f.debug_tuple("Task").field(&task.name()).finish(),
            Flow::Sequential { name, steps } => f
                .debug_struct("Sequential")
                .field("name", name)
                .field("steps", steps)
                .finish(),
            Flow::Parallel { name, branches } => f
                .debug_struct("Parallel")
                .field("name", name)
                .field("branches", branches)
                .finish(),
        }
    }
}

/// 并行流程中单个失败的分支
#[derive(Debug, Clone, Serialize)]
pub struct BranchFailure {
    pub index: usize,
    pub task: String,
    #[serde(serialize_with = "serialize_error")]
    pub error: AgentError,
}

fn serialize_error<S: serde::Serializer>(err: &AgentError, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&err.to_string())
}

fn describe_failures(failures: &[BranchFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("#{} {}: {}", f.index, f.task, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// 流程错误
#[derive(Error, Debug, Clone)]
pub enum FlowError {
    /// 顺序链在第 index 步失败，其后的步骤未执行
    #[error("Step {index} ({task}) failed: {source}")]
    StepFailed {
        index: usize,
        task: String,
        source: AgentError,
    },

    /// 并行扇出中所有失败的分支（在全部分支结束后汇总）
    #[error("{} of {total} parallel branches failed: {}", .failures.len(), describe_failures(.failures))]
    ParallelFailed {
        total: usize,
        failures: Vec<BranchFailure>,
    },
}

impl FlowError {
    /// 失败的任务名（顺序链为单个，并行为全部失败分支）
    pub fn failed_tasks(&self) -> Vec<&str> {
        match self {
            FlowError::StepFailed { task, .. } => vec![task.as_str()],
            FlowError::ParallelFailed { failures, .. } => {
                failures.iter().map(|f| f.task.as_str()).collect()
            }
        }
    }
}
