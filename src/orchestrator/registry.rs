//! 专家注册表：名称 -> Agent 任务（扁平、有序）
//!
//! 规划步骤按名称指派专家；名称未知时退回第一个注册的专家并记录告警。

use std::sync::Arc;

use serde::Serialize;

use crate::agent::AgentTask;

/// 提供给规划步骤的专家描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecialistInfo {
    pub name: String,
    pub description: String,
}

#[derive(Clone, Default)]
pub struct SpecialistRegistry {
    entries: Vec<(String, Arc<dyn AgentTask>)>,
}

impl SpecialistRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册专家；同名专家被替换但保留原位置
    pub fn register(&mut self, task: Arc<dyn AgentTask>) {
        let name = task.name().to_string();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = task,
            None => self.entries.push((name, task)),
        }
    }

    pub fn with(mut self, task: Arc<dyn AgentTask>) -> Self {
        self.register(task);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTask>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, task)| Arc::clone(task))
    }

    /// 按名称查找，未知时退回第一个注册的专家
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn AgentTask>> {
        if let Some(task) = self.get(name) {
            return Some(task);
        }
        let (fallback, task) = self.entries.first()?;
        tracing::warn!(requested = name, fallback = %fallback, "Specialist not found, falling back to first registered");
        Some(Arc::clone(task))
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn infos(&self) -> Vec<SpecialistInfo> {
        self.entries
            .iter()
            .map(|(name, task)| SpecialistInfo {
                name: name.clone(),
                description: task.description().to_string(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
