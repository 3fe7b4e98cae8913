//! 任务依赖图
//!
//! 使用邻接表和入度表实现 DAG：构建时校验未知依赖、自依赖与环（Kahn 拓扑排序），
//! 运行时按「依赖全部成功」逐步释放可执行节点。

use std::collections::{BTreeSet, VecDeque};

use thiserror::Error;

/// 节点下标（与计划中的步骤顺序一致）
pub type NodeIndex = usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node {node} depends on unknown node {dependency}")]
    UnknownDependency { node: NodeIndex, dependency: NodeIndex },

    #[error("Node {0} depends on itself")]
    SelfDependency(NodeIndex),

    #[error("Cyclic dependency detected among nodes {0:?}")]
    Cycle(Vec<NodeIndex>),
}

/// 依赖图
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// 邻接表：节点 -> 依赖它的节点
    adjacency: Vec<Vec<NodeIndex>>,
    /// 入度表：节点 -> 尚未成功的依赖数
    in_degree: Vec<usize>,
    dependencies: Vec<Vec<NodeIndex>>,
}

impl TaskGraph {
    /// deps[i] 为节点 i 的依赖（重复项会被去重）
    pub fn new(deps: &[Vec<NodeIndex>]) -> Result<Self, GraphError> {
        let n = deps.len();
        let mut adjacency = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];
        let mut dependencies = Vec::with_capacity(n);

        for (node, node_deps) in deps.iter().enumerate() {
            let unique: BTreeSet<NodeIndex> = node_deps.iter().copied().collect();
            for &dep in &unique {
                if dep == node {
                    return Err(GraphError::SelfDependency(node));
                }
                if dep >= n {
                    return Err(GraphError::UnknownDependency { node, dependency: dep });
                }
                adjacency[dep].push(node);
                in_degree[node] += 1;
            }
            dependencies.push(unique.into_iter().collect());
        }

        let graph = Self {
            adjacency,
            in_degree,
            dependencies,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// 第 k 个节点依赖 0..k-1 的全部节点
    pub fn sequential(n: usize) -> Self {
        Self {
            adjacency: (0..n).map(|k| (k + 1..n).collect()).collect(),
            in_degree: (0..n).collect(),
            dependencies: (0..n).map(|k| (0..k).collect()).collect(),
        }
    }

    fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut degree = self.in_degree.clone();
        let mut queue: VecDeque<NodeIndex> = (0..self.len()).filter(|&i| degree[i] == 0).collect();
        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &next in &self.adjacency[node] {
                degree[next] -= 1;
                if degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        if visited == self.len() {
            Ok(())
        } else {
            let stuck = (0..self.len()).filter(|&i| degree[i] > 0).collect();
            Err(GraphError::Cycle(stuck))
        }
    }

    pub fn len(&self) -> usize {
        self.in_degree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_degree.is_empty()
    }

    pub fn dependencies(&self, node: NodeIndex) -> &[NodeIndex] {
        self.dependencies.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, node: NodeIndex) -> &[NodeIndex] {
        self.adjacency.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 初始可执行节点（无依赖），按下标升序
    pub fn roots(&self) -> Vec<NodeIndex> {
        (0..self.len()).filter(|&i| self.in_degree[i] == 0).collect()
    }

    /// 标记节点成功，返回因此变为可执行的节点
    pub fn mark_succeeded(&mut self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut newly_ready = Vec::new();
        let Some(dependents) = self.adjacency.get(node) else {
            return newly_ready;
        };
        for &dependent in dependents {
            let degree = &mut self.in_degree[dependent];
            *degree = degree.saturating_sub(1);
            if *degree == 0 {
                newly_ready.push(dependent);
            }
        }
        newly_ready
    }

    /// 所有直接或间接依赖该节点的节点，按下标升序
    pub fn transitive_dependents(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeIndex> = self.dependents(node).to_vec();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend_from_slice(self.dependents(next));
            }
        }
        seen.into_iter().collect()
    }
}
