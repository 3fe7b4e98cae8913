//! 流程层：静态组合（顺序 / 并行 / 嵌套）与 DAG 依赖图

pub mod builder;
pub mod engine;
pub mod graph;
pub mod types;

pub use builder::FlowBuilder;
pub use engine::{FlowRunner, FlowTask};
pub use graph::{GraphError, NodeIndex, TaskGraph};
pub use types::{BranchFailure, Flow, FlowError};
