//! 核心层：错误与恢复、运行监管、并发准入与截止时间

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod task_scheduler;

pub use error::{AgentError, RecoveryAction, StoreError};
pub use recovery::RecoveryEngine;
pub use session_supervisor::RunSupervisor;
pub use task_scheduler::{run_with_deadline, TaskScheduler};
