//! 认知层：LLM 驱动的专家 Agent（ReAct 状态机）与过程事件

pub mod events;
pub mod loop_;

pub use events::{AgentEvent, AgentPhase};
pub use loop_::{Agent, AgentBuilder};
