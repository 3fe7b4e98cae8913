//! LLM 层：推理调用抽象与 Mock 实现

pub mod mock;
pub mod traits;

pub use mock::MockLlmClient;
pub use traits::{LlmClient, LlmError, LlmResponse, ToolCall, ToolSchema};
