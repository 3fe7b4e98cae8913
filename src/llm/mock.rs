//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预置的响应；脚本耗尽后回显最后一条 User 消息作为最终答案。

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::llm::{LlmClient, LlmError, LlmResponse, ToolSchema};
use crate::memory::{Message, Role};

/// Mock 客户端：脚本化响应 + 回显兜底
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(responses: impl IntoIterator<Item = Result<LlmResponse, LlmError>>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().collect()),
            ..Self::default()
        }
    }

    /// 每次推理前等待（模拟慢模型）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, response: Result<LlmResponse, LlmError>) {
        self.script.lock().push_back(response);
    }

    /// 已发生的推理次数
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// 第 n 次推理收到的历史
    pub fn messages_of_call(&self, n: usize) -> Option<Vec<Message>> {
        self.calls.lock().get(n).cloned()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn infer(&self, messages: &[Message], _tools: &[ToolSchema]) -> Result<LlmResponse, LlmError> {
        self.calls.lock().push(messages.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(LlmResponse::text(format!("Echo from Mock: {}", last_user)))
    }
}
