//! LLM 客户端抽象
//!
//! 推理调用 infer(history, tool_schemas) 返回文本和/或工具调用；没有工具调用即为最终答案。
//! 所有后端（真实 API / Mock）实现 LlmClient，内核只依赖这一接口。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::Message;

/// 推理调用的失败类型；RateLimited 与 Timeout 可退避重试，InvalidResponse 直接失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Inference timed out")]
    Timeout,
}

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            args,
        }
    }
}

/// 提供给模型的工具描述（名称、说明、参数 JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// 一次推理的结果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl LlmResponse {
    /// 最终答案
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    /// 单个工具调用
    pub fn tool_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            text: None,
            tool_calls: vec![ToolCall::new(name, args)],
        }
    }

    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 一次推理：对话历史 + 可用工具 schema
    async fn infer(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<LlmResponse, LlmError>;

    /// 无工具的纯文本完成（规划、综合使用）
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let response = self.infer(messages, &[]).await?;
        response
            .text
            .ok_or_else(|| LlmError::InvalidResponse("completion returned no text".to_string()))
    }
}
