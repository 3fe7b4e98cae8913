//! 错误恢复引擎
//!
//! 根据 AgentError 类型与已重试次数返回 RecoveryAction：可重试错误按指数退避重试，其余立即终止。
//! 限流错误若带 retry_after，则至少等待该时长。

use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{AgentError, RecoveryAction};
use crate::llm::LlmError;

/// 语义化错误恢复：将错误映射为「等待后重试」或「终止」
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    /// 首次尝试之后允许的最大重试次数
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RecoveryEngine {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff: max_backoff.max(base_backoff),
        }
    }

    /// 从配置构建：[orchestrator].max_retry_attempts 与 [retry] 段
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            cfg.orchestrator.max_retry_attempts,
            Duration::from_millis(cfg.retry.base_backoff_ms),
            Duration::from_millis(cfg.retry.max_backoff_ms),
        )
    }

    /// 不重试
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 第 retries_done+1 次重试前的退避时长
    pub fn backoff(&self, retries_done: u32) -> Duration {
        let factor = 2u32.saturating_pow(retries_done.min(16));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// retries_done：该操作已经重试过的次数
    pub fn handle(&self, err: &AgentError, retries_done: u32) -> RecoveryAction {
        if !err.is_retryable() || retries_done >= self.max_retries {
            return RecoveryAction::Abort;
        }
        let backoff = self.backoff(retries_done);
        match err {
            AgentError::LlmError(LlmError::RateLimited { retry_after_ms }) => {
                RecoveryAction::RetryAfter(backoff.max(Duration::from_millis(*retry_after_ms)))
            }
            _ => RecoveryAction::RetryAfter(backoff),
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(500), Duration::from_secs(30))
    }
}
