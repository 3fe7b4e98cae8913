//! 任务调度：并发准入门与节点截止时间
//!
//! 所有叶子任务（Agent 调用）执行前需从 Semaphore 获取许可，限制对外部协作方的并发；
//! run_with_deadline 将超时实现为「到期即取消」，与运行级取消语义一致。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

/// 任务调度器（计数准入门）
#[derive(Debug)]
pub struct TaskScheduler {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    /// 获取执行许可；等待期间若被取消则返回 Cancelled
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, AgentError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| AgentError::Cancelled)
            }
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// 当前空闲许可数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(16)
    }
}

/// 在取消令牌与可选截止时间下执行 future。
///
/// `token` 应是专属于本次执行的（子）令牌：到期时会被取消，使任务内部的挂起点一并退出。
pub async fn run_with_deadline<T, Fut>(
    token: &CancellationToken,
    deadline: Option<Duration>,
    fut: Fut,
) -> Result<T, AgentError>
where
    Fut: Future<Output = Result<T, AgentError>>,
{
    let expiry = async {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AgentError::Cancelled),
        result = fut => result,
        _ = expiry => {
            token.cancel();
            Err(AgentError::Timeout(deadline.unwrap_or_default()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scheduler_bounds_permits() {
        let scheduler = TaskScheduler::new(2);
        let token = CancellationToken::new();
        let a = scheduler.acquire(&token).await.unwrap();
        let _b = scheduler.acquire(&token).await.unwrap();
        assert_eq!(scheduler.available(), 0);
        drop(a);
        assert_eq!(scheduler.available(), 1);
    }

    #[tokio::test]
    async fn test_acquire_cancelled_while_waiting() {
        let scheduler = TaskScheduler::new(1);
        let token = CancellationToken::new();
        let _held = scheduler.acquire(&token).await.unwrap();
        let waiter = CancellationToken::new();
        waiter.cancel();
        assert!(matches!(scheduler.acquire(&waiter).await, Err(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_deadline_cancels_token() {
        let token = CancellationToken::new();
        let inner = token.clone();
        let result: Result<(), AgentError> = run_with_deadline(
            &token,
            Some(Duration::from_millis(20)),
            async move {
                inner.cancelled().await;
                Err(AgentError::Cancelled)
            },
        )
        .await;
        assert!(matches!(result, Err(AgentError::Timeout(_))));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_passes_result_through() {
        let token = CancellationToken::new();
        let result = run_with_deadline(&token, Some(Duration::from_secs(5)), async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert!(!token.is_cancelled());
    }
}
