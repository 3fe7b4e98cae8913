//! 运行监管：每次编排运行的取消令牌
//!
//! 所有运行的令牌都派生自监管者的根令牌：cancel_all 取消全部运行，cancel_run 只取消单次运行；
//! 节点与任务再从运行令牌派生子令牌，取消沿树向下传播。

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// 运行级生命周期管理
#[derive(Debug)]
pub struct RunSupervisor {
    root: CancellationToken,
    runs: Mutex<HashMap<String, CancellationToken>>,
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// 登记一次运行，返回其令牌；parent 为调用方提供的外部令牌（可选）
    pub fn start_run(&self, run_id: &str, parent: Option<&CancellationToken>) -> CancellationToken {
        let token = self.root.child_token();
        if let Some(parent) = parent {
            let linked = token.clone();
            let parent = parent.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = parent.cancelled() => linked.cancel(),
                    _ = linked.cancelled() => {}
                }
            });
        }
        self.runs.lock().insert(run_id.to_string(), token.clone());
        token
    }

    /// 运行结束后注销；令牌随之取消，外部令牌的联动任务一并退出
    pub fn finish_run(&self, run_id: &str) {
        if let Some(token) = self.runs.lock().remove(run_id) {
            token.cancel();
        }
    }

    /// 取消单次运行；运行不存在时返回 false
    pub fn cancel_run(&self, run_id: &str) -> bool {
        match self.runs.lock().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部运行（包括之后派生的运行）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn active_runs(&self) -> Vec<String> {
        self.runs.lock().keys().cloned().collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for RunSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_single_run() {
        let supervisor = RunSupervisor::new();
        let a = supervisor.start_run("a", None);
        let b = supervisor.start_run("b", None);
        assert!(supervisor.cancel_run("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!supervisor.cancel_run("missing"));
    }

    #[tokio::test]
    async fn test_cancel_all_and_finish() {
        let supervisor = RunSupervisor::new();
        let a = supervisor.start_run("a", None);
        supervisor.finish_run("a");
        assert!(supervisor.active_runs().is_empty());
        supervisor.cancel_all();
        assert!(a.is_cancelled());
        assert!(supervisor.start_run("b", None).is_cancelled());
    }

    #[tokio::test]
    async fn test_external_token_propagates() {
        let supervisor = RunSupervisor::new();
        let external = CancellationToken::new();
        let run = supervisor.start_run("a", Some(&external));
        external.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), run.cancelled())
            .await
            .expect("run token should follow the external token");
    }
}
