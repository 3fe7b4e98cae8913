//! 应用配置：编排器、草稿本、Agent、重试
//!
//! 内核只消费解析好的 AppConfig（显式传入，无全局单例）。
//! load_config 为宿主进程提供便利：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ORCHESTRATOR__MAX_CONCURRENCY=64`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSection,
    pub scratchpad: ScratchpadSection,
    pub agent: AgentSection,
    pub retry: RetrySection,
}

/// [orchestrator] 段：并发、隔离、超时、重试与部分成功策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 同时执行的叶子任务上限（计数准入门）
    pub max_concurrency: usize,
    /// 节点默认在独立分支中执行
    pub default_branch_isolation: bool,
    /// 单节点超时（秒），0 表示不限
    pub per_node_timeout_secs: u64,
    /// 节点可重试错误在首次尝试之后的最大重试次数
    pub max_retry_attempts: u32,
    /// 部分节点失败时仍进行综合
    pub allow_partial_synthesis: bool,
    /// 隔离节点成功后将分支提交回根会话
    pub commit_branches_on_success: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            default_branch_isolation: false,
            per_node_timeout_secs: 300,
            max_retry_attempts: 2,
            allow_partial_synthesis: true,
            commit_branches_on_success: true,
        }
    }
}

impl OrchestratorSection {
    pub fn per_node_timeout(&self) -> Option<Duration> {
        (self.per_node_timeout_secs > 0).then(|| Duration::from_secs(self.per_node_timeout_secs))
    }
}

/// [scratchpad] 段：根会话与默认 TTL
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScratchpadSection {
    pub root_session: String,
    /// 条目默认存活时间（秒），0 表示永不过期
    pub default_ttl_secs: u64,
}

impl Default for ScratchpadSection {
    fn default() -> Self {
        Self {
            root_session: "base".to_string(),
            default_ttl_secs: 0,
        }
    }
}

impl ScratchpadSection {
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_secs > 0).then(|| Duration::from_secs(self.default_ttl_secs))
    }
}

/// [agent] 段：推理轮数、检索条数、自动记忆、默认系统提示词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_turns: usize,
    pub retrieval_k: usize,
    /// 完成任务后将最终回复写入长期记忆
    pub auto_memory: bool,
    pub system_prompt: String,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_turns: 15,
            retrieval_k: 3,
            auto_memory: false,
            system_prompt: "You are a helpful assistant.".to_string(),
            tool_timeout_secs: 30,
        }
    }
}

/// [retry] 段：指数退避参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
