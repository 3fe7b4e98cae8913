//! 长期记忆：跨运行检索的知识片段
//!
//! 支持 add(text, metadata) 与 search(query, k)；当前实现为 InMemoryLongTerm（关键词重叠），
//! 真实向量库由宿主实现同一 trait 接入。检索失败对 Agent 任务是非致命的。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::memory::Metadata;

/// 检索 / 写入失败（由调用方记录降级后继续）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("Memory backend unavailable: {0}")]
    Unavailable(String),

    #[error("Memory backend error: {0}")]
    Backend(String),
}

/// 单条检索结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub content: String,
    pub score: f32,
}

/// 长期记忆 trait：支持写入与相似度检索
#[async_trait]
pub trait LongTermMemory: Send + Sync {
    /// 存入一段文本（可后续按 query 检索）
    async fn add(&self, text: &str, metadata: Metadata) -> Result<(), SearchError>;

    /// 按查询检索最相关的 k 条，按分数降序
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError>;

    /// 是否启用（Noop 实现返回 false）
    fn enabled(&self) -> bool {
        true
    }
}

/// 空实现：未启用长期记忆时使用
#[derive(Clone, Default)]
pub struct NoopLongTerm;

#[async_trait]
impl LongTermMemory for NoopLongTerm {
    async fn add(&self, _text: &str, _metadata: Metadata) -> Result<(), SearchError> {
        Ok(())
    }

    async fn search(&self, _query: &str, _k: usize) -> Result<Vec<SearchHit>, SearchError> {
        Ok(Vec::new())
    }

    fn enabled(&self) -> bool {
        false
    }
}

struct Document {
    text: String,
    tokens: HashSet<String>,
}

/// 简单内存实现：按关键词重叠检索，超出容量时丢弃最旧的条目（元数据不参与检索）
#[derive(Clone)]
pub struct InMemoryLongTerm {
    store: Arc<RwLock<Vec<Document>>>,
    max_entries: usize,
}

/// 将文本切分为小写词集合（去掉首尾标点）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.chars().count() > 1)
        .collect()
}

impl InMemoryLongTerm {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(Vec::new())),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }
}

impl Default for InMemoryLongTerm {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl LongTermMemory for InMemoryLongTerm {
    async fn add(&self, text: &str, _metadata: Metadata) -> Result<(), SearchError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let mut store = self.store.write();
        store.push(Document {
            text: text.to_string(),
            tokens: tokenize_lower(text),
        });
        let n = store.len();
        if n > self.max_entries {
            store.drain(0..n - self.max_entries);
        }
        Ok(())
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let store = self.store.read();
        let mut scored: Vec<SearchHit> = store
            .iter()
            .filter_map(|doc| {
                let overlap = query_tokens.intersection(&doc.tokens).count();
                (overlap > 0).then(|| SearchHit {
                    content: doc.text.clone(),
                    score: overlap as f32 / query_tokens.len() as f32,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}
