//! 草稿本条目：不可变、按会话序号排序、可带 TTL 的协作记录

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 会话 ID（在同一分支树内唯一）
pub type SessionId = String;

/// 会话内序号，从 1 开始，由存储在追加时分配
pub type SequenceNo = u64;

/// 分支遮蔽使用的逻辑键所在的元数据字段
pub const RELATED_KEY: &str = "related_key";

/// 条目内容：不透明字节、文本或结构化数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Bytes(Vec<u8>),
    Structured(serde_json::Value),
}

impl Content {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            _ => None,
        }
    }

    /// 供提示词拼接的文本形式（字节内容按 UTF-8 有损解码）
    pub fn to_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Content::Structured(v) => v.to_string(),
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<Vec<u8>> for Content {
    fn from(b: Vec<u8>) -> Self {
        Content::Bytes(b)
    }
}

impl From<serde_json::Value> for Content {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::String(s) => Content::Text(s),
            other => Content::Structured(other),
        }
    }
}

/// 元数据标量值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        MetaValue::Int(i)
    }
}

impl From<f64> for MetaValue {
    fn from(f: f64) -> Self {
        MetaValue::Float(f)
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// 已写入的条目（创建后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub session_id: SessionId,
    pub sequence_no: SequenceNo,
    pub author_id: String,
    pub content: Content,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub ttl: Option<Duration>,
}

impl Entry {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    /// 恰好到达过期边界即视为过期（created_at + ttl <= now）
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(false, |at| at <= now)
    }

    pub fn related_key(&self) -> Option<&str> {
        self.metadata.get(RELATED_KEY).and_then(MetaValue::as_str)
    }
}

/// 待追加的条目草稿；序号与时间戳由存储分配
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub author_id: String,
    pub content: Content,
    pub metadata: Metadata,
    pub ttl: Option<Duration>,
}

impl NewEntry {
    pub fn new(author_id: impl Into<String>, content: impl Into<Content>) -> Self {
        Self {
            author_id: author_id.into(),
            content: content.into(),
            metadata: Metadata::new(),
            ttl: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// 设置 related_key，使普通 append 也遮蔽该逻辑键
    pub fn with_related_key(self, key: impl Into<String>) -> Self {
        self.with_metadata(RELATED_KEY, key.into())
    }

    pub(crate) fn related_key(&self) -> Option<&str> {
        self.metadata
            .get(RELATED_KEY)
            .and_then(MetaValue::as_str)
            .filter(|k| !k.is_empty())
    }
}

/// 按游标、作者、元数据过滤读取
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub after: Option<SequenceNo>,
    pub limit: Option<usize>,
    pub author_id: Option<String>,
    pub metadata: Vec<(String, MetaValue)>,
}

impl EntryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after(mut self, sequence_no: SequenceNo) -> Self {
        self.after = Some(sequence_no);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = Some(author_id.into());
        self
    }

    pub fn metadata_eq(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    pub(crate) fn matches(&self, entry: &Entry) -> bool {
        if entry.sequence_no <= self.after.unwrap_or(0) {
            return false;
        }
        if let Some(author) = &self.author_id {
            if &entry.author_id != author {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(k, v)| entry.metadata.get(k) == Some(v))
    }
}
