//! 会话存储（Scratchpad）
//!
//! 按会话隔离、只追加、按序号排序的协作日志：
//! - append 在会话锁内分配下一个序号（无丢失更新，序号严格递增且无空洞）
//! - read 是轮询原语：调用方记住最后看到的序号，下次传入 after 只拿新条目
//! - TTL 在读取时惰性判定；compact 负责物理回收
//! - clear 是「软重置」：旧条目不再可读，之后的 append 从序号 1 重新开始

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::ScratchpadSection;
use crate::core::StoreError;
use crate::memory::{
    Clock, Entry, EntryFilter, NewEntry, SequenceNo, SessionId, SystemClock,
};

/// 会话状态；根会话永远是 Open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Open,
    /// 已提交回父会话，只读
    Committed,
    /// 已丢弃，条目不可读，等待回收
    Discarded,
}

/// 单个会话的日志与遮蔽表（同一把锁保护，追加与遮蔽指针更新原子）
#[derive(Debug)]
pub(crate) struct SessionLog {
    pub(crate) id: SessionId,
    pub(crate) parent: Option<SessionId>,
    pub(crate) status: SessionStatus,
    /// 逻辑键 -> 本会话内最近一次覆盖它的条目序号
    pub(crate) shadows: HashMap<String, SequenceNo>,
    entries: Vec<Entry>,
    next_sequence: SequenceNo,
}

impl SessionLog {
    pub(crate) fn new(id: SessionId, parent: Option<SessionId>) -> Self {
        Self {
            id,
            parent,
            status: SessionStatus::Open,
            shadows: HashMap::new(),
            entries: Vec::new(),
            next_sequence: 1,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    /// 分配序号并写入；shadow_key 非空时同时更新遮蔽表
    pub(crate) fn push(&mut self, draft: NewEntry, shadow_key: Option<&str>, now: DateTime<Utc>) -> Entry {
        let entry = Entry {
            session_id: self.id.clone(),
            sequence_no: self.next_sequence,
            author_id: draft.author_id,
            content: draft.content,
            metadata: draft.metadata,
            created_at: now,
            ttl: draft.ttl,
        };
        self.next_sequence += 1;
        if let Some(key) = shadow_key.filter(|k| !k.is_empty()) {
            self.shadows.insert(key.to_string(), entry.sequence_no);
        }
        self.entries.push(entry.clone());
        entry
    }

    pub(crate) fn entry(&self, sequence_no: SequenceNo) -> Option<&Entry> {
        self.entries
            .binary_search_by_key(&sequence_no, |e| e.sequence_no)
            .ok()
            .map(|idx| &self.entries[idx])
    }

    fn head(&self) -> SequenceNo {
        self.next_sequence - 1
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.shadows.clear();
        self.next_sequence = 1;
    }

    /// 物理删除过期条目；已丢弃会话删除全部条目
    fn compact(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        if self.status == SessionStatus::Discarded {
            self.entries.clear();
            self.shadows.clear();
            return before;
        }
        self.entries.retain(|e| !e.is_expired_at(now));
        let entries = &self.entries;
        self.shadows.retain(|_, seq| {
            entries
                .binary_search_by_key(seq, |e| e.sequence_no)
                .is_ok()
        });
        before - self.entries.len()
    }
}

/// 会话存储：session_id -> 会话日志（每个会话一把锁）
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionLog>>>>,
    clock: Arc<dyn Clock>,
    default_ttl: Option<Duration>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            default_ttl: None,
        }
    }

    pub fn from_config(cfg: &ScratchpadSection) -> Self {
        Self::new().with_default_ttl(cfg.default_ttl())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 未显式指定 TTL 的条目使用该默认值
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// 显式打开会话（不存在则创建）
    pub fn open(&self, session_id: &str) {
        self.get_or_create(session_id);
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.handle(session_id).map(|h| h.lock().status)
    }

    pub fn parent_of(&self, session_id: &str) -> Option<SessionId> {
        self.handle(session_id).and_then(|h| h.lock().parent.clone())
    }

    /// 最后分配的序号（空会话为 0）
    pub fn head(&self, session_id: &str) -> Option<SequenceNo> {
        self.handle(session_id).map(|h| h.lock().head())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// 追加条目并返回带序号的 Entry；会话已提交或丢弃时返回 InvalidSession。
    /// 元数据带 related_key 时同时遮蔽该逻辑键。
    pub fn append(&self, session_id: &str, entry: NewEntry) -> Result<Entry, StoreError> {
        let key = entry.related_key().map(str::to_string);
        self.append_keyed(session_id, key.as_deref(), entry)
    }

    pub(crate) fn append_keyed(
        &self,
        session_id: &str,
        shadow_key: Option<&str>,
        mut entry: NewEntry,
    ) -> Result<Entry, StoreError> {
        let handle = self.get_or_create(session_id);
        let mut log = handle.lock();
        if !log.is_open() {
            return Err(StoreError::InvalidSession(session_id.to_string()));
        }
        if entry.ttl.is_none() {
            entry.ttl = self.default_ttl;
        }
        let written = log.push(entry, shadow_key, self.clock.now());
        tracing::debug!(
            session = session_id,
            sequence_no = written.sequence_no,
            author = %written.author_id,
            "Scratchpad append"
        );
        Ok(written)
    }

    /// 返回 sequence_no > after（默认 0）且未过期的条目，按序号升序，最多 limit 条
    pub fn read(&self, session_id: &str, after: Option<SequenceNo>, limit: Option<usize>) -> Vec<Entry> {
        let filter = EntryFilter {
            after,
            limit,
            ..EntryFilter::default()
        };
        self.query(session_id, &filter)
    }

    /// 带过滤条件的读取；未知或已丢弃的会话返回空
    pub fn query(&self, session_id: &str, filter: &EntryFilter) -> Vec<Entry> {
        let Some(handle) = self.handle(session_id) else {
            return Vec::new();
        };
        let log = handle.lock();
        if log.status == SessionStatus::Discarded {
            return Vec::new();
        }
        let now = self.clock.now();
        let after = filter.after.unwrap_or(0);
        let start = log.entries.partition_point(|e| e.sequence_no <= after);
        let matching = log.entries[start..]
            .iter()
            .filter(|e| !e.is_expired_at(now) && filter.matches(e))
            .cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    /// 软重置：丢弃全部条目与遮蔽表，序号从 1 重新开始；会话状态不变
    pub fn clear(&self, session_id: &str) {
        if let Some(handle) = self.handle(session_id) {
            handle.lock().clear();
            tracing::info!(session = session_id, "Scratchpad cleared");
        }
    }

    /// 回收过期条目与已丢弃分支的条目，返回删除数
    pub fn compact(&self) -> usize {
        let now = self.clock.now();
        let handles: Vec<_> = self.sessions.read().values().cloned().collect();
        let removed: usize = handles.iter().map(|h| h.lock().compact(now)).sum();
        if removed > 0 {
            tracing::info!(removed, "Scratchpad compacted");
        }
        removed
    }

    pub(crate) fn handle(&self, session_id: &str) -> Option<Arc<Mutex<SessionLog>>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// 登记带父链接的新会话
    pub(crate) fn insert_child(&self, child_id: &str, parent_id: &str) {
        self.sessions.write().insert(
            child_id.to_string(),
            Arc::new(Mutex::new(SessionLog::new(
                child_id.to_string(),
                Some(parent_id.to_string()),
            ))),
        );
    }

    fn get_or_create(&self, session_id: &str) -> Arc<Mutex<SessionLog>> {
        if let Some(handle) = self.handle(session_id) {
            return handle;
        }
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionLog::new(session_id.to_string(), None))))
            .clone()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
