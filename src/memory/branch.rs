//! 分支管理：基于会话存储的写时复制分支
//!
//! fork 只登记父链接与空遮蔽表，从不复制父会话数据；写入总是落在子会话，
//! resolve 沿「子 -> 父 -> … -> 根」查找第一个遮蔽该键的条目，绝不读取兄弟分支。
//! commit 只合并一层（写入直接父会话），冲突策略为「后提交者胜」：
//! 两个兄弟分支提交同一个键，结果是父会话中的两次顺序追加，不做合并。

use std::sync::Arc;

use serde::Serialize;

use crate::core::StoreError;
use crate::memory::{Entry, NewEntry, SequenceNo, SessionId, SessionStatus, SessionStore};

/// 提交结果：写入父会话的条目数与键（按子分支写入顺序）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub branch: SessionId,
    pub parent: SessionId,
    pub count: usize,
    pub keys: Vec<String>,
}

/// 分支管理器：持有存储句柄与指定的根会话
pub struct BranchManager {
    store: Arc<SessionStore>,
    root: SessionId,
}

impl BranchManager {
    pub fn new(store: Arc<SessionStore>, root: impl Into<SessionId>) -> Self {
        let root = root.into();
        store.open(&root);
        Self { store, root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// 从父会话分出新分支，返回子会话 ID
    pub fn fork(&self, parent: &str) -> Result<SessionId, StoreError> {
        let handle = match self.store.handle(parent) {
            Some(handle) => handle,
            None if parent == self.root => {
                self.store.open(parent);
                self.store
                    .handle(parent)
                    .ok_or_else(|| StoreError::UnknownParent(parent.to_string()))?
            }
            None => return Err(StoreError::UnknownParent(parent.to_string())),
        };
        if !handle.lock().is_open() {
            return Err(StoreError::BranchClosed(parent.to_string()));
        }

        let child = format!("branch_{}", uuid::Uuid::new_v4());
        self.store.insert_child(&child, parent);
        tracing::info!(parent, branch = %child, "Branch forked");
        Ok(child)
    }

    /// 写入分支并更新遮蔽表。
    /// key 为空时退回使用元数据 related_key；两者都没有则条目不被遮蔽，只出现在该会话的显式读取中。
    pub fn write(
        &self,
        session_id: &str,
        key: Option<&str>,
        entry: NewEntry,
    ) -> Result<Entry, StoreError> {
        if session_id != self.root && !self.store.exists(session_id) {
            return Err(StoreError::UnknownSession(session_id.to_string()));
        }
        let key = key
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .or_else(|| entry.related_key().map(str::to_string));
        self.store
            .append_keyed(session_id, key.as_deref(), entry)
            .map_err(|e| match e {
                StoreError::InvalidSession(id) => StoreError::BranchClosed(id),
                other => other,
            })
    }

    /// 沿父链查找键；过期的遮蔽条目视为逻辑删除，继续向父会话查找
    pub fn resolve(&self, session_id: &str, key: &str) -> Result<Entry, StoreError> {
        let now = self.store.now();
        let mut current = Some(session_id.to_string());

        while let Some(id) = current {
            let handle = self.store.handle(&id).ok_or_else(|| StoreError::NotFound {
                session: session_id.to_string(),
                key: key.to_string(),
            })?;
            let log = handle.lock();
            if log.status == SessionStatus::Discarded {
                return Err(StoreError::BranchClosed(id));
            }
            if let Some(entry) = log.shadows.get(key).and_then(|seq| log.entry(*seq)) {
                if !entry.is_expired_at(now) {
                    return Ok(entry.clone());
                }
            }
            current = log.parent.clone();
        }

        Err(StoreError::NotFound {
            session: session_id.to_string(),
            key: key.to_string(),
        })
    }

    /// 当前分支遮蔽的键（按写入顺序）
    pub fn shadow_keys(&self, session_id: &str) -> Result<Vec<String>, StoreError> {
        let handle = self
            .store
            .handle(session_id)
            .ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))?;
        let log = handle.lock();
        let mut keys: Vec<(String, SequenceNo)> =
            log.shadows.iter().map(|(k, s)| (k.clone(), *s)).collect();
        keys.sort_by_key(|(_, seq)| *seq);
        Ok(keys.into_iter().map(|(k, _)| k).collect())
    }

    /// 会话到根的链（含自身）
    pub fn lineage(&self, session_id: &str) -> Vec<SessionId> {
        let mut chain = Vec::new();
        let mut current = Some(session_id.to_string());
        while let Some(id) = current {
            current = self.store.parent_of(&id);
            chain.push(id);
        }
        chain
    }

    /// 将子分支每个遮蔽键的最新条目作为新条目追加到直接父会话，然后关闭子分支。
    ///
    /// 子、父会话锁按「子 -> 父」顺序获取，整个提交在两把锁内完成。
    pub fn commit(&self, child_id: &str) -> Result<CommitSummary, StoreError> {
        let child_handle = self
            .store
            .handle(child_id)
            .ok_or_else(|| StoreError::UnknownSession(child_id.to_string()))?;
        let mut child = child_handle.lock();
        let parent_id = child
            .parent
            .clone()
            .ok_or_else(|| StoreError::RootBranch(child_id.to_string()))?;
        if !child.is_open() {
            return Err(StoreError::BranchClosed(child_id.to_string()));
        }

        let parent_handle = self
            .store
            .handle(&parent_id)
            .ok_or_else(|| StoreError::UnknownParent(parent_id.clone()))?;
        let mut parent = parent_handle.lock();
        if !parent.is_open() {
            return Err(StoreError::BranchClosed(parent_id));
        }

        let now = self.store.now();
        let mut shadowed: Vec<(String, SequenceNo)> =
            child.shadows.iter().map(|(k, s)| (k.clone(), *s)).collect();
        shadowed.sort_by_key(|(_, seq)| *seq);

        let mut keys = Vec::with_capacity(shadowed.len());
        for (key, seq) in shadowed {
            let Some(entry) = child.entry(seq) else {
                continue;
            };
            if entry.is_expired_at(now) {
                continue;
            }
            let draft = NewEntry {
                author_id: entry.author_id.clone(),
                content: entry.content.clone(),
                metadata: entry.metadata.clone(),
                ttl: entry.ttl,
            };
            parent.push(draft, Some(&key), now);
            keys.push(key);
        }
        child.status = SessionStatus::Committed;

        tracing::info!(branch = child_id, parent = %parent_id, count = keys.len(), "Branch committed");
        Ok(CommitSummary {
            branch: child_id.to_string(),
            parent: parent_id,
            count: keys.len(),
            keys,
        })
    }

    /// 丢弃分支：不触碰父会话，条目保留到 compact；幂等
    pub fn discard(&self, child_id: &str) -> Result<(), StoreError> {
        let Some(handle) = self.store.handle(child_id) else {
            return Ok(());
        };
        let mut log = handle.lock();
        if log.parent.is_none() {
            return Err(StoreError::RootBranch(child_id.to_string()));
        }
        if log.status == SessionStatus::Discarded {
            return Ok(());
        }
        log.status = SessionStatus::Discarded;
        log.shadows.clear();
        tracing::info!(branch = child_id, "Branch discarded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> BranchManager {
        BranchManager::new(Arc::new(SessionStore::new()), "base")
    }

    fn text(entry: &Entry) -> &str {
        entry.content.as_text().unwrap_or_default()
    }

    #[test]
    fn test_fork_unknown_parent_fails() {
        let bm = manager();
        assert_eq!(
            bm.fork("nope"),
            Err(StoreError::UnknownParent("nope".to_string()))
        );
        assert!(bm.fork("base").is_ok());
    }

    #[test]
    fn test_branch_isolation_from_parent() {
        let bm = manager();
        bm.write("base", Some("x"), NewEntry::new("a", "base-x")).unwrap();
        let child = bm.fork("base").unwrap();
        bm.write(&child, Some("x"), NewEntry::new("a", "child-x")).unwrap();

        assert_eq!(text(&bm.resolve("base", "x").unwrap()), "base-x");
        assert_eq!(text(&bm.resolve(&child, "x").unwrap()), "child-x");
    }

    #[test]
    fn test_resolve_falls_through_chain() {
        let bm = manager();
        bm.write("base", Some("root-key"), NewEntry::new("a", "from-root")).unwrap();
        let child = bm.fork("base").unwrap();
        let grandchild = bm.fork(&child).unwrap();

        assert_eq!(text(&bm.resolve(&grandchild, "root-key").unwrap()), "from-root");
        assert!(matches!(
            bm.resolve(&grandchild, "missing"),
            Err(StoreError::NotFound { .. })
        ));
        assert_eq!(bm.lineage(&grandchild), vec![grandchild.clone(), child, "base".to_string()]);
    }

    #[test]
    fn test_siblings_never_see_each_other() {
        let bm = manager();
        let a = bm.fork("base").unwrap();
        let b = bm.fork("base").unwrap();
        bm.write(&a, Some("x"), NewEntry::new("a", "from-a")).unwrap();
        assert!(matches!(bm.resolve(&b, "x"), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_unkeyed_write_is_not_resolvable() {
        let bm = manager();
        let child = bm.fork("base").unwrap();
        bm.write(&child, None, NewEntry::new("a", "note")).unwrap();
        bm.write(&child, Some(""), NewEntry::new("a", "note2")).unwrap();
        assert!(bm.shadow_keys(&child).unwrap().is_empty());
        assert_eq!(bm.store().read(&child, None, None).len(), 2);
    }

    #[test]
    fn test_related_key_metadata_shadows() {
        let bm = manager();
        let child = bm.fork("base").unwrap();
        bm.write(&child, None, NewEntry::new("a", "v").with_related_key("k")).unwrap();
        assert_eq!(text(&bm.resolve(&child, "k").unwrap()), "v");
    }

    #[test]
    fn test_commit_writes_latest_per_key_only() {
        let bm = manager();
        let child = bm.fork("base").unwrap();
        bm.write(&child, Some("x"), NewEntry::new("coder", "x1")).unwrap();
        bm.write(&child, Some("y"), NewEntry::new("coder", "y1").with_metadata("lang", "rust"))
            .unwrap();
        bm.write(&child, Some("x"), NewEntry::new("coder", "x2")).unwrap();

        let summary = bm.commit(&child).unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.keys, vec!["y".to_string(), "x".to_string()]);

        let base = bm.store().read("base", None, None);
        assert_eq!(base.len(), 2);
        assert_eq!(base[0].sequence_no, 1);
        assert_eq!(base[0].metadata.get("lang"), Some(&crate::memory::MetaValue::from("rust")));
        assert_eq!(base[1].author_id, "coder");
        assert_eq!(text(&bm.resolve("base", "x").unwrap()), "x2");

        assert_eq!(bm.commit(&child), Err(StoreError::BranchClosed(child.clone())));
        assert_eq!(
            bm.write(&child, Some("x"), NewEntry::new("coder", "late")).unwrap_err(),
            StoreError::BranchClosed(child)
        );
    }

    #[test]
    fn test_commit_root_fails() {
        let bm = manager();
        assert_eq!(bm.commit("base"), Err(StoreError::RootBranch("base".to_string())));
        assert_eq!(bm.discard("base"), Err(StoreError::RootBranch("base".to_string())));
    }

    #[test]
    fn test_commit_is_single_hop() {
        let bm = manager();
        let child = bm.fork("base").unwrap();
        let grandchild = bm.fork(&child).unwrap();
        bm.write(&grandchild, Some("k"), NewEntry::new("a", "deep")).unwrap();

        bm.commit(&grandchild).unwrap();
        assert_eq!(text(&bm.resolve(&child, "k").unwrap()), "deep");
        assert!(bm.resolve("base", "k").is_err());

        bm.commit(&child).unwrap();
        assert_eq!(text(&bm.resolve("base", "k").unwrap()), "deep");
    }

    #[test]
    fn test_sibling_commits_last_committer_wins() {
        let bm = manager();
        let a = bm.fork("base").unwrap();
        let b = bm.fork("base").unwrap();
        bm.write(&a, Some("x"), NewEntry::new("a", "from-a")).unwrap();
        bm.write(&b, Some("x"), NewEntry::new("b", "from-b")).unwrap();

        bm.commit(&a).unwrap();
        bm.commit(&b).unwrap();
        assert_eq!(bm.store().read("base", None, None).len(), 2);
        assert_eq!(text(&bm.resolve("base", "x").unwrap()), "from-b");
    }

    #[test]
    fn test_discard_is_idempotent_and_leaves_parent() {
        let bm = manager();
        bm.write("base", Some("x"), NewEntry::new("a", "base")).unwrap();
        let before = bm.store().read("base", None, None);

        let child = bm.fork("base").unwrap();
        bm.write(&child, Some("x"), NewEntry::new("a", "child")).unwrap();
        bm.discard(&child).unwrap();
        bm.discard(&child).unwrap();

        assert!(bm.store().read(&child, None, None).is_empty());
        assert_eq!(bm.resolve(&child, "x"), Err(StoreError::BranchClosed(child.clone())));
        assert_eq!(bm.commit(&child), Err(StoreError::BranchClosed(child.clone())));
        assert_eq!(bm.store().read("base", None, None), before);
        assert!(bm.fork(&child).is_err());
        assert_eq!(bm.store().compact(), 1);
    }

    #[test]
    fn test_write_unknown_session_fails() {
        let bm = manager();
        assert_eq!(
            bm.write("ghost", Some("k"), NewEntry::new("a", "v")).unwrap_err(),
            StoreError::UnknownSession("ghost".to_string())
        );
    }
}
