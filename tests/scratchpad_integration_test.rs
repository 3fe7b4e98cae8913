//! 草稿本集成测试：追加序号、软重置、分支隔离、提交与丢弃

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use hive::core::StoreError;
    use hive::memory::{BranchManager, ManualClock, NewEntry, SessionStore};

    fn manager() -> BranchManager {
        BranchManager::new(Arc::new(SessionStore::new()), "base")
    }

    #[test]
    fn test_append_assigns_gap_free_sequence() {
        let store = SessionStore::new();
        for i in 0..5 {
            store.append("s", NewEntry::new("agent", format!("note {i}"))).unwrap();
        }
        let all = store.read("s", None, None);
        let seqs: Vec<u64> = all.iter().map(|e| e.sequence_no).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        let tail = store.read("s", Some(3), None);
        assert_eq!(tail.iter().map(|e| e.sequence_no).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_lose_nothing() {
        let store = Arc::new(SessionStore::new());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    store
                        .append("shared", NewEntry::new(format!("w{worker}"), format!("{i}")))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let entries = store.read("shared", None, None);
        assert_eq!(entries.len(), 200);
        assert!(entries.iter().enumerate().all(|(i, e)| e.sequence_no == i as u64 + 1));
    }

    #[test]
    fn test_clear_restarts_sequencing() {
        let store = SessionStore::new();
        store.append("s", NewEntry::new("a", "old")).unwrap();
        store.append("s", NewEntry::new("a", "older")).unwrap();
        store.clear("s");

        let fresh = store.append("s", NewEntry::new("a", "new")).unwrap();
        assert_eq!(fresh.sequence_no, 1);
        let all = store.read("s", None, None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content.as_text(), Some("new"));
    }

    #[test]
    fn test_ttl_hides_expired_entries() {
        let clock = ManualClock::default();
        let store = SessionStore::new().with_clock(Arc::new(clock.clone()));
        store
            .append("s", NewEntry::new("a", "short").with_ttl(Duration::from_secs(10)))
            .unwrap();
        store.append("s", NewEntry::new("a", "forever")).unwrap();

        clock.advance(Duration::from_secs(11));
        let visible = store.read("s", None, None);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content.as_text(), Some("forever"));
        assert_eq!(store.compact(), 1);
    }

    #[test]
    fn test_branch_isolation_and_commit() {
        let bm = manager();
        bm.write("base", Some("x"), NewEntry::new("a", "base value")).unwrap();
        let child = bm.fork("base").unwrap();

        bm.write(&child, Some("x"), NewEntry::new("b", "draft 1")).unwrap();
        bm.write(&child, Some("x"), NewEntry::new("b", "draft 2")).unwrap();
        bm.write(&child, Some("y"), NewEntry::new("b", "other")).unwrap();

        assert_eq!(bm.resolve("base", "x").unwrap().content.as_text(), Some("base value"));
        assert_eq!(bm.resolve(&child, "x").unwrap().content.as_text(), Some("draft 2"));

        let before = bm.store().head("base").unwrap();
        let summary = bm.commit(&child).unwrap();
        assert_eq!(summary.keys, vec!["x".to_string(), "y".to_string()]);
        // 每个遮蔽键只写入一条
        assert_eq!(bm.store().head("base").unwrap(), before + 2);
        assert_eq!(bm.resolve("base", "x").unwrap().content.as_text(), Some("draft 2"));

        assert_eq!(bm.commit(&child), Err(StoreError::BranchClosed(child.clone())));
    }

    #[test]
    fn test_discard_leaves_parent_untouched() {
        let bm = manager();
        bm.write("base", Some("k"), NewEntry::new("a", "v")).unwrap();
        let before = bm.store().read("base", None, None);

        let child = bm.fork("base").unwrap();
        bm.write(&child, Some("k"), NewEntry::new("b", "scratch")).unwrap();
        bm.discard(&child).unwrap();

        assert!(bm.store().read(&child, None, None).is_empty());
        assert_eq!(bm.resolve(&child, "k"), Err(StoreError::BranchClosed(child.clone())));
        assert_eq!(bm.store().read("base", None, None), before);
        assert_eq!(bm.discard("base"), Err(StoreError::RootBranch("base".to_string())));
    }

    #[test]
    fn test_sibling_commits_append_in_commit_order() {
        let bm = manager();
        let left = bm.fork("base").unwrap();
        let right = bm.fork("base").unwrap();
        bm.write(&left, Some("x"), NewEntry::new("left", "L")).unwrap();
        bm.write(&right, Some("x"), NewEntry::new("right", "R")).unwrap();

        bm.commit(&left).unwrap();
        bm.commit(&right).unwrap();

        let base = bm.store().read("base", None, None);
        assert_eq!(base.len(), 2);
        assert_eq!(bm.resolve("base", "x").unwrap().author_id, "right");
    }
}
