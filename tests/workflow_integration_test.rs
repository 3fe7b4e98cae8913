//! 流程集成测试：顺序链、并行扇出（等待全部）、嵌套

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use serde_json::json;

    use hive::core::{AgentError, TaskScheduler};
    use hive::memory::SessionStore;
    use hive::workflow::FlowError;
    use hive::{BranchManager, FlowBuilder, FlowRunner, TaskContext, TaskValue};

    fn ctx() -> TaskContext {
        TaskContext::new(Arc::new(BranchManager::new(Arc::new(SessionStore::new()), "base")))
    }

    fn runner() -> FlowRunner {
        FlowRunner::new(Arc::new(TaskScheduler::new(8)))
    }

    #[tokio::test]
    async fn test_double_then_increment() {
        let flow = FlowBuilder::sequential("math")
            .step("double", |v: TaskValue, _ctx| async move {
                Ok::<_, AgentError>(json!(v.as_i64().unwrap_or_default() * 2))
            })
            .step("increment", |v: TaskValue, _ctx| async move {
                Ok::<_, AgentError>(json!(v.as_i64().unwrap_or_default() + 1))
            })
            .build();

        let out = runner().run(&flow, json!(3), &ctx()).await.unwrap();
        assert_eq!(out, json!(7));

        let empty = FlowBuilder::sequential("noop").build();
        assert_eq!(runner().run(&empty, json!(3), &ctx()).await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_parallel_failure_waits_for_siblings() {
        let finished: Arc<Mutex<Vec<(&'static str, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let failed_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        let slow = |name: &'static str, finished: Arc<Mutex<Vec<(&'static str, Instant)>>>| {
            move |v: TaskValue, _ctx: TaskContext| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    finished.lock().push((name, Instant::now()));
                    Ok::<_, AgentError>(v)
                }
            }
        };
        let failed_marker = failed_at.clone();
        let flow = FlowBuilder::parallel("fanout")
            .step("one", slow("one", finished.clone()))
            .step("two", move |_v: TaskValue, _ctx: TaskContext| {
                let failed_marker = failed_marker.clone();
                async move {
                    *failed_marker.lock() = Some(Instant::now());
                    Err::<TaskValue, _>(AgentError::TaskFailed("bad input".into()))
                }
            })
            .step("three", slow("three", finished.clone()))
            .build();

        let err = runner().run(&flow, json!("x"), &ctx()).await.unwrap_err();
        let flow_err = match err {
            AgentError::Flow(flow_err) => flow_err,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(flow_err.failed_tasks(), vec!["two"]);
        match flow_err.as_ref() {
            FlowError::ParallelFailed { total, failures } => {
                assert_eq!(*total, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index, 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        let finished = finished.lock();
        assert_eq!(finished.len(), 2);
        let failed_at = failed_at.lock().unwrap();
        assert!(finished.iter().all(|(_, at)| *at > failed_at));
    }

    #[tokio::test]
    async fn test_nested_parallel_blocks_chain() {
        let flow = FlowBuilder::sequential("outer")
            .nest(
                FlowBuilder::parallel("inner")
                    .step("a", |v: TaskValue, _ctx| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, AgentError>(json!(v.as_i64().unwrap_or_default() + 1))
                    })
                    .step("b", |v: TaskValue, _ctx| async move {
                        Ok::<_, AgentError>(json!(v.as_i64().unwrap_or_default() + 2))
                    }),
            )
            .step("sum", |v: TaskValue, _ctx| async move {
                let total: i64 = v
                    .as_array()
                    .map(|items| items.iter().filter_map(|i| i.as_i64()).sum())
                    .unwrap_or_default();
                Ok::<_, AgentError>(json!(total))
            })
            .build();

        let out = runner().run(&flow, json!(10), &ctx()).await.unwrap();
        assert_eq!(out, json!(23));
    }
}
