//! 自适应编排器：规划 -> 按依赖图调度 -> 收集 -> 综合
//!
//! 一次运行的状态机：
//! - Planning：把目标与专家列表交给 Planner，计划编译为依赖图（规划失败直接终止）
//! - Dispatching / Collecting：依赖全部成功的节点并发执行（共享 TaskScheduler 准入门），
//!   失败节点的所有下游节点直接标记为 DependencyFailure，互不依赖的兄弟节点继续执行
//! - Synthesizing：所有节点终结后，把成功输出交给 Synthesizer；无节点成功时跳过综合
//!
//! 隔离节点每次尝试都在新分支中执行：成功后收集遮蔽键并（按配置）提交回根会话，
//! 失败、超时或取消时丢弃分支，不留下未提交的孤立状态。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{value_text, AgentTask, TaskContext, TaskValue};
use crate::config::AppConfig;
use crate::core::{run_with_deadline, AgentError, RecoveryAction, RecoveryEngine, RunSupervisor, TaskScheduler};
use crate::memory::{BranchManager, SessionId};
use crate::orchestrator::{
    compile_plan, LastOutputSynthesizer, NodeError, NodeFailure, NodeOutput, NodeStatus, OrchestratorError,
    OrchestratorEvent, PlanDocument, PlanError, Planner, RunOutcome, RunPhase, RunReport, SpecialistRegistry,
    Synthesizer, TaskNode,
};
use crate::workflow::{NodeIndex, TaskGraph};

/// 编排策略（来自 [orchestrator] 配置段）
#[derive(Debug, Clone)]
struct Policy {
    branch_isolation: bool,
    node_timeout: Option<Duration>,
    allow_partial_synthesis: bool,
    commit_branches_on_success: bool,
}

impl From<&AppConfig> for Policy {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            branch_isolation: cfg.orchestrator.default_branch_isolation,
            node_timeout: cfg.orchestrator.per_node_timeout(),
            allow_partial_synthesis: cfg.orchestrator.allow_partial_synthesis,
            commit_branches_on_success: cfg.orchestrator.commit_branches_on_success,
        }
    }
}

/// 单个节点执行完毕（含全部重试）的结果
struct NodeRun {
    index: NodeIndex,
    attempts: u32,
    branch: Option<SessionId>,
    result: Result<(TaskValue, Vec<String>), NodeError>,
}

/// 单次尝试的结果：所用分支 + 输出与遮蔽键
type AttemptResult = (Option<SessionId>, Result<(TaskValue, Vec<String>), AgentError>);

/// 运行中的可变状态
struct RunState {
    run_id: String,
    objective: String,
    plan: Option<PlanDocument>,
    nodes: Vec<TaskNode>,
    phases: Vec<RunPhase>,
}

/// 自适应编排器；可被多个运行并发共享
pub struct AdaptiveOrchestrator {
    planner: Arc<dyn Planner>,
    registry: SpecialistRegistry,
    scratchpad: Arc<BranchManager>,
    synthesizer: Arc<dyn Synthesizer>,
    scheduler: Arc<TaskScheduler>,
    supervisor: Arc<RunSupervisor>,
    recovery: RecoveryEngine,
    policy: Policy,
    event_tx: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl AdaptiveOrchestrator {
    pub fn builder(planner: Arc<dyn Planner>, scratchpad: Arc<BranchManager>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(planner, scratchpad)
    }

    pub fn registry(&self) -> &SpecialistRegistry {
        &self.registry
    }

    pub fn scratchpad(&self) -> &Arc<BranchManager> {
        &self.scratchpad
    }

    /// 与 FlowRunner 共享准入门时使用
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// 通过 RunStarted 事件中的 run_id 取消单次运行
    pub fn supervisor(&self) -> &Arc<RunSupervisor> {
        &self.supervisor
    }

    fn emit(&self, ev: OrchestratorEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn enter(&self, run: &mut RunState, phase: RunPhase) {
        tracing::info!(run_id = %run.run_id, ?phase, "Run phase");
        run.phases.push(phase);
        self.emit(OrchestratorEvent::PhaseChanged {
            run_id: run.run_id.clone(),
            phase,
        });
    }

    pub async fn run(&self, objective: &str) -> RunReport {
        self.run_with_cancel(objective, None).await
    }

    /// 执行一次运行；cancel 为调用方的外部取消令牌
    pub async fn run_with_cancel(&self, objective: &str, cancel: Option<&CancellationToken>) -> RunReport {
        let run_id = format!("run_{}", uuid::Uuid::new_v4());
        let started_at = Utc::now();
        let token = self.supervisor.start_run(&run_id, cancel);
        tracing::info!(run_id = %run_id, specialists = self.registry.len(), "Run started");
        self.emit(OrchestratorEvent::RunStarted {
            run_id: run_id.clone(),
            objective: objective.to_string(),
        });

        let mut run = RunState {
            run_id,
            objective: objective.to_string(),
            plan: None,
            nodes: Vec::new(),
            phases: Vec::new(),
        };
        let outcome = self.drive(&mut run, &token).await;
        self.supervisor.finish_run(&run.run_id);

        let terminal = match &outcome {
            RunOutcome::Failed(err) => {
                tracing::warn!(run_id = %run.run_id, error = %err, "Run failed");
                RunPhase::Failed
            }
            RunOutcome::PartialSuccess { failures, .. } => {
                tracing::warn!(run_id = %run.run_id, failed = failures.len(), "Run finished with partial success");
                RunPhase::Succeeded
            }
            RunOutcome::Succeeded(_) => {
                tracing::info!(run_id = %run.run_id, "Run succeeded");
                RunPhase::Succeeded
            }
        };
        self.enter(&mut run, terminal);

        RunReport {
            run_id: run.run_id,
            objective: run.objective,
            plan: run.plan,
            nodes: run.nodes,
            phases: run.phases,
            outcome,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn drive(&self, run: &mut RunState, token: &CancellationToken) -> RunOutcome {
        self.enter(run, RunPhase::Planning);
        let (plan, mut graph) = match self.plan(&run.objective, token).await {
            Ok(planned) => planned,
            Err(err) => return RunOutcome::Failed(err),
        };

        let mut tasks = Vec::with_capacity(plan.steps.len());
        for (index, step) in plan.steps.iter().enumerate() {
            let Some(task) = self.registry.resolve(&step.assigned_agent_name) else {
                return RunOutcome::Failed(PlanError::NoSpecialists.into());
            };
            run.nodes.push(TaskNode::new(
                index,
                step.id.clone(),
                task.name(),
                step.description.clone(),
                graph.dependencies(index).to_vec(),
            ));
            tasks.push(task);
        }
        tracing::info!(run_id = %run.run_id, steps = plan.steps.len(), "Plan created");
        self.emit(OrchestratorEvent::PlanCreated {
            run_id: run.run_id.clone(),
            steps: plan.steps.len(),
        });
        run.plan = Some(plan);

        self.dispatch(run, &mut graph, &tasks, token).await;
        self.conclude(run, token).await
    }

    /// 规划并编译依赖图；等待规划期间可被取消
    async fn plan(
        &self,
        objective: &str,
        token: &CancellationToken,
    ) -> Result<(PlanDocument, TaskGraph), OrchestratorError> {
        if self.registry.is_empty() {
            return Err(PlanError::NoSpecialists.into());
        }
        let specialists = self.registry.infos();
        let plan = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(OrchestratorError::Cancelled { failures: Vec::new() }),
            plan = self.planner.plan(objective, &specialists) => plan?,
        };
        let graph = compile_plan(&plan)?;
        Ok((plan, graph))
    }

    async fn dispatch(
        &self,
        run: &mut RunState,
        graph: &mut TaskGraph,
        tasks: &[Arc<dyn AgentTask>],
        token: &CancellationToken,
    ) {
        self.enter(run, RunPhase::Dispatching);
        let mut in_flight = FuturesUnordered::new();
        for index in graph.roots() {
            in_flight.push(self.launch(run, index, Arc::clone(&tasks[index]), token));
        }
        self.enter(run, RunPhase::Collecting);

        while let Some(done) = in_flight.next().await {
            let index = done.index;
            let succeeded = done.result.is_ok();
            self.record(run, done);

            if succeeded {
                let ready = graph.mark_succeeded(index);
                if token.is_cancelled() {
                    continue;
                }
                for next in ready {
                    if run.nodes[next].status == NodeStatus::Pending {
                        in_flight.push(self.launch(run, next, Arc::clone(&tasks[next]), token));
                    }
                }
            } else {
                for dependent in graph.transitive_dependents(index) {
                    let node = &mut run.nodes[dependent];
                    if node.status != NodeStatus::Pending {
                        continue;
                    }
                    node.fail(NodeError::DependencyFailure { dependency: index });
                    tracing::info!(run_id = %run.run_id, node = dependent, dependency = index, "Node skipped after dependency failure");
                    self.emit(OrchestratorEvent::NodeFinished {
                        run_id: run.run_id.clone(),
                        node: dependent,
                        status: NodeStatus::Failed,
                        error: node.error.as_ref().map(ToString::to_string),
                    });
                }
            }
        }

        // 取消后未能调度的节点
        for node in run.nodes.iter_mut().filter(|n| n.status == NodeStatus::Pending) {
            node.fail(NodeError::Cancelled);
        }
    }

    /// 标记节点为 Running 并返回其执行 future（只借用 self，运行状态留给调度循环）
    fn launch(
        &self,
        run: &mut RunState,
        index: NodeIndex,
        task: Arc<dyn AgentTask>,
        token: &CancellationToken,
    ) -> BoxFuture<'_, NodeRun> {
        let input = node_input(&run.objective, &run.nodes, index);
        let node = &mut run.nodes[index];
        node.status = NodeStatus::Running;
        node.started_at = Some(Utc::now());
        tracing::debug!(run_id = %run.run_id, node = index, specialist = %node.specialist, "Node dispatched");

        let run_id = run.run_id.clone();
        let token = token.clone();
        async move { self.execute_node(run_id, index, task, input, token).await }.boxed()
    }

    /// 执行节点，可重试错误按 RecoveryEngine 退避重试
    async fn execute_node(
        &self,
        run_id: String,
        index: NodeIndex,
        task: Arc<dyn AgentTask>,
        input: TaskValue,
        token: CancellationToken,
    ) -> NodeRun {
        let mut retries = 0u32;
        loop {
            let attempt = retries + 1;
            let (branch, result) = self.attempt(&run_id, index, &task, input.clone(), &token, attempt).await;
            let err = match result {
                Ok(output) => {
                    return NodeRun {
                        index,
                        attempts: attempt,
                        branch,
                        result: Ok(output),
                    }
                }
                Err(err) => err,
            };
            let finish = |error: NodeError| NodeRun {
                index,
                attempts: attempt,
                branch: branch.clone(),
                result: Err(error),
            };

            if token.is_cancelled() {
                return finish(NodeError::Cancelled);
            }
            match self.recovery.handle(&err, retries) {
                RecoveryAction::RetryAfter(delay) => {
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(run_id = %run_id, node = index, attempt, delay_ms, error = %err, "Node attempt failed, retrying");
                    self.emit(OrchestratorEvent::NodeRetrying {
                        run_id: run_id.clone(),
                        node: index,
                        attempt,
                        delay_ms,
                        reason: err.to_string(),
                    });
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return finish(NodeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retries += 1;
                }
                RecoveryAction::Abort => return finish(err.into()),
            }
        }
    }

    /// 单次尝试：获取许可 -> （隔离时）分叉 -> 在截止时间内执行 -> 提交或丢弃分支
    async fn attempt(
        &self,
        run_id: &str,
        index: NodeIndex,
        task: &Arc<dyn AgentTask>,
        input: TaskValue,
        token: &CancellationToken,
        attempt: u32,
    ) -> AttemptResult {
        let permit = match self.scheduler.acquire(token).await {
            Ok(permit) => permit,
            Err(err) => return (None, Err(err)),
        };
        let branch = if self.policy.branch_isolation {
            match self.scratchpad.fork(self.scratchpad.root()) {
                Ok(branch) => Some(branch),
                Err(err) => return (None, Err(err.into())),
            }
        } else {
            None
        };
        self.emit(OrchestratorEvent::NodeStarted {
            run_id: run_id.to_string(),
            node: index,
            specialist: task.name().to_string(),
            attempt,
            branch: branch.clone(),
        });

        let node_token = token.child_token();
        let mut ctx = TaskContext::new(Arc::clone(&self.scratchpad)).with_cancel(node_token.clone());
        if let Some(branch) = &branch {
            ctx = ctx.with_session(branch.clone());
        }
        let result = run_with_deadline(&node_token, self.policy.node_timeout, task.run(input, &ctx)).await;
        drop(permit);

        let Some(branch) = branch else {
            return (None, result.map(|value| (value, Vec::new())));
        };
        let settled = match result {
            Ok(value) => self.settle_branch(run_id, index, &branch).map(|keys| (value, keys)),
            Err(err) => Err(err),
        };
        if settled.is_err() {
            self.discard_branch(run_id, index, &branch);
        }
        (Some(branch), settled)
    }

    /// 收集成功分支的遮蔽键，并按配置提交回父会话
    fn settle_branch(&self, run_id: &str, index: NodeIndex, branch: &str) -> Result<Vec<String>, AgentError> {
        let keys = self.scratchpad.shadow_keys(branch)?;
        if self.policy.commit_branches_on_success {
            let summary = self.scratchpad.commit(branch)?;
            self.emit(OrchestratorEvent::BranchCommitted {
                run_id: run_id.to_string(),
                node: index,
                branch: branch.to_string(),
                keys: summary.keys,
            });
        }
        Ok(keys)
    }

    fn discard_branch(&self, run_id: &str, index: NodeIndex, branch: &str) {
        match self.scratchpad.discard(branch) {
            Ok(()) => self.emit(OrchestratorEvent::BranchDiscarded {
                run_id: run_id.to_string(),
                node: index,
                branch: branch.to_string(),
            }),
            Err(err) => tracing::warn!(run_id, node = index, branch, error = %err, "Branch discard failed"),
        }
    }

    fn record(&self, run: &mut RunState, done: NodeRun) {
        let node = &mut run.nodes[done.index];
        node.attempts = done.attempts;
        node.branch = done.branch;
        match done.result {
            Ok((value, keys)) => {
                node.status = NodeStatus::Succeeded;
                node.result = Some(value);
                node.shadow_keys = keys;
                node.finished_at = Some(Utc::now());
                tracing::info!(run_id = %run.run_id, node = done.index, attempts = done.attempts, "Node succeeded");
            }
            Err(err) => {
                tracing::warn!(run_id = %run.run_id, node = done.index, attempts = done.attempts, error = %err, "Node failed");
                node.fail(err);
            }
        }
        self.emit(OrchestratorEvent::NodeFinished {
            run_id: run.run_id.clone(),
            node: done.index,
            status: node.status,
            error: node.error.as_ref().map(ToString::to_string),
        });
    }

    /// 所有节点终结后决定运行结果
    async fn conclude(&self, run: &mut RunState, token: &CancellationToken) -> RunOutcome {
        let failures: Vec<NodeFailure> = run
            .nodes
            .iter()
            .filter_map(|node| {
                node.error.clone().map(|error| NodeFailure {
                    index: node.index,
                    step_id: node.step_id.clone(),
                    specialist: node.specialist.clone(),
                    error,
                })
            })
            .collect();
        let outputs: Vec<NodeOutput> = run
            .nodes
            .iter()
            .filter_map(|node| {
                node.result.clone().map(|output| NodeOutput {
                    index: node.index,
                    step_id: node.step_id.clone(),
                    specialist: node.specialist.clone(),
                    instruction: node.instruction.clone(),
                    output,
                })
            })
            .collect();

        if token.is_cancelled() {
            return RunOutcome::Failed(OrchestratorError::Cancelled { failures });
        }
        if outputs.is_empty() {
            return RunOutcome::Failed(OrchestratorError::AllNodesFailed { failures });
        }
        if !failures.is_empty() && !self.policy.allow_partial_synthesis {
            return RunOutcome::Failed(OrchestratorError::NodesFailed { failures });
        }

        self.enter(run, RunPhase::Synthesizing);
        let synthesized = tokio::select! {
            biased;
            _ = token.cancelled() => return RunOutcome::Failed(OrchestratorError::Cancelled { failures }),
            result = self.synthesizer.synthesize(&run.objective, &outputs, &failures) => result,
        };
        match synthesized {
            Ok(result) if failures.is_empty() => RunOutcome::Succeeded(result),
            Ok(result) => RunOutcome::PartialSuccess { result, failures },
            Err(err) => RunOutcome::Failed(OrchestratorError::SynthesisFailed(err)),
        }
    }
}

/// 节点输入：总目标、本步指令、直接依赖的输出
fn node_input(objective: &str, nodes: &[TaskNode], index: NodeIndex) -> TaskValue {
    let node = &nodes[index];
    let mut text = format!("Overall Goal: {objective}\nYour Task: {}\n", node.instruction);
    let context = node
        .dependencies
        .iter()
        .filter_map(|&dep| nodes.get(dep))
        .filter_map(|dep| {
            dep.result
                .as_ref()
                .map(|out| format!("Step {} Output:\n{}", dep.step_id, value_text(out)))
        })
        .collect::<Vec<_>>();
    if !context.is_empty() {
        text.push_str("Context from previous steps:\n");
        text.push_str(&context.join("\n---\n"));
    }
    TaskValue::String(text)
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    planner: Arc<dyn Planner>,
    scratchpad: Arc<BranchManager>,
    registry: SpecialistRegistry,
    synthesizer: Arc<dyn Synthesizer>,
    scheduler: Option<Arc<TaskScheduler>>,
    supervisor: Option<Arc<RunSupervisor>>,
    recovery: RecoveryEngine,
    max_concurrency: usize,
    policy: Policy,
    event_tx: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl OrchestratorBuilder {
    pub fn new(planner: Arc<dyn Planner>, scratchpad: Arc<BranchManager>) -> Self {
        let defaults = AppConfig::default();
        Self {
            planner,
            scratchpad,
            registry: SpecialistRegistry::new(),
            synthesizer: Arc::new(LastOutputSynthesizer),
            scheduler: None,
            supervisor: None,
            recovery: RecoveryEngine::from_config(&defaults),
            max_concurrency: defaults.orchestrator.max_concurrency,
            policy: Policy::from(&defaults),
            event_tx: None,
        }
    }

    /// 应用 [orchestrator] 与 [retry] 配置段
    pub fn config(mut self, cfg: &AppConfig) -> Self {
        self.recovery = RecoveryEngine::from_config(cfg);
        self.max_concurrency = cfg.orchestrator.max_concurrency;
        self.policy = Policy::from(cfg);
        self
    }

    pub fn specialist(mut self, task: Arc<dyn AgentTask>) -> Self {
        self.registry.register(task);
        self
    }

    pub fn registry(mut self, registry: SpecialistRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// 共享准入门（例如与 FlowRunner 共用）；不设置时按 max_concurrency 新建
    pub fn scheduler(mut self, scheduler: Arc<TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn supervisor(mut self, supervisor: Arc<RunSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn branch_isolation(mut self, isolated: bool) -> Self {
        self.policy.branch_isolation = isolated;
        self
    }

    pub fn node_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.policy.node_timeout = timeout;
        self
    }

    pub fn allow_partial_synthesis(mut self, allow: bool) -> Self {
        self.policy.allow_partial_synthesis = allow;
        self
    }

    pub fn commit_branches_on_success(mut self, commit: bool) -> Self {
        self.policy.commit_branches_on_success = commit;
        self
    }

    pub fn events(mut self, tx: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn build(self) -> AdaptiveOrchestrator {
        AdaptiveOrchestrator {
            planner: self.planner,
            registry: self.registry,
            scratchpad: self.scratchpad,
            synthesizer: self.synthesizer,
            scheduler: self
                .scheduler
                .unwrap_or_else(|| Arc::new(TaskScheduler::new(self.max_concurrency))),
            supervisor: self.supervisor.unwrap_or_default(),
            recovery: self.recovery,
            policy: self.policy,
            event_tx: self.event_tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use crate::agent::FnTask;
    use crate::core::StoreError;
    use crate::llm::LlmError;
    use crate::memory::{NewEntry, SessionStatus, SessionStore};
    use crate::orchestrator::{PlannedStep, StaticPlanner};

    fn scratchpad() -> Arc<BranchManager> {
        Arc::new(BranchManager::new(Arc::new(SessionStore::new()), "base"))
    }

    fn echo(name: &str) -> Arc<dyn AgentTask> {
        let label = name.to_string();
        FnTask::new(name, move |input: TaskValue, _ctx| {
            let label = label.clone();
            async move { Ok::<_, AgentError>(json!(format!("{label} <- {}", value_text(&input)))) }
        })
        .into_arc()
    }

    fn failing(name: &str) -> Arc<dyn AgentTask> {
        FnTask::new(name, |_input, _ctx| async move {
            Err::<TaskValue, _>(AgentError::TaskFailed("boom".into()))
        })
        .into_arc()
    }

    fn no_retry() -> RecoveryEngine {
        RecoveryEngine::no_retry()
    }

    #[tokio::test]
    async fn test_sequential_default_passes_context_forward() {
        let planner = Arc::new(StaticPlanner::sequence(&[("a", "collect"), ("b", "summarize")]));
        let orch = AdaptiveOrchestrator::builder(planner, scratchpad())
            .specialist(echo("a"))
            .specialist(echo("b"))
            .build();

        let report = orch.run("learn rust").await;
        assert!(report.outcome.is_success());
        assert_eq!(
            report.phases,
            vec![
                RunPhase::Planning,
                RunPhase::Dispatching,
                RunPhase::Collecting,
                RunPhase::Synthesizing,
                RunPhase::Succeeded
            ]
        );
        let last = value_text(report.outcome.result().unwrap());
        assert!(last.starts_with("b <- Overall Goal: learn rust\nYour Task: summarize"));
        assert!(last.contains("Step 1 Output:\na <- Overall Goal: learn rust"));
        assert!(orch.supervisor().active_runs().is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry_is_planning_error() {
        let planner = Arc::new(StaticPlanner::sequence(&[("a", "x")]));
        let report = AdaptiveOrchestrator::builder(planner, scratchpad()).build().run("goal").await;
        assert!(matches!(
            report.outcome,
            RunOutcome::Failed(OrchestratorError::PlanningError(PlanError::NoSpecialists))
        ));
        assert_eq!(report.phases, vec![RunPhase::Planning, RunPhase::Failed]);
    }

    #[tokio::test]
    async fn test_failure_propagates_only_along_edges() {
        let planner = Arc::new(StaticPlanner::new(vec![
            PlannedStep::new(1, "bad", "fail"),
            PlannedStep::new(2, "good", "independent").depends_on(&[]),
            PlannedStep::new(3, "good", "needs one").depends_on(&["1"]),
        ]));
        let orch = AdaptiveOrchestrator::builder(planner, scratchpad())
            .specialist(failing("bad"))
            .specialist(echo("good"))
            .recovery(no_retry())
            .build();

        let report = orch.run("goal").await;
        assert_eq!(report.nodes[1].status, NodeStatus::Succeeded);
        assert!(matches!(
            report.nodes[2].error,
            Some(NodeError::DependencyFailure { dependency: 0 })
        ));
        match &report.outcome {
            RunOutcome::PartialSuccess { failures, .. } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].step_id, "1");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_synthesis_disabled_fails_run() {
        let planner = Arc::new(StaticPlanner::new(vec![
            PlannedStep::new(1, "bad", "fail").depends_on(&[]),
            PlannedStep::new(2, "good", "ok").depends_on(&[]),
        ]));
        let orch = AdaptiveOrchestrator::builder(planner, scratchpad())
            .specialist(failing("bad"))
            .specialist(echo("good"))
            .recovery(no_retry())
            .allow_partial_synthesis(false)
            .build();

        let report = orch.run("goal").await;
        match report.into_result() {
            Err(OrchestratorError::NodesFailed { failures }) => assert_eq!(failures.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_nodes_failed_skips_synthesis() {
        let planner = Arc::new(StaticPlanner::sequence(&[("bad", "one"), ("bad", "two")]));
        let orch = AdaptiveOrchestrator::builder(planner, scratchpad())
            .specialist(failing("bad"))
            .recovery(no_retry())
            .build();

        let report = orch.run("goal").await;
        assert!(!report.phases.contains(&RunPhase::Synthesizing));
        match &report.outcome {
            RunOutcome::Failed(OrchestratorError::AllNodesFailed { failures }) => {
                assert_eq!(failures.len(), 2);
                assert!(matches!(failures[0].error, NodeError::Task(_)));
                assert!(matches!(failures[1].error, NodeError::DependencyFailure { dependency: 0 }));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = FnTask::new("flaky", move |_input, _ctx| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AgentError::LlmError(LlmError::RateLimited { retry_after_ms: 1 }))
                } else {
                    Ok(json!("done"))
                }
            }
        })
        .into_arc();
        let planner = Arc::new(StaticPlanner::sequence(&[("flaky", "try")]));
        let orch = AdaptiveOrchestrator::builder(planner, scratchpad())
            .specialist(flaky)
            .recovery(RecoveryEngine::new(2, Duration::from_millis(1), Duration::from_millis(5)))
            .build();

        let report = orch.run("goal").await;
        assert!(report.outcome.is_success());
        assert_eq!(report.nodes[0].attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_isolated_node_commits_shadow_keys() {
        let writer = FnTask::new("writer", |_input, ctx: TaskContext| async move {
            ctx.write(Some("draft"), NewEntry::new("writer", "v1"))?;
            ctx.write(Some("draft"), NewEntry::new("writer", "v2"))?;
            Ok::<_, AgentError>(json!("written"))
        })
        .into_arc();
        let bm = scratchpad();
        let planner = Arc::new(StaticPlanner::sequence(&[("writer", "draft it")]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orch = AdaptiveOrchestrator::builder(planner, bm.clone())
            .specialist(writer)
            .branch_isolation(true)
            .events(tx)
            .build();

        let report = orch.run("goal").await;
        assert!(report.outcome.is_success());
        let node = &report.nodes[0];
        assert_eq!(node.shadow_keys, vec!["draft".to_string()]);
        let branch = node.branch.clone().unwrap();
        assert_eq!(bm.resolve("base", "draft").unwrap().content.as_text(), Some("v2"));
        assert_eq!(bm.store().status(&branch), Some(SessionStatus::Committed));

        let mut committed = false;
        while let Ok(ev) = rx.try_recv() {
            if let OrchestratorEvent::BranchCommitted { keys, .. } = ev {
                committed = keys == vec!["draft".to_string()];
            }
        }
        assert!(committed);
    }

    #[tokio::test]
    async fn test_node_timeout_discards_branch() {
        let slow = FnTask::new("slow", |_input, ctx: TaskContext| async move {
            ctx.write(Some("partial"), NewEntry::new("slow", "half done"))?;
            ctx.cancel_token().cancelled().await;
            Err::<TaskValue, _>(AgentError::Cancelled)
        })
        .into_arc();
        let bm = scratchpad();
        let planner = Arc::new(StaticPlanner::sequence(&[("slow", "never ends")]));
        let orch = AdaptiveOrchestrator::builder(planner, bm.clone())
            .specialist(slow)
            .branch_isolation(true)
            .node_timeout(Some(Duration::from_millis(30)))
            .recovery(no_retry())
            .build();

        let report = orch.run("goal").await;
        let node = &report.nodes[0];
        assert!(matches!(node.error, Some(NodeError::Timeout(_))));
        let branch = node.branch.clone().unwrap();
        assert_eq!(bm.resolve(&branch, "partial"), Err(StoreError::BranchClosed(branch.clone())));
        assert!(bm.resolve("base", "partial").is_err());
    }

    #[tokio::test]
    async fn test_run_cancellation_discards_open_branch() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<SessionId>();
        let started_tx = Arc::new(parking_lot::Mutex::new(Some(started_tx)));
        let blocker = FnTask::new("blocker", move |_input, ctx: TaskContext| {
            let started_tx = started_tx.clone();
            async move {
                ctx.write(Some("wip"), NewEntry::new("blocker", "draft"))?;
                if let Some(tx) = started_tx.lock().take() {
                    let _ = tx.send(ctx.session_id().to_string());
                }
                ctx.cancel_token().cancelled().await;
                Err::<TaskValue, _>(AgentError::Cancelled)
            }
        })
        .into_arc();
        let bm = scratchpad();
        let planner = Arc::new(StaticPlanner::sequence(&[("blocker", "wait"), ("blocker", "never runs")]));
        let orch = AdaptiveOrchestrator::builder(planner, bm.clone())
            .specialist(blocker)
            .branch_isolation(true)
            .build();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            if started_rx.await.is_ok() {
                trigger.cancel();
            }
        });

        let report = orch.run_with_cancel("goal", Some(&cancel)).await;
        match &report.outcome {
            RunOutcome::Failed(OrchestratorError::Cancelled { failures }) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(report.nodes[0].error, Some(NodeError::Cancelled)));
        assert_eq!(report.nodes[1].attempts, 0);
        let branch = report.nodes[0].branch.clone().unwrap();
        assert_eq!(bm.resolve(&branch, "wip"), Err(StoreError::BranchClosed(branch.clone())));
        assert_eq!(report.final_phase(), Some(RunPhase::Failed));
    }
}
