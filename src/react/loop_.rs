//! ReAct 主循环（显式状态机）
//!
//! Retrieving -> AwaitingModel -> ExecutingTool -> AwaitingModel … -> Done。
//! 每个挂起点（检索、推理、工具、退避等待）都与取消令牌 select，超时与取消语义由调度方统一施加。
//! 工具错误（未知工具、失败、超时）以工具结果文本回填给模型，不中止任务；
//! 推理错误经 RecoveryEngine 判定退避重试或终止。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{value_text, AgentTask, TaskContext, TaskValue};
use crate::config::{AgentSection, AppConfig};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::{LlmClient, LlmError, LlmResponse, ToolCall, ToolSchema};
use crate::memory::{LongTermMemory, Message, Metadata, NewEntry, NoopLongTerm};
use crate::react::{AgentEvent, AgentPhase};
use crate::tools::{ToolExecutor, ToolRegistry};

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

/// LLM 驱动的专家 Agent；可在多个运行间共享（对话历史按运行独立）
pub struct Agent {
    name: String,
    description: String,
    system_prompt: String,
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    memory: Arc<dyn LongTermMemory>,
    recovery: RecoveryEngine,
    max_turns: usize,
    retrieval_k: usize,
    auto_memory: bool,
    event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl Agent {
    pub fn builder(name: impl Into<String>, llm: Arc<dyn LlmClient>) -> AgentBuilder {
        AgentBuilder::new(name, llm)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send_event(&self, ev: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn enter(&self, phase: AgentPhase, turn: usize) {
        tracing::debug!(agent = %self.name, ?phase, turn, "Agent phase");
        self.send_event(AgentEvent::PhaseChanged {
            agent: self.name.clone(),
            phase,
            turn,
        });
    }

    /// 结果在分支中遮蔽的逻辑键（提交时随分支合并回父会话）
    pub fn result_key(&self) -> String {
        format!("{}:result", self.name)
    }

    /// 执行一个目标，返回最终答案
    pub async fn execute(&self, objective: &str, ctx: &TaskContext) -> Result<String, AgentError> {
        let cancel = ctx.cancel_token().clone();
        let schemas = self.executor.schemas();
        let mut history = vec![Message::system(self.system_prompt.clone())];
        let mut pending: Vec<ToolCall> = Vec::new();
        let mut turn = 0usize;
        let mut answer = String::new();

        ctx.write(
            None,
            NewEntry::new(&self.name, objective).with_metadata("type", "task_start"),
        )?;

        let mut phase = AgentPhase::Retrieving;
        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            self.enter(phase, turn);
            phase = match phase {
                AgentPhase::Retrieving => {
                    if let Some(context) = self.recall(objective, &cancel).await? {
                        history.push(Message::system(context));
                    }
                    history.push(Message::user(objective));
                    AgentPhase::AwaitingModel
                }
                AgentPhase::AwaitingModel => {
                    if turn >= self.max_turns {
                        return Err(AgentError::MaxTurnsReached(self.max_turns));
                    }
                    turn += 1;
                    let response = self.infer_with_retry(&history, &schemas, &cancel).await?;
                    if response.is_final() {
                        answer = response
                            .text
                            .map(|t| t.trim().to_string())
                            .filter(|t| !t.is_empty())
                            .ok_or_else(|| {
                                AgentError::LlmError(LlmError::InvalidResponse(
                                    "empty final answer".to_string(),
                                ))
                            })?;
                        history.push(Message::assistant(answer.clone()));
                        AgentPhase::Done
                    } else {
                        pending = response.tool_calls.clone();
                        history.push(Message::assistant_tool_calls(
                            response.text.unwrap_or_default(),
                            response.tool_calls,
                        ));
                        AgentPhase::ExecutingTool
                    }
                }
                AgentPhase::ExecutingTool => {
                    for call in pending.drain(..) {
                        let observation = self.call_tool(&call, ctx, &cancel).await?;
                        history.push(Message::tool(&call, observation));
                    }
                    AgentPhase::AwaitingModel
                }
                AgentPhase::Done => break,
            };
        }

        ctx.write(
            Some(&self.result_key()),
            NewEntry::new(&self.name, answer.as_str()).with_metadata("type", "task_finish"),
        )?;
        if self.auto_memory {
            let mut metadata = Metadata::new();
            metadata.insert("agent".to_string(), self.name.clone().into());
            if let Err(e) = self.memory.add(&answer, metadata).await {
                tracing::warn!(agent = %self.name, error = %e, "Failed to persist answer to long-term memory");
            }
        }
        self.send_event(AgentEvent::Finished {
            agent: self.name.clone(),
            preview: preview(&answer, OBSERVATION_PREVIEW_CHARS),
        });
        tracing::info!(agent = %self.name, turns = turn, "Agent task finished");
        Ok(answer)
    }

    /// 检索长期记忆；失败只记录降级，不影响任务
    async fn recall(&self, query: &str, cancel: &CancellationToken) -> Result<Option<String>, AgentError> {
        if !self.memory.enabled() || self.retrieval_k == 0 {
            return Ok(None);
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = self.memory.search(query, self.retrieval_k) => r,
        };
        match result {
            Ok(hits) if hits.is_empty() => Ok(None),
            Ok(hits) => {
                self.send_event(AgentEvent::MemoryRecalled {
                    agent: self.name.clone(),
                    hits: hits.len(),
                });
                let lines: Vec<String> = hits.iter().map(|h| format!("- {}", h.content)).collect();
                Ok(Some(format!("Relevant memory:\n{}", lines.join("\n"))))
            }
            Err(e) => {
                tracing::warn!(agent = %self.name, error = %e, "Memory search failed, continuing without retrieved context");
                self.send_event(AgentEvent::MemoryDegraded {
                    agent: self.name.clone(),
                    reason: e.to_string(),
                });
                Ok(None)
            }
        }
    }

    async fn infer_with_retry(
        &self,
        history: &[Message],
        schemas: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, AgentError> {
        let mut retries = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.llm.infer(history, schemas) => r,
            };
            let err = match result {
                Ok(response) => return Ok(response),
                Err(e) => AgentError::from(e),
            };
            match self.recovery.handle(&err, retries) {
                RecoveryAction::RetryAfter(delay) => {
                    retries += 1;
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(agent = %self.name, attempt = retries, delay_ms, error = %err, "Retrying inference");
                    self.send_event(AgentEvent::Retry {
                        agent: self.name.clone(),
                        attempt: retries,
                        delay_ms,
                        reason: err.to_string(),
                    });
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RecoveryAction::Abort if retries > 0 => {
                    tracing::warn!(agent = %self.name, retries, error = %err, "Inference retries exhausted");
                    return Err(AgentError::RetriesExhausted {
                        retries,
                        source: Box::new(err),
                    });
                }
                RecoveryAction::Abort => return Err(err),
            }
        }
    }

    /// 执行单个工具调用并记录到草稿本，返回回填给模型的观察文本
    async fn call_tool(
        &self,
        call: &ToolCall,
        ctx: &TaskContext,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        self.send_event(AgentEvent::ToolCall {
            agent: self.name.clone(),
            tool: call.name.clone(),
            args: call.args.clone(),
        });
        ctx.write(
            None,
            NewEntry::new(&self.name, call.args.clone())
                .with_metadata("type", "tool_call")
                .with_metadata("tool", call.name.as_str())
                .with_metadata("args", call.args.to_string()),
        )?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = self.executor.execute(&call.name, call.args.clone()) => r,
        };
        let (ok, observation) = match result {
            Ok(content) => (true, content),
            Err(e) => (false, format!("Error: {}", e)),
        };
        self.send_event(AgentEvent::Observation {
            agent: self.name.clone(),
            tool: call.name.clone(),
            ok,
            preview: preview(&observation, OBSERVATION_PREVIEW_CHARS),
        });
        Ok(observation)
    }
}

#[async_trait]
impl AgentTask for Agent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, input: TaskValue, ctx: &TaskContext) -> Result<TaskValue, AgentError> {
        let objective = value_text(&input);
        self.execute(&objective, ctx).await.map(TaskValue::String)
    }
}

/// Agent 构建器
pub struct AgentBuilder {
    name: String,
    description: String,
    system_prompt: String,
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    tool_timeout: Duration,
    memory: Arc<dyn LongTermMemory>,
    recovery: RecoveryEngine,
    max_turns: usize,
    retrieval_k: usize,
    auto_memory: bool,
    event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>, llm: Arc<dyn LlmClient>) -> Self {
        let defaults = AgentSection::default();
        Self {
            name: name.into(),
            description: String::new(),
            system_prompt: defaults.system_prompt,
            llm,
            tools: ToolRegistry::new(),
            tool_timeout: Duration::from_secs(defaults.tool_timeout_secs),
            memory: Arc::new(NoopLongTerm),
            recovery: RecoveryEngine::default(),
            max_turns: defaults.max_turns,
            retrieval_k: defaults.retrieval_k,
            auto_memory: defaults.auto_memory,
            event_tx: None,
        }
    }

    /// 应用 [agent] 配置段；推理重试预算取自 [orchestrator].max_retry_attempts 与 [retry]
    pub fn config(mut self, cfg: &AppConfig) -> Self {
        let agent = &cfg.agent;
        self.system_prompt = agent.system_prompt.clone();
        self.tool_timeout = Duration::from_secs(agent.tool_timeout_secs);
        self.max_turns = agent.max_turns;
        self.retrieval_k = agent.retrieval_k;
        self.auto_memory = agent.auto_memory;
        self.recovery = RecoveryEngine::from_config(cfg);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn memory(mut self, memory: Arc<dyn LongTermMemory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn retrieval_k(mut self, k: usize) -> Self {
        self.retrieval_k = k;
        self
    }

    pub fn auto_memory(mut self, enabled: bool) -> Self {
        self.auto_memory = enabled;
        self
    }

    pub fn events(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            name: self.name,
            description: self.description,
            system_prompt: self.system_prompt,
            llm: self.llm,
            executor: ToolExecutor::new(self.tools, self.tool_timeout),
            memory: self.memory,
            recovery: self.recovery,
            max_turns: self.max_turns,
            retrieval_k: self.retrieval_k,
            auto_memory: self.auto_memory,
            event_tx: self.event_tx,
        }
    }
}
