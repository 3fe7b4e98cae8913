//! 规划：把目标分解为指派给专家的步骤
//!
//! LlmPlanner 要求模型只输出 JSON 计划（提示词中附带 schemars 生成的 Schema），解析时容忍 Markdown 代码块与前后说明文字。
//! compile_plan 把步骤间的 depends_on 转为依赖图：没有任何步骤声明 depends_on 时，
//! 默认第 k 步依赖前面所有步骤（按声明顺序串行），保证计划含糊时行为确定。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;
use crate::orchestrator::SpecialistInfo;
use crate::workflow::{GraphError, NodeIndex, TaskGraph};

/// 计划中的步骤 ID（模型可能输出数字或字符串，统一为字符串）
pub type StepId = String;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Int(i64),
    Text(String),
}

impl From<RawId> for StepId {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Int(n) => n.to_string(),
            RawId::Text(s) => s.trim().to_string(),
        }
    }
}

fn step_id<'de, D: Deserializer<'de>>(d: D) -> Result<StepId, D::Error> {
    RawId::deserialize(d).map(StepId::from)
}

fn step_ids<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<StepId>>, D::Error> {
    let raw: Option<Vec<RawId>> = Option::deserialize(d)?;
    Ok(raw.map(|ids| ids.into_iter().map(StepId::from).collect()))
}

/// 单个委派步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlannedStep {
    /// 步骤编号（1 起）
    #[serde(deserialize_with = "step_id")]
    #[schemars(with = "u64")]
    pub id: StepId,
    /// 交给专家的具体指令
    pub description: String,
    /// 专家名称，必须来自可用列表
    pub assigned_agent_name: String,
    /// 依赖的步骤编号；省略时按声明顺序串行
    #[serde(default, deserialize_with = "step_ids", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<u64>>")]
    pub depends_on: Option<Vec<StepId>>,
}

impl PlannedStep {
    pub fn new(id: impl ToString, agent: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            description: description.into(),
            assigned_agent_name: agent.into(),
            depends_on: None,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = Some(ids.iter().map(|s| s.to_string()).collect());
        self
    }
}

/// 规划步骤输出的 JSON 文档
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct PlanDocument {
    #[serde(default)]
    pub steps: Vec<PlannedStep>,
}

/// 规划失败（对一次运行是致命的）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("No specialists registered")]
    NoSpecialists,

    #[error("Planner returned an empty plan")]
    EmptyPlan,

    #[error("Malformed plan: {0}")]
    Malformed(String),

    #[error("Planner call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Duplicate step id: {0}")]
    DuplicateStep(StepId),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("Invalid dependency graph: {0}")]
    Graph(#[from] GraphError),
}

/// 规划步骤（外部协作方）
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, objective: &str, specialists: &[SpecialistInfo]) -> Result<PlanDocument, PlanError>;
}

/// 由 LLM 生成计划
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn system_prompt(specialists: &[SpecialistInfo]) -> String {
        let team = specialists
            .iter()
            .map(|s| {
                if s.description.is_empty() {
                    format!("- {}", s.name)
                } else {
                    format!("- {}: {}", s.name, s.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        let schema = serde_json::to_string_pretty(&schemars::schema_for!(PlanDocument))
            .unwrap_or_default();
        format!(
            "You are an expert project manager and orchestrator. \
             Break the user's goal into a logical set of execution steps and assign each step \
             to the most appropriate agent from this team:\n{team}\n\n\
             Use \"depends_on\" to list the ids of steps whose output a step needs; omit it on every \
             step to run the steps strictly in order.\n\
             Return the plan strictly as a valid JSON object matching this schema, with no conversational text:\n{schema}"
        )
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, objective: &str, specialists: &[SpecialistInfo]) -> Result<PlanDocument, PlanError> {
        let messages = [
            Message::system(Self::system_prompt(specialists)),
            Message::user(objective),
        ];
        let text = self.llm.complete(&messages).await?;
        parse_plan(&text)
    }
}

static FENCE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static OBJECT_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 从模型输出中提取计划：去掉 ```json 代码块标记，取第一个 { 到最后一个 } 之间的内容
pub fn parse_plan(text: &str) -> Result<PlanDocument, PlanError> {
    let fence = FENCE_RE.get_or_init(|| Regex::new(r"```(?:json|JSON)?\s*").ok());
    let object = OBJECT_RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").ok());

    let cleaned = match fence {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    };
    let json = object
        .as_ref()
        .and_then(|re| re.find(&cleaned))
        .map(|m| m.as_str())
        .unwrap_or(&cleaned);

    let doc: PlanDocument =
        serde_json::from_str(json).map_err(|e| PlanError::Malformed(format!("{e}: {json}")))?;
    if doc.steps.is_empty() {
        return Err(PlanError::EmptyPlan);
    }
    Ok(doc)
}

/// 固定计划（测试与确定性流水线使用）
#[derive(Debug, Clone, Default)]
pub struct StaticPlanner {
    plan: PlanDocument,
}

impl StaticPlanner {
    pub fn new(steps: Vec<PlannedStep>) -> Self {
        Self {
            plan: PlanDocument { steps },
        }
    }

    /// 按顺序编号的 (专家, 指令) 列表，不声明依赖
    pub fn sequence(steps: &[(&str, &str)]) -> Self {
        Self::new(
            steps
                .iter()
                .enumerate()
                .map(|(i, (agent, desc))| PlannedStep::new(i + 1, *agent, *desc))
                .collect(),
        )
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _objective: &str, _specialists: &[SpecialistInfo]) -> Result<PlanDocument, PlanError> {
        if self.plan.steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        Ok(self.plan.clone())
    }
}

/// 计划 -> 依赖图。没有任何步骤声明 depends_on 时使用按声明顺序串行的默认依赖；
/// 否则未声明的步骤视为无依赖。未知 ID、自依赖与环都是规划错误。
pub fn compile_plan(plan: &PlanDocument) -> Result<TaskGraph, PlanError> {
    if plan.steps.is_empty() {
        return Err(PlanError::EmptyPlan);
    }

    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
    for (i, step) in plan.steps.iter().enumerate() {
        if index_of.insert(step.id.as_str(), i).is_some() {
            return Err(PlanError::DuplicateStep(step.id.clone()));
        }
    }

    if plan.steps.iter().all(|s| s.depends_on.is_none()) {
        return Ok(TaskGraph::sequential(plan.steps.len()));
    }

    let mut deps = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        let mut node_deps = Vec::new();
        for dep in step.depends_on.iter().flatten() {
            let idx = index_of
                .get(dep.as_str())
                .copied()
                .ok_or_else(|| PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                })?;
            node_deps.push(idx);
        }
        deps.push(node_deps);
    }
    Ok(TaskGraph::new(&deps)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, MockLlmClient};

    #[test]
    fn test_parse_plan_tolerates_fences_and_prose() {
        let text = "Sure! Here is the plan:\n```json\n{\"steps\": [{\"id\": 1, \"description\": \"research\", \"assigned_agent_name\": \"researcher\"}, {\"id\": \"2\", \"description\": \"write\", \"assigned_agent_name\": \"writer\", \"depends_on\": [1]}]}\n```\nGood luck.";
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].id, "1");
        assert_eq!(plan.steps[1].id, "2");
        assert_eq!(plan.steps[1].depends_on, Some(vec!["1".to_string()]));
    }

    #[test]
    fn test_parse_plan_rejects_garbage_and_empty() {
        assert!(matches!(parse_plan("no json here"), Err(PlanError::Malformed(_))));
        assert_eq!(parse_plan(r#"{"steps": []}"#), Err(PlanError::EmptyPlan));
    }

    #[test]
    fn test_compile_defaults_to_declaration_order() {
        let plan = StaticPlanner::sequence(&[("a", "one"), ("b", "two"), ("c", "three")]).plan;
        let graph = compile_plan(&plan).unwrap();
        assert_eq!(graph.roots(), vec![0]);
        assert_eq!(graph.dependencies(2), &[0, 1]);
    }

    #[test]
    fn test_compile_explicit_dependencies() {
        let plan = PlanDocument {
            steps: vec![
                PlannedStep::new(1, "a", "one"),
                PlannedStep::new(2, "b", "two"),
                PlannedStep::new(3, "c", "three").depends_on(&["1", "2"]),
            ],
        };
        let graph = compile_plan(&plan).unwrap();
        assert_eq!(graph.roots(), vec![0, 1]);
        assert_eq!(graph.dependencies(2), &[0, 1]);
    }

    #[test]
    fn test_compile_rejects_bad_references() {
        let unknown = PlanDocument {
            steps: vec![PlannedStep::new(1, "a", "one").depends_on(&["9"])],
        };
        assert!(matches!(compile_plan(&unknown), Err(PlanError::UnknownDependency { .. })));

        let cyclic = PlanDocument {
            steps: vec![
                PlannedStep::new(1, "a", "one").depends_on(&["2"]),
                PlannedStep::new(2, "b", "two").depends_on(&["1"]),
            ],
        };
        assert!(matches!(compile_plan(&cyclic), Err(PlanError::Graph(GraphError::Cycle(_)))));

        let duplicate = PlanDocument {
            steps: vec![PlannedStep::new(1, "a", "one"), PlannedStep::new(1, "b", "two")],
        };
        assert_eq!(compile_plan(&duplicate).unwrap_err(), PlanError::DuplicateStep("1".into()));
    }

    #[tokio::test]
    async fn test_llm_planner_prompt_lists_team() {
        let llm = Arc::new(MockLlmClient::scripted([Ok(LlmResponse::text(
            r#"{"steps": [{"id": 1, "description": "do it", "assigned_agent_name": "coder"}]}"#,
        ))]));
        let planner = LlmPlanner::new(llm.clone());
        let team = vec![SpecialistInfo {
            name: "coder".into(),
            description: "writes code".into(),
        }];

        let plan = planner.plan("build a thing", &team).await.unwrap();
        assert_eq!(plan.steps[0].assigned_agent_name, "coder");
        let history = llm.messages_of_call(0).unwrap();
        let prompt = &history[0].content;
        assert!(prompt.contains("- coder: writes code"));
        assert!(prompt.contains("assigned_agent_name"));
    }
}
