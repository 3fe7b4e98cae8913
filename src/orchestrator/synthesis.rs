//! 综合：把成功节点的输出合并为最终结果

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::{value_text, TaskValue};
use crate::core::AgentError;
use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;
use crate::orchestrator::{NodeFailure, NodeOutput};

/// 综合步骤（外部协作方）；outputs 按节点下标升序，至少一项
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        objective: &str,
        outputs: &[NodeOutput],
        failures: &[NodeFailure],
    ) -> Result<TaskValue, AgentError>;
}

/// 取下标最大的成功节点的输出作为最终结果
#[derive(Debug, Clone, Copy, Default)]
pub struct LastOutputSynthesizer;

#[async_trait]
impl Synthesizer for LastOutputSynthesizer {
    async fn synthesize(
        &self,
        _objective: &str,
        outputs: &[NodeOutput],
        _failures: &[NodeFailure],
    ) -> Result<TaskValue, AgentError> {
        outputs
            .iter()
            .max_by_key(|o| o.index)
            .map(|o| o.output.clone())
            .ok_or_else(|| AgentError::TaskFailed("no node output to synthesize".to_string()))
    }
}

/// 由 LLM 汇总各步骤输出
pub struct LlmSynthesizer {
    llm: Arc<dyn LlmClient>,
}

impl LlmSynthesizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn prompt(objective: &str, outputs: &[NodeOutput], failures: &[NodeFailure]) -> String {
        let mut prompt = format!("Overall Goal: {objective}\n\nResults from the team:\n");
        for out in outputs {
            prompt.push_str(&format!(
                "\nStep {} ({}): {}\nOutput:\n{}\n",
                out.step_id,
                out.specialist,
                out.instruction,
                value_text(&out.output)
            ));
        }
        if !failures.is_empty() {
            prompt.push_str("\nThe following steps failed and produced no output:\n");
            for failure in failures {
                prompt.push_str(&format!("- {failure}\n"));
            }
        }
        prompt
    }
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    async fn synthesize(
        &self,
        objective: &str,
        outputs: &[NodeOutput],
        failures: &[NodeFailure],
    ) -> Result<TaskValue, AgentError> {
        let messages = [
            Message::system(
                "You are the team lead. Combine the step results into one final answer for the overall goal. \
                 Be faithful to the results and mention gaps left by failed steps.",
            ),
            Message::user(Self::prompt(objective, outputs, failures)),
        ];
        let text = self.llm.complete(&messages).await?;
        if text.trim().is_empty() {
            return Err(LlmError::InvalidResponse("empty synthesis".to_string()).into());
        }
        Ok(TaskValue::String(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, MockLlmClient};
    use crate::orchestrator::NodeError;
    use serde_json::json;

    fn output(index: usize, value: TaskValue) -> NodeOutput {
        NodeOutput {
            index,
            step_id: (index + 1).to_string(),
            specialist: "worker".into(),
            instruction: format!("step {}", index + 1),
            output: value,
        }
    }

    #[tokio::test]
    async fn test_last_output_picks_highest_index() {
        let outputs = vec![output(2, json!("third")), output(0, json!("first"))];
        let result = LastOutputSynthesizer.synthesize("goal", &outputs, &[]).await.unwrap();
        assert_eq!(result, json!("third"));
        assert!(LastOutputSynthesizer.synthesize("goal", &[], &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_llm_synthesizer_mentions_failures() {
        let llm = Arc::new(MockLlmClient::scripted([Ok(LlmResponse::text("final report"))]));
        let synth = LlmSynthesizer::new(llm.clone());
        let failures = vec![NodeFailure {
            index: 1,
            step_id: "2".into(),
            specialist: "critic".into(),
            error: NodeError::Cancelled,
        }];

        let result = synth
            .synthesize("write a poem", &[output(0, json!("roses are red"))], &failures)
            .await
            .unwrap();
        assert_eq!(result, json!("final report"));

        let history = llm.messages_of_call(0).unwrap();
        let prompt = &history[1].content;
        assert!(prompt.contains("Overall Goal: write a poem"));
        assert!(prompt.contains("roses are red"));
        assert!(prompt.contains("- step 2 (critic): Cancelled"));
    }
}
