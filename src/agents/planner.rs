//! Planner Agent
//!
//! One agent role, four operations, all through the same JSON exchange:
//! `plan` decides research-or-answer, `select` picks which results to read,
//! `reflect` decides continue-or-conclude, `synthesize` composes the final
//! answer over the evidence ledger. Each operation sends a static system
//! prompt plus the stage data as a JSON user message.

use crate::agents::{invoke_json, AgentExchange};
use crate::config::Config;
use crate::llm::{LLMProviderConfig, LLM};
use crate::models::{CandidateDocument, EvidenceEntry, FinalAnswer, SelectionSet};
use crate::protocol::{self, Plan, Selection};
use crate::types::{AppError, AppResult};
use serde_json::json;
use tracing::warn;

const PLANNER_TEMPERATURE: f32 = 0.2;

const PLAN_SYSTEM_PROMPT: &str = r#"You are the planning step of a web research assistant. The user message is a JSON object with the research question.

TASK:
Decide whether the question needs fresh web research or can be answered directly from general knowledge.

GUIDELINES:
- Choose "direct_answer" only when the answer is timeless and uncontroversial (arithmetic, definitions, stable facts)
- Choose "search_then_answer" for anything involving recent events, prices, versions, schedules, or claims worth verifying
- Keep the search query short and specific; do not copy the question verbatim when a tighter query works better
- "when" restricts result age: "day", "week", "month", or "any". NEVER use "month" for slow-moving or scientific topics, prefer "week" or "any"
- Use include/exclude keywords and allow/deny domain lists sparingly, only when they clearly sharpen the results

OUTPUT FORMAT (respond with ONLY valid JSON):
{
  "action": "direct_answer" | "search_then_answer",
  "direct_answer": "Full answer in Markdown (required when action is direct_answer)",
  "search": {
    "query": "search query (required when action is search_then_answer)",
    "when": "any",
    "include": [],
    "exclude": [],
    "allow_domains": [],
    "deny_domains": [],
    "max_results": 10
  },
  "notes": "optional short rationale"
}

IMPORTANT:
- Respond with ONLY the JSON object"#;

const SELECT_SYSTEM_PROMPT: &str = r#"You are the selection step of a web research assistant. The user message is a JSON object with the question, the search results ("results", each with an "id"), and the selection cap ("max_selected").

TASK:
Pick the results most worth reading in full to answer the question.

GUIDELINES:
- Select at most max_selected ids, fewer when most results look weak
- Prefer authoritative, primary sources over aggregators and SEO spam
- Prefer diverse sources over near-duplicates of the same page
- Selecting nothing is allowed when no result looks useful

OUTPUT FORMAT (respond with ONLY valid JSON):
{
  "selected_ids": ["r1", "r3"],
  "notes": "optional short rationale"
}

IMPORTANT:
- Use only ids that appear in the results list
- Respond with ONLY the JSON object"#;

const REFLECT_SYSTEM_PROMPT: &str = r#"You are the reflection step of a web research assistant. The user message is a JSON object with the question, the current round, the round limit, and the evidence gathered so far.

TASK:
Decide whether the evidence is sufficient to answer the question or another search round is needed.

GUIDELINES:
- Choose "direct_answer" to stop researching; the final answer is composed in a separate step, so leave the "direct_answer" text out
- Choose "search_then_answer" with a refined query when a concrete gap remains; change angle or keywords instead of repeating a query that produced weak evidence
- Pages that fetched but scored low mean the query needs changing, not retrying
- "when" restricts result age: "day", "week", "month", or "any". NEVER use "month" for slow-moving or scientific topics, prefer "week" or "any"

OUTPUT FORMAT (respond with ONLY valid JSON):
{
  "action": "direct_answer" | "search_then_answer",
  "search": {
    "query": "refined query (required when action is search_then_answer)",
    "when": "any"
  },
  "notes": "optional short rationale"
}

IMPORTANT:
- Respond with ONLY the JSON object"#;

const SYNTHESIZE_SYSTEM_PROMPT: &str = r#"You are the synthesis step of a web research assistant. The user message is a JSON object with the question, the search results seen during the run, and the evidence ledger built by page readers.

TASK:
Compose the final answer from the gathered evidence.

GUIDELINES:
- Lead with a direct answer, then supporting detail
- Ground every claim in the evidence; do not invent sources
- Cite evidence inline by result id (e.g. [r2]) where a claim rests on it
- Answer in the same language as the question
- When the evidence is thin or conflicting, say so plainly

OUTPUT FORMAT (respond with ONLY valid JSON):
{
  "answer": "Final answer in Markdown",
  "key_points": ["point 1", "point 2"],
  "used_results": ["r1", "r2"],
  "notes": "optional caveats"
}

IMPORTANT:
- Respond with ONLY the JSON object"#;

/// The planner role: plan, select, reflect, synthesize.
pub struct Planner {
    llm: LLM,
    model: String,
    max_tokens: u32,
}

impl Planner {
    pub fn new(llm: LLM, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            llm,
            model: model.into(),
            max_tokens,
        }
    }

    pub fn from_config(config: &Config) -> AppResult<Self> {
        let api_key = config.llm.active_api_key().ok_or_else(|| {
            AppError::Config(format!(
                "no API key configured for provider '{}'",
                config.llm.provider
            ))
        })?;
        let llm = LLM::new(LLMProviderConfig {
            name: config.llm.provider.clone(),
            api_key,
            base_url: config.llm.base_url.clone(),
        })?;
        Ok(Self::new(
            llm,
            config.llm.planner_model.clone(),
            config.llm.planner_max_tokens,
        ))
    }

    /// Decide whether the question needs web research at all.
    pub async fn plan(&self, question: &str) -> AppResult<AgentExchange<Plan>> {
        let payload = json!({ "question": question }).to_string();
        invoke_json(
            &self.llm,
            &self.model,
            self.max_tokens,
            PLANNER_TEMPERATURE,
            PLAN_SYSTEM_PROMPT,
            payload,
            protocol::decode_plan,
        )
        .await
    }

    /// Pick which of the round's results to read deeply. Unknown ids are
    /// dropped and the selection is clamped to `cap`.
    pub async fn select(
        &self,
        question: &str,
        candidates: &[CandidateDocument],
        cap: usize,
    ) -> AppResult<AgentExchange<SelectionSet>> {
        let payload = json!({
            "question": question,
            "results": candidates,
            "max_selected": cap,
        })
        .to_string();
        let exchange = invoke_json(
            &self.llm,
            &self.model,
            self.max_tokens,
            PLANNER_TEMPERATURE,
            SELECT_SYSTEM_PROMPT,
            payload,
            protocol::decode_selection,
        )
        .await?;
        Ok(exchange.map(|selection| sanitize_selection(selection, candidates, cap)))
    }

    /// Decide whether to run another search round or conclude.
    pub async fn reflect(
        &self,
        question: &str,
        round: u32,
        max_rounds: u32,
        ledger: &[EvidenceEntry],
    ) -> AppResult<AgentExchange<Plan>> {
        let payload = json!({
            "question": question,
            "round": round,
            "max_rounds": max_rounds,
            "evidence": ledger,
        })
        .to_string();
        invoke_json(
            &self.llm,
            &self.model,
            self.max_tokens,
            PLANNER_TEMPERATURE,
            REFLECT_SYSTEM_PROMPT,
            payload,
            protocol::decode_reflection,
        )
        .await
    }

    /// Compose the final answer from the whole ledger.
    pub async fn synthesize(
        &self,
        question: &str,
        pool: &[CandidateDocument],
        ledger: &[EvidenceEntry],
    ) -> AppResult<AgentExchange<FinalAnswer>> {
        let payload = json!({
            "question": question,
            "results": pool,
            "evidence": ledger,
        })
        .to_string();
        let exchange = invoke_json(
            &self.llm,
            &self.model,
            self.max_tokens,
            PLANNER_TEMPERATURE,
            SYNTHESIZE_SYSTEM_PROMPT,
            payload,
            protocol::decode_synthesis,
        )
        .await?;
        Ok(exchange.map(|synthesis| FinalAnswer {
            answer: synthesis.answer,
            key_points: synthesis.key_points,
            used_results: synthesis.used_results,
            notes: synthesis.notes,
        }))
    }
}

/// Enforce referential integrity and the selection cap on a raw selection.
fn sanitize_selection(
    selection: Selection,
    candidates: &[CandidateDocument],
    cap: usize,
) -> SelectionSet {
    let mut ids: Vec<String> = Vec::new();
    for id in selection.selected_ids {
        if !candidates.iter().any(|doc| doc.id == id) {
            warn!(id = %id, "Planner selected an unknown result id; dropping");
            continue;
        }
        if ids.contains(&id) {
            continue;
        }
        ids.push(id);
    }
    if ids.len() > cap {
        warn!(
            selected = ids.len(),
            cap, "Planner selected more results than allowed; truncating"
        );
        ids.truncate(cap);
    }
    SelectionSet {
        ids,
        notes: selection.notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::ScriptedAdapter;

    fn candidates(n: usize) -> Vec<CandidateDocument> {
        (1..=n)
            .map(|i| CandidateDocument {
                id: format!("r{}", i),
                title: format!("Result {}", i),
                url: format!("https://example.com/{}", i),
                snippet: String::new(),
                domain: None,
                published: None,
            })
            .collect()
    }

    fn planner(replies: Vec<&str>) -> Planner {
        let llm = LLM::from_adapter(Box::new(ScriptedAdapter::new(replies)), "scripted");
        Planner::new(llm, "test-model", 512)
    }

    #[test]
    fn test_sanitize_selection_drops_unknown_and_duplicate_ids() {
        let selection = Selection {
            selected_ids: vec![
                "r2".to_string(),
                "r9".to_string(),
                "r2".to_string(),
                "r1".to_string(),
            ],
            notes: None,
        };
        let clean = sanitize_selection(selection, &candidates(3), 4);
        assert_eq!(clean.ids, vec!["r2", "r1"]);
    }

    #[test]
    fn test_sanitize_selection_enforces_cap() {
        let selection = Selection {
            selected_ids: vec!["r1".to_string(), "r2".to_string(), "r3".to_string()],
            notes: None,
        };
        let clean = sanitize_selection(selection, &candidates(3), 2);
        assert_eq!(clean.ids, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_plan_decodes_search_action() {
        let planner = planner(vec![
            r#"{"action": "search_then_answer", "search": {"query": "rust 1.80 release date", "when": "week"}}"#,
        ]);
        let exchange = planner.plan("When was Rust 1.80 released?").await.unwrap();
        assert_eq!(exchange.value.action, protocol::PlanAction::SearchThenAnswer);
        let spec = exchange.value.search.unwrap();
        assert_eq!(spec.query, "rust 1.80 release date");
        assert!(!exchange.repaired);
    }

    #[tokio::test]
    async fn test_select_sanitizes_model_output() {
        let planner = planner(vec![
            r#"{"selected_ids": ["r1", "r7", "r1", "r3"], "notes": "mixed"}"#,
        ]);
        let exchange = planner
            .select("question", &candidates(4), 4)
            .await
            .unwrap();
        assert_eq!(exchange.value.ids, vec!["r1", "r3"]);
        assert_eq!(exchange.value.notes.as_deref(), Some("mixed"));
    }

    #[tokio::test]
    async fn test_synthesize_maps_to_final_answer() {
        let planner = planner(vec![
            r#"```json
{"answer": "It shipped in July.", "key_points": ["July release"], "used_results": ["r1"]}
```"#,
        ]);
        let exchange = planner
            .synthesize("when did it ship", &candidates(1), &[])
            .await
            .unwrap();
        assert_eq!(exchange.value.answer, "It shipped in July.");
        assert_eq!(exchange.value.used_results, vec!["r1"]);
    }
}
