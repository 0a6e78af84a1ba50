//! Research Loop Controller
//!
//! Owns the round-based state machine:
//!
//! ```text
//! INIT → PLANNING → {DIRECT_ANSWER, SEARCHING} → SELECTING → READING
//!      → REFLECTING → {SEARCHING, SYNTHESIZING} → DONE
//! ```
//!
//! The controller is sequential; only the reader pipelines inside READING run
//! concurrently. Planner failures, empty searches, and exhausted budgets all
//! route to SYNTHESIZING, so a run always ends in a single terminal report
//! that keeps whatever evidence was gathered.

use crate::agents::{Planner, Reader, ReaderDispatcher};
use crate::config::{Config, RunConfig};
use crate::fetch::HttpFetcher;
use crate::models::{
    CandidateDocument, EvidenceEntry, FinalAnswer, ForcedReason, RunOutcome, RunReport,
    SearchQuery,
};
use crate::protocol::PlanAction;
use crate::search::{SearchGateway, SerpApiGateway};
use crate::trace::{RunTrace, TraceStage};
use crate::types::{AppError, AppResult, TokenUsage};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Loop state. One terminal state; outcome kinds live on [`RunOutcome`].
enum RunState {
    Planning,
    DirectAnswer(String),
    Searching(SearchQuery),
    Selecting(Vec<CandidateDocument>),
    Reading(Vec<CandidateDocument>),
    Reflecting,
    Synthesizing(Option<ForcedReason>),
    Done(Terminal),
}

struct Terminal {
    outcome: RunOutcome,
    answer: Option<FinalAnswer>,
    raw_synthesis: Option<String>,
}

/// Mutable per-run state. Owned by the controller; readers only ever see
/// copies of the documents they work on.
struct RunContext {
    run_id: Uuid,
    question: String,
    round: u32,
    ledger: Vec<EvidenceEntry>,
    pool: Vec<CandidateDocument>,
    trace: RunTrace,
    total_tokens: u32,
    deadline: Option<Instant>,
}

impl RunContext {
    fn add_tokens(&mut self, usage: TokenUsage) {
        self.total_tokens += usage.total_tokens;
    }
}

pub struct Orchestrator {
    planner: Planner,
    dispatcher: ReaderDispatcher,
    gateway: Arc<dyn SearchGateway>,
    run_config: RunConfig,
}

impl Orchestrator {
    pub fn new(
        planner: Planner,
        dispatcher: ReaderDispatcher,
        gateway: Arc<dyn SearchGateway>,
        run_config: RunConfig,
    ) -> Self {
        Self {
            planner,
            dispatcher,
            gateway,
            run_config,
        }
    }

    /// Wire up the production stack: SerpAPI gateway, HTTP fetcher, and the
    /// configured LLM provider for both agent roles.
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let planner = Planner::from_config(config)?;
        let reader = Reader::from_config(config)?;
        let gateway = SerpApiGateway::from_config(&config.search)
            .ok_or_else(|| AppError::Config("SERPAPI_KEY is not set".to_string()))?;
        let fetcher = HttpFetcher::from_config(&config.fetch);
        let dispatcher = ReaderDispatcher::new(reader, Arc::new(fetcher), config.run.concurrency);
        Ok(Self::new(
            planner,
            dispatcher,
            Arc::new(gateway),
            config.run.clone(),
        ))
    }

    /// Drive one question through the loop. Infallible: every failure mode
    /// ends in a terminal report carrying the evidence gathered so far.
    pub async fn run(&self, question: &str) -> RunReport {
        let started_at = Utc::now();
        let mut ctx = RunContext {
            run_id: Uuid::new_v4(),
            question: question.to_string(),
            round: 0,
            ledger: Vec::new(),
            pool: Vec::new(),
            trace: RunTrace::new(),
            total_tokens: 0,
            deadline: self
                .run_config
                .deadline_secs
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
        };

        info!(run_id = %ctx.run_id, question = %ctx.question, "Starting research run");

        let mut state = RunState::Planning;
        let terminal = loop {
            state = match state {
                RunState::Planning => self.step_planning(&mut ctx).await,
                RunState::DirectAnswer(text) => step_direct(&mut ctx, text),
                RunState::Searching(query) => self.step_searching(&mut ctx, query).await,
                RunState::Selecting(candidates) => self.step_selecting(&mut ctx, candidates).await,
                RunState::Reading(docs) => self.step_reading(&mut ctx, docs).await,
                RunState::Reflecting => self.step_reflecting(&mut ctx).await,
                RunState::Synthesizing(forced) => self.step_synthesizing(&mut ctx, forced).await,
                RunState::Done(terminal) => break terminal,
            };
        };

        info!(
            run_id = %ctx.run_id,
            rounds = ctx.round,
            total_tokens = ctx.total_tokens,
            ledger = ctx.ledger.len(),
            "Run finished"
        );

        RunReport {
            run_id: ctx.run_id,
            question: ctx.question,
            outcome: terminal.outcome,
            answer: terminal.answer,
            raw_synthesis: terminal.raw_synthesis,
            rounds: ctx.round,
            total_tokens: ctx.total_tokens,
            started_at,
            finished_at: Utc::now(),
            ledger: ctx.ledger,
            trace: ctx.trace,
        }
    }

    async fn step_planning(&self, ctx: &mut RunContext) -> RunState {
        ctx.trace.log(0, TraceStage::Plan, "planning");
        match self.planner.plan(&ctx.question).await {
            Ok(exchange) => {
                ctx.add_tokens(exchange.tokens);
                ctx.trace.log_data(
                    0,
                    TraceStage::Plan,
                    "plan decoded",
                    json!({"raw": exchange.raw, "repaired": exchange.repaired}),
                );
                let plan = exchange.value;
                match (plan.action, plan.direct_answer, plan.search) {
                    (PlanAction::DirectAnswer, Some(text), _) => RunState::DirectAnswer(text),
                    (PlanAction::SearchThenAnswer, _, Some(spec)) => {
                        // round stays <= max_rounds even when the cap is zero
                        if self.run_config.max_rounds == 0 {
                            ctx.trace.log(
                                0,
                                TraceStage::Plan,
                                "search requested but no rounds allowed; forcing synthesis",
                            );
                            RunState::Synthesizing(Some(ForcedReason::RoundCapReached))
                        } else {
                            ctx.round = 1;
                            RunState::Searching(spec.into_query(
                                self.run_config.per_round_result_cap,
                                self.run_config.per_round_result_cap,
                            ))
                        }
                    }
                    // decode_plan guarantees the fields above
                    _ => RunState::Synthesizing(Some(ForcedReason::PlannerFailed)),
                }
            }
            Err(err) => {
                ctx.trace
                    .log_error(0, TraceStage::Plan, format!("planning failed: {}", err));
                RunState::Synthesizing(Some(ForcedReason::PlannerFailed))
            }
        }
    }

    async fn step_searching(&self, ctx: &mut RunContext, query: SearchQuery) -> RunState {
        ctx.trace.log_data(
            ctx.round,
            TraceStage::Search,
            format!("searching: {}", query.query),
            json!({"when": query.when, "max_results": query.max_results}),
        );
        match self.gateway.search(&query).await {
            Ok(candidates) => {
                let ids: Vec<&str> = candidates.iter().map(|d| d.id.as_str()).collect();
                ctx.trace.log_data(
                    ctx.round,
                    TraceStage::Search,
                    format!("search returned {} results", candidates.len()),
                    json!({ "ids": ids }),
                );
                ctx.pool.extend(candidates.iter().cloned());
                if candidates.is_empty() {
                    RunState::Reflecting
                } else {
                    RunState::Selecting(candidates)
                }
            }
            Err(err) => {
                ctx.trace.log_error(
                    ctx.round,
                    TraceStage::Search,
                    format!("search failed: {}; continuing with no candidates", err),
                );
                RunState::Reflecting
            }
        }
    }

    async fn step_selecting(
        &self,
        ctx: &mut RunContext,
        candidates: Vec<CandidateDocument>,
    ) -> RunState {
        ctx.trace
            .log(ctx.round, TraceStage::Select, "selecting results to read");
        match self
            .planner
            .select(
                &ctx.question,
                &candidates,
                self.run_config.per_round_selection_cap,
            )
            .await
        {
            Ok(exchange) => {
                ctx.add_tokens(exchange.tokens);
                let selection = exchange.value;
                ctx.trace.log_data(
                    ctx.round,
                    TraceStage::Select,
                    format!(
                        "selected {} of {} results",
                        selection.ids.len(),
                        candidates.len()
                    ),
                    json!({
                        "raw": exchange.raw,
                        "repaired": exchange.repaired,
                        "selected_ids": &selection.ids,
                        "notes": &selection.notes,
                    }),
                );
                if selection.ids.is_empty() {
                    RunState::Reflecting
                } else {
                    let docs: Vec<CandidateDocument> = selection
                        .ids
                        .iter()
                        .filter_map(|id| candidates.iter().find(|doc| &doc.id == id).cloned())
                        .collect();
                    RunState::Reading(docs)
                }
            }
            Err(err) => {
                ctx.trace.log_error(
                    ctx.round,
                    TraceStage::Select,
                    format!("selection failed: {}", err),
                );
                RunState::Synthesizing(Some(ForcedReason::PlannerFailed))
            }
        }
    }

    async fn step_reading(&self, ctx: &mut RunContext, docs: Vec<CandidateDocument>) -> RunState {
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        ctx.trace.log_data(
            ctx.round,
            TraceStage::Read,
            format!("reading {} documents", docs.len()),
            json!({ "ids": ids }),
        );

        let batch = self
            .dispatcher
            .read_all(&ctx.question, ctx.round, &docs, ctx.deadline)
            .await;
        ctx.total_tokens += batch.tokens;

        let reports: Vec<Value> = batch
            .entries
            .iter()
            .zip(&batch.raw_replies)
            .map(|(e, raw)| {
                json!({
                    "id": &e.doc_id,
                    "status": e.status,
                    "relevance": e.relevance_score,
                    "raw": raw,
                })
            })
            .collect();
        ctx.trace.log_data(
            ctx.round,
            TraceStage::Read,
            format!("appended {} ledger entries", batch.entries.len()),
            Value::Array(reports),
        );
        ctx.ledger.extend(batch.entries);
        RunState::Reflecting
    }

    async fn step_reflecting(&self, ctx: &mut RunContext) -> RunState {
        if let Some(deadline) = ctx.deadline {
            if Instant::now() >= deadline {
                ctx.trace.log_error(
                    ctx.round,
                    TraceStage::Reflect,
                    "run deadline exceeded; forcing synthesis",
                );
                return RunState::Synthesizing(Some(ForcedReason::DeadlineExceeded));
            }
        }
        if let Some(budget) = self.run_config.token_budget {
            if ctx.total_tokens >= budget {
                ctx.trace.log_error(
                    ctx.round,
                    TraceStage::Reflect,
                    format!(
                        "token budget exhausted ({} >= {}); forcing synthesis",
                        ctx.total_tokens, budget
                    ),
                );
                return RunState::Synthesizing(Some(ForcedReason::TokenBudgetExhausted));
            }
        }

        ctx.trace
            .log(ctx.round, TraceStage::Reflect, "reflecting on evidence");
        match self
            .planner
            .reflect(
                &ctx.question,
                ctx.round,
                self.run_config.max_rounds,
                &ctx.ledger,
            )
            .await
        {
            Ok(exchange) => {
                ctx.add_tokens(exchange.tokens);
                ctx.trace.log_data(
                    ctx.round,
                    TraceStage::Reflect,
                    "reflection decoded",
                    json!({"raw": exchange.raw, "repaired": exchange.repaired}),
                );
                let plan = exchange.value;
                match plan.action {
                    PlanAction::DirectAnswer => RunState::Synthesizing(None),
                    PlanAction::SearchThenAnswer => {
                        if ctx.round >= self.run_config.max_rounds {
                            ctx.trace.log(
                                ctx.round,
                                TraceStage::Reflect,
                                "round cap reached; forcing synthesis",
                            );
                            return RunState::Synthesizing(Some(ForcedReason::RoundCapReached));
                        }
                        match plan.search {
                            Some(spec) => {
                                ctx.round += 1;
                                RunState::Searching(spec.into_query(
                                    self.run_config.per_round_result_cap,
                                    self.run_config.per_round_result_cap,
                                ))
                            }
                            // decode_reflection guarantees the search object
                            None => RunState::Synthesizing(Some(ForcedReason::PlannerFailed)),
                        }
                    }
                }
            }
            Err(err) => {
                ctx.trace.log_error(
                    ctx.round,
                    TraceStage::Reflect,
                    format!("reflection failed: {}", err),
                );
                RunState::Synthesizing(Some(ForcedReason::PlannerFailed))
            }
        }
    }

    async fn step_synthesizing(
        &self,
        ctx: &mut RunContext,
        forced: Option<ForcedReason>,
    ) -> RunState {
        match forced {
            Some(reason) => ctx.trace.log(
                ctx.round,
                TraceStage::Synthesize,
                format!("forced synthesis: {}", reason),
            ),
            None => ctx.trace.log(
                ctx.round,
                TraceStage::Synthesize,
                "synthesizing final answer",
            ),
        }

        match self
            .planner
            .synthesize(&ctx.question, &ctx.pool, &ctx.ledger)
            .await
        {
            Ok(exchange) => {
                ctx.add_tokens(exchange.tokens);
                ctx.trace.log_data(
                    ctx.round,
                    TraceStage::Synthesize,
                    "synthesis decoded",
                    json!({"raw": exchange.raw, "repaired": exchange.repaired}),
                );
                ctx.trace.log(ctx.round, TraceStage::Final, "run complete");
                let outcome = match forced {
                    Some(reason) => RunOutcome::ForcedSynthesis { reason },
                    None => RunOutcome::Researched,
                };
                RunState::Done(Terminal {
                    outcome,
                    answer: Some(exchange.value),
                    raw_synthesis: None,
                })
            }
            Err(err) => {
                let raw = match &err {
                    AppError::Decode(decode_err) => Some(decode_err.raw().to_string()),
                    _ => None,
                };
                ctx.trace.log_error(
                    ctx.round,
                    TraceStage::Synthesize,
                    format!("synthesis failed: {}", err),
                );
                ctx.trace
                    .log(ctx.round, TraceStage::Final, "run complete without an answer");
                RunState::Done(Terminal {
                    outcome: RunOutcome::SynthesisFailed,
                    answer: None,
                    raw_synthesis: raw,
                })
            }
        }
    }
}

fn step_direct(ctx: &mut RunContext, text: String) -> RunState {
    ctx.trace
        .log(0, TraceStage::Final, "answered directly without research");
    RunState::Done(Terminal {
        outcome: RunOutcome::DirectAnswer,
        answer: Some(FinalAnswer::direct(text)),
        raw_synthesis: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::ScriptedAdapter;
    use crate::fetch::{DocumentFetcher, FetchError};
    use crate::llm::LLM;
    use crate::models::ReadStatus;
    use crate::search::SearchError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const REFLECT_SEARCH_AGAIN: &str =
        r#"{"action": "search_then_answer", "search": {"query": "narrower query"}}"#;
    const REFLECT_CONCLUDE: &str = r#"{"action": "direct_answer"}"#;
    const SYNTHESIS_OK: &str =
        r#"{"answer": "Synthesized answer.", "key_points": ["point"], "used_results": ["r1"]}"#;
    const READER_OK: &str =
        r#"{"title": "Page", "summary": "Says a thing.", "key_points": ["a fact"], "relevance_score": 0.8}"#;

    fn plan_search(query: &str) -> String {
        format!(
            r#"{{"action": "search_then_answer", "search": {{"query": "{}", "when": "any"}}}}"#,
            query
        )
    }

    fn select_ids(ids: &[&str]) -> String {
        let quoted: Vec<String> = ids.iter().map(|id| format!("\"{}\"", id)).collect();
        format!(r#"{{"selected_ids": [{}]}}"#, quoted.join(", "))
    }

    fn doc(i: usize) -> CandidateDocument {
        CandidateDocument {
            id: format!("r{}", i),
            title: format!("Result {}", i),
            url: format!("https://example.com/{}", i),
            snippet: "snippet".to_string(),
            domain: None,
            published: None,
        }
    }

    fn docs(n: usize) -> Vec<CandidateDocument> {
        (1..=n).map(doc).collect()
    }

    /// Pops one preset batch per search call; empty once exhausted.
    struct StaticGateway {
        batches: Mutex<VecDeque<Vec<CandidateDocument>>>,
        calls: AtomicUsize,
    }

    impl StaticGateway {
        fn new(batches: Vec<Vec<CandidateDocument>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SearchGateway for StaticGateway {
        async fn search(
            &self,
            _query: &SearchQuery,
        ) -> Result<Vec<CandidateDocument>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    struct FailingGateway;

    #[async_trait]
    impl SearchGateway for FailingGateway {
        async fn search(
            &self,
            _query: &SearchQuery,
        ) -> Result<Vec<CandidateDocument>, SearchError> {
            Err(SearchError::RequestFailed("engine down".to_string()))
        }
    }

    struct InstantFetcher;

    #[async_trait]
    impl DocumentFetcher for InstantFetcher {
        async fn fetch_extract(&self, url: &str) -> Result<String, FetchError> {
            Ok(format!("text from {}", url))
        }
    }

    struct NeverFetcher;

    #[async_trait]
    impl DocumentFetcher for NeverFetcher {
        async fn fetch_extract(&self, _url: &str) -> Result<String, FetchError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(String::new())
        }
    }

    fn build(
        planner_adapter: Arc<ScriptedAdapter>,
        reader_replies: Vec<&str>,
        gateway: Arc<dyn SearchGateway>,
        fetcher: Arc<dyn DocumentFetcher>,
        run_config: RunConfig,
    ) -> Orchestrator {
        let planner = Planner::new(
            LLM::from_adapter(Box::new(planner_adapter), "scripted"),
            "planner-model",
            512,
        );
        let reader = Reader::new(
            LLM::from_adapter(Box::new(ScriptedAdapter::new(reader_replies)), "scripted"),
            "reader-model",
            512,
        );
        let dispatcher = ReaderDispatcher::new(reader, fetcher, run_config.concurrency);
        Orchestrator::new(planner, dispatcher, gateway, run_config)
    }

    #[tokio::test]
    async fn test_direct_answer_runs_zero_rounds() {
        let planner = Arc::new(ScriptedAdapter::new(vec![
            r#"{"action": "direct_answer", "direct_answer": "391"}"#,
        ]));
        let gateway = Arc::new(StaticGateway::new(vec![]));
        let orchestrator = build(
            planner.clone(),
            vec![],
            gateway.clone(),
            Arc::new(InstantFetcher),
            RunConfig::default(),
        );

        let report = orchestrator.run("What is 17 × 23?").await;

        assert_eq!(report.outcome, RunOutcome::DirectAnswer);
        assert_eq!(report.rounds, 0);
        assert!(report.ledger.is_empty());
        assert_eq!(report.answer.as_ref().map(|a| a.answer.as_str()), Some("391"));
        assert_eq!(planner.call_count(), 1);
        assert_eq!(gateway.calls(), 0);
        assert!(!report.trace.is_empty());
    }

    #[tokio::test]
    async fn test_single_round_researched() {
        let planner = Arc::new(ScriptedAdapter::new(vec![
            &plan_search("rust 1.80 release"),
            &select_ids(&["r1", "r3"]),
            REFLECT_CONCLUDE,
            SYNTHESIS_OK,
        ]));
        let gateway = Arc::new(StaticGateway::new(vec![docs(3)]));
        let orchestrator = build(
            planner.clone(),
            vec![READER_OK, READER_OK],
            gateway,
            Arc::new(InstantFetcher),
            RunConfig::default(),
        );

        let report = orchestrator.run("When did Rust 1.80 ship?").await;

        assert_eq!(report.outcome, RunOutcome::Researched);
        assert_eq!(report.rounds, 1);
        assert_eq!(report.ledger.len(), 2);
        let ids: Vec<&str> = report.ledger.iter().map(|e| e.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r3"]);
        assert!(report.ledger.iter().all(|e| e.status == ReadStatus::Ok));
        assert_eq!(
            report.answer.as_ref().map(|a| a.answer.as_str()),
            Some("Synthesized answer.")
        );
        // 4 planner calls and 2 reader calls at 15 tokens each
        assert_eq!(report.total_tokens, 90);
        assert_eq!(planner.call_count(), 4);

        let stages: Vec<TraceStage> = report.trace.events().iter().map(|e| e.stage).collect();
        assert!(stages.contains(&TraceStage::Search));
        assert!(stages.contains(&TraceStage::Read));
        assert_eq!(stages.last(), Some(&TraceStage::Final));
    }

    #[tokio::test]
    async fn test_trace_carries_each_agent_reply_verbatim() {
        // "rationale" is dropped by validation; only the raw reply keeps it
        let select_reply = r#"{"selected_ids": ["r1"], "rationale": "prefer the canonical standards post"}"#;
        let planner = Arc::new(ScriptedAdapter::new(vec![
            &plan_search("q"),
            select_reply,
            REFLECT_CONCLUDE,
            SYNTHESIS_OK,
        ]));
        let gateway = Arc::new(StaticGateway::new(vec![docs(2)]));
        let orchestrator = build(
            planner,
            vec![READER_OK],
            gateway,
            Arc::new(InstantFetcher),
            RunConfig::default(),
        );

        let report = orchestrator.run("question").await;
        assert_eq!(report.outcome, RunOutcome::Researched);

        // every agent reply is recoverable from the trace alone
        let trace_json = report.trace.to_json();
        assert!(trace_json.contains("prefer the canonical standards post"));
        assert!(trace_json.contains("Says a thing."));
        assert!(trace_json.contains("Synthesized answer."));
    }

    #[tokio::test]
    async fn test_fetch_failure_still_yields_one_entry_per_selection() {
        struct HalfFetcher;

        #[async_trait]
        impl DocumentFetcher for HalfFetcher {
            async fn fetch_extract(&self, url: &str) -> Result<String, FetchError> {
                if url.ends_with("/2") {
                    Err(FetchError::Request("connection reset".to_string()))
                } else {
                    Ok(format!("text from {}", url))
                }
            }
        }

        let planner = Arc::new(ScriptedAdapter::new(vec![
            &plan_search("q"),
            &select_ids(&["r1", "r2", "r3"]),
            REFLECT_CONCLUDE,
            SYNTHESIS_OK,
        ]));
        let gateway = Arc::new(StaticGateway::new(vec![docs(10)]));
        let orchestrator = build(
            planner,
            vec![READER_OK, READER_OK],
            gateway,
            Arc::new(HalfFetcher),
            RunConfig::default(),
        );

        let report = orchestrator.run("question").await;

        assert_eq!(report.ledger.len(), 3);
        assert_eq!(report.ledger[0].status, ReadStatus::Ok);
        assert_eq!(report.ledger[1].status, ReadStatus::FetchFailed);
        assert_eq!(report.ledger[1].relevance_score, 0.0);
        assert_eq!(report.ledger[2].status, ReadStatus::Ok);
        assert_eq!(report.outcome, RunOutcome::Researched);
    }

    #[tokio::test]
    async fn test_round_cap_forces_synthesis() {
        let planner = Arc::new(ScriptedAdapter::new(vec![
            &plan_search("q"),
            &select_ids(&[]),
            REFLECT_SEARCH_AGAIN,
            &select_ids(&[]),
            REFLECT_SEARCH_AGAIN,
            &select_ids(&[]),
            REFLECT_SEARCH_AGAIN,
            SYNTHESIS_OK,
        ]));
        let gateway = Arc::new(StaticGateway::new(vec![docs(3), docs(3), docs(3)]));
        let orchestrator = build(
            planner.clone(),
            vec![],
            gateway.clone(),
            Arc::new(InstantFetcher),
            RunConfig::default(),
        );

        let report = orchestrator.run("question").await;

        assert_eq!(
            report.outcome,
            RunOutcome::ForcedSynthesis {
                reason: ForcedReason::RoundCapReached
            }
        );
        assert_eq!(report.rounds, 3);
        assert_eq!(gateway.calls(), 3);
        assert!(report.ledger.is_empty());
        assert!(report.answer.is_some());
        assert_eq!(planner.call_count(), 8);
    }

    #[tokio::test]
    async fn test_zero_round_cap_never_searches() {
        let planner = Arc::new(ScriptedAdapter::new(vec![&plan_search("q"), SYNTHESIS_OK]));
        let gateway = Arc::new(StaticGateway::new(vec![docs(3)]));
        let run_config = RunConfig {
            max_rounds: 0,
            ..Default::default()
        };
        let orchestrator = build(
            planner.clone(),
            vec![],
            gateway.clone(),
            Arc::new(InstantFetcher),
            run_config,
        );

        let report = orchestrator.run("question").await;

        assert_eq!(
            report.outcome,
            RunOutcome::ForcedSynthesis {
                reason: ForcedReason::RoundCapReached
            }
        );
        assert_eq!(report.rounds, 0);
        assert_eq!(gateway.calls(), 0);
        assert!(report.ledger.is_empty());
        assert!(report.answer.is_some());
        // plan, then straight to synthesis
        assert_eq!(planner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_search_error_proceeds_to_reflection() {
        let planner = Arc::new(ScriptedAdapter::new(vec![
            &plan_search("q"),
            REFLECT_CONCLUDE,
            SYNTHESIS_OK,
        ]));
        let orchestrator = build(
            planner.clone(),
            vec![],
            Arc::new(FailingGateway),
            Arc::new(InstantFetcher),
            RunConfig::default(),
        );

        let report = orchestrator.run("question").await;

        assert_eq!(report.outcome, RunOutcome::Researched);
        assert_eq!(report.rounds, 1);
        assert!(report.ledger.is_empty());
        // plan, reflect, synthesize; selection is skipped with no candidates
        assert_eq!(planner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_reflect_failure_forces_synthesis_with_ledger() {
        let planner = Arc::new(ScriptedAdapter::new(vec![
            &plan_search("q"),
            &select_ids(&["r1"]),
            "garbage",
            "more garbage",
            SYNTHESIS_OK,
        ]));
        let gateway = Arc::new(StaticGateway::new(vec![docs(2)]));
        let orchestrator = build(
            planner.clone(),
            vec![READER_OK],
            gateway,
            Arc::new(InstantFetcher),
            RunConfig::default(),
        );

        let report = orchestrator.run("question").await;

        assert_eq!(
            report.outcome,
            RunOutcome::ForcedSynthesis {
                reason: ForcedReason::PlannerFailed
            }
        );
        assert_eq!(report.ledger.len(), 1);
        assert!(report.answer.is_some());
        // plan, select, reflect, one reflect repair, synthesize
        assert_eq!(planner.call_count(), 5);
    }

    #[tokio::test]
    async fn test_invalid_plan_forces_synthesis_over_empty_ledger() {
        let planner = Arc::new(ScriptedAdapter::new(vec![
            "junk",
            "more junk",
            SYNTHESIS_OK,
        ]));
        let gateway = Arc::new(StaticGateway::new(vec![]));
        let orchestrator = build(
            planner.clone(),
            vec![],
            gateway.clone(),
            Arc::new(InstantFetcher),
            RunConfig::default(),
        );

        let report = orchestrator.run("question").await;

        assert_eq!(
            report.outcome,
            RunOutcome::ForcedSynthesis {
                reason: ForcedReason::PlannerFailed
            }
        );
        assert_eq!(report.rounds, 0);
        assert!(report.ledger.is_empty());
        assert!(report.answer.is_some());
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_synthesis_failure_keeps_raw_and_ledger() {
        let planner = Arc::new(ScriptedAdapter::new(vec![
            &plan_search("q"),
            &select_ids(&["r1"]),
            REFLECT_CONCLUDE,
            "bad synthesis",
            "still bad synthesis",
        ]));
        let gateway = Arc::new(StaticGateway::new(vec![docs(1)]));
        let orchestrator = build(
            planner.clone(),
            vec![READER_OK],
            gateway,
            Arc::new(InstantFetcher),
            RunConfig::default(),
        );

        let report = orchestrator.run("question").await;

        assert_eq!(report.outcome, RunOutcome::SynthesisFailed);
        assert!(report.answer.is_none());
        assert_eq!(report.raw_synthesis.as_deref(), Some("still bad synthesis"));
        assert_eq!(report.ledger.len(), 1);
        assert_eq!(planner.call_count(), 5);
    }

    #[tokio::test]
    async fn test_token_budget_forces_synthesis() {
        let planner = Arc::new(ScriptedAdapter::new(vec![
            &plan_search("q"),
            &select_ids(&["r1"]),
            SYNTHESIS_OK,
        ]));
        let gateway = Arc::new(StaticGateway::new(vec![docs(1)]));
        let run_config = RunConfig {
            token_budget: Some(30),
            ..Default::default()
        };
        let orchestrator = build(
            planner.clone(),
            vec![READER_OK],
            gateway,
            Arc::new(InstantFetcher),
            run_config,
        );

        let report = orchestrator.run("question").await;

        assert_eq!(
            report.outcome,
            RunOutcome::ForcedSynthesis {
                reason: ForcedReason::TokenBudgetExhausted
            }
        );
        assert_eq!(report.rounds, 1);
        assert_eq!(report.ledger.len(), 1);
        assert!(report.answer.is_some());
        // reflect was never reached: plan, select, synthesize
        assert_eq!(planner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_deadline_abandons_readers_and_forces_synthesis() {
        let planner = Arc::new(ScriptedAdapter::new(vec![
            &plan_search("q"),
            &select_ids(&["r1"]),
            SYNTHESIS_OK,
        ]));
        let gateway = Arc::new(StaticGateway::new(vec![docs(1)]));
        let run_config = RunConfig {
            deadline_secs: Some(0),
            ..Default::default()
        };
        let orchestrator = build(
            planner.clone(),
            vec![],
            gateway,
            Arc::new(NeverFetcher),
            run_config,
        );

        let report = orchestrator.run("question").await;

        assert_eq!(
            report.outcome,
            RunOutcome::ForcedSynthesis {
                reason: ForcedReason::DeadlineExceeded
            }
        );
        assert_eq!(report.ledger.len(), 1);
        assert_eq!(report.ledger[0].status, ReadStatus::FetchFailed);
        assert!(report.ledger[0]
            .notes
            .as_deref()
            .unwrap_or("")
            .contains("deadline"));
        assert!(report.answer.is_some());
    }
}
