//! Domain model for research runs.
//!
//! Everything the loop passes between stages lives here: search queries and
//! their filters, candidate documents returned by the search gateway, the
//! evidence ledger entries produced by readers, and the terminal run report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ReaderReportMsg;
use crate::trace::RunTrace;

/// Recency filter for a web search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum When {
    Day,
    Week,
    Month,
    #[default]
    Any,
}

impl std::fmt::Display for When {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            When::Day => write!(f, "day"),
            When::Week => write!(f, "week"),
            When::Month => write!(f, "month"),
            When::Any => write!(f, "any"),
        }
    }
}

impl std::str::FromStr for When {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" => Ok(When::Day),
            "week" => Ok(When::Week),
            "month" => Ok(When::Month),
            "any" => Ok(When::Any),
            other => Err(format!(
                "invalid recency filter '{}' (expected day, week, month or any)",
                other
            )),
        }
    }
}

/// In-memory keyword and domain filters applied to search results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub allow_domains: Vec<String>,
    pub deny_domains: Vec<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
            && self.exclude.is_empty()
            && self.allow_domains.is_empty()
            && self.deny_domains.is_empty()
    }
}

/// One concrete search request, produced by planning or reflection and
/// consumed exactly once by the search gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub when: When,
    pub filters: SearchFilters,
    pub max_results: usize,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, when: When, max_results: usize) -> Self {
        Self {
            query: query.into(),
            when,
            filters: SearchFilters::default(),
            max_results,
        }
    }
}

/// One search result row. Ids are assigned in result order (`r1`, `r2`, ...)
/// and stay stable for the rest of the round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDocument {
    pub id: String,
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
}

/// Subset of candidate ids chosen for deep reading, in planner order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionSet {
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Outcome tag for a single reader pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    Ok,
    FetchFailed,
    ParseFailed,
    AgentMalformed,
}

/// One entry in the evidence ledger. Exactly one is produced per selected
/// document per round, failures included, and entries are immutable once
/// appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub round: u32,
    pub doc_id: String,
    pub url: String,
    pub title: String,
    pub summary: String,
    pub key_points: Vec<String>,
    pub relevance_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status: ReadStatus,
}

impl EvidenceEntry {
    /// Build a successful entry from a decoded reader report.
    pub fn from_report(round: u32, doc: &CandidateDocument, report: ReaderReportMsg) -> Self {
        let title = if report.title.is_empty() {
            doc.title.clone()
        } else {
            report.title
        };
        Self {
            round,
            doc_id: doc.id.clone(),
            url: doc.url.clone(),
            title,
            summary: report.summary,
            key_points: report.key_points,
            relevance_score: report.relevance_score,
            notes: report.notes,
            status: ReadStatus::Ok,
        }
    }

    /// Build a degraded entry for a pipeline that failed before producing a
    /// usable report. The failure reason lands in `notes`.
    pub fn failed(
        round: u32,
        doc: &CandidateDocument,
        status: ReadStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            round,
            doc_id: doc.id.clone(),
            url: doc.url.clone(),
            title: doc.title.clone(),
            summary: String::new(),
            key_points: Vec::new(),
            relevance_score: 0.0,
            notes: Some(reason.into()),
            status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReadStatus::Ok
    }
}

/// The terminal answer artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub answer: String,
    pub key_points: Vec<String>,
    pub used_results: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl FinalAnswer {
    /// Wrap a planner's direct answer, skipping research entirely.
    pub fn direct(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            key_points: Vec::new(),
            used_results: Vec::new(),
            notes: Some("Answered directly without web research.".to_string()),
        }
    }
}

/// Why the controller forced synthesis instead of following the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedReason {
    PlannerFailed,
    RoundCapReached,
    DeadlineExceeded,
    TokenBudgetExhausted,
}

impl std::fmt::Display for ForcedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForcedReason::PlannerFailed => write!(f, "planner failed"),
            ForcedReason::RoundCapReached => write!(f, "round cap reached"),
            ForcedReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            ForcedReason::TokenBudgetExhausted => write!(f, "token budget exhausted"),
        }
    }
}

/// How a run ended. Every run reaches exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The planner answered without any search round.
    DirectAnswer,
    /// The loop ran and concluded normally.
    Researched,
    /// The controller cut the loop short and synthesized from what it had.
    ForcedSynthesis { reason: ForcedReason },
    /// Synthesis itself produced no decodable answer.
    SynthesisFailed,
}

/// Terminal result of one research run: the outcome tag, the answer (when one
/// was produced), the full evidence ledger and the step trace.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub question: String,
    pub outcome: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<FinalAnswer>,
    /// Raw synthesis output kept for inspection when decoding failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_synthesis: Option<String>,
    pub rounds: u32,
    pub total_tokens: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ledger: Vec<EvidenceEntry>,
    pub trace: RunTrace,
}
