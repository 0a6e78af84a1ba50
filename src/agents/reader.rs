//! Reader Agent & Dispatcher
//!
//! A reader summarizes one fetched page against the research question. The
//! dispatcher runs one reader pipeline per selected document under a
//! concurrency bound and returns exactly one ledger entry per document, in
//! selection order, no matter which pipelines fail. Fetch errors, malformed
//! agent output, and deadline abandonment all become degraded entries rather
//! than batch failures.

use crate::agents::{invoke_json, AgentExchange};
use crate::config::Config;
use crate::fetch::DocumentFetcher;
use crate::llm::{LLMProviderConfig, LLM};
use crate::models::{CandidateDocument, EvidenceEntry, ReadStatus};
use crate::protocol::{self, ReaderReportMsg};
use crate::types::{AppError, AppResult};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

const READER_TEMPERATURE: f32 = 0.2;

const READER_SYSTEM_PROMPT: &str = r#"You are a page reader for a web research assistant. The user message is a JSON object with the research question and the text of ONE web page.

TASK:
Summarize what THIS page contributes to answering the question.

GUIDELINES:
- Summarize only this page; do NOT answer the question globally
- key_points are concrete facts, numbers, and dates found on the page
- relevance_score is how useful this page is for the question, from 0.0 (useless) to 1.0 (decisive)
- If the text is boilerplate, paywalled, or off-topic, say so and score low

OUTPUT FORMAT (respond with ONLY valid JSON):
{
  "title": "Page title (best effort)",
  "summary": "2-4 sentence summary of what the page says about the question",
  "key_points": ["fact 1", "fact 2"],
  "relevance_score": 0.0,
  "notes": "optional caveats"
}

IMPORTANT:
- Respond with ONLY the JSON object"#;

/// The reader role: one page in, one scored report out.
pub struct Reader {
    llm: LLM,
    model: String,
    max_tokens: u32,
}

impl Reader {
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
            config.llm.reader_model.clone(),
            config.llm.reader_max_tokens,
        ))
    }

    /// Summarize one page excerpt against the question.
    pub async fn read(
        &self,
        question: &str,
        doc: &CandidateDocument,
        excerpt: &str,
    ) -> AppResult<AgentExchange<ReaderReportMsg>> {
        let payload = json!({
            "question": question,
            "result": { "id": doc.id, "title": doc.title, "url": doc.url },
            "page_text": excerpt,
        })
        .to_string();
        invoke_json(
            &self.llm,
            &self.model,
            self.max_tokens,
            READER_TEMPERATURE,
            READER_SYSTEM_PROMPT,
            payload,
            protocol::decode_reader_report,
        )
        .await
    }
}

/// Result of one dispatched round of reading.
#[derive(Debug, Default)]
pub struct ReadBatch {
    /// One entry per selected document, in selection order.
    pub entries: Vec<EvidenceEntry>,
    /// Raw agent reply per document, aligned with `entries`. `None` when the
    /// pipeline never got a reply (fetch failure, abandonment, transport error).
    pub raw_replies: Vec<Option<String>>,
    /// Total reader-agent tokens spent on the batch.
    pub tokens: u32,
}

/// Runs reader pipelines for a selection under a concurrency bound.
pub struct ReaderDispatcher {
    reader: Arc<Reader>,
    fetcher: Arc<dyn DocumentFetcher>,
    concurrency: usize,
}

impl ReaderDispatcher {
    pub fn new(reader: Reader, fetcher: Arc<dyn DocumentFetcher>, concurrency: usize) -> Self {
        Self {
            reader: Arc::new(reader),
            fetcher,
            // a zero-permit pool would never start a pipeline
            concurrency: concurrency.max(1),
        }
    }

    /// Read every selected document and return one entry per document, in
    /// selection order. Never fails: every pipeline outcome is an entry.
    ///
    /// If `deadline` fires while pipelines are in flight, unfinished ones are
    /// aborted and recorded as fetch failures so the round can still reflect
    /// on what completed.
    pub async fn read_all(
        &self,
        question: &str,
        round: u32,
        docs: &[CandidateDocument],
        deadline: Option<Instant>,
    ) -> ReadBatch {
        let mut batch = ReadBatch::default();
        if docs.is_empty() {
            return batch;
        }

        info!(
            round,
            count = docs.len(),
            concurrency = self.concurrency,
            "Dispatching readers"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<(usize, EvidenceEntry, u32, Option<String>)> = JoinSet::new();

        for (idx, doc) in docs.iter().cloned().enumerate() {
            let reader = Arc::clone(&self.reader);
            let fetcher = Arc::clone(&self.fetcher);
            let semaphore = Arc::clone(&semaphore);
            let question = question.to_string();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            idx,
                            EvidenceEntry::failed(
                                round,
                                &doc,
                                ReadStatus::FetchFailed,
                                "reader pool closed",
                            ),
                            0,
                            None,
                        );
                    }
                };
                let (entry, tokens, raw) =
                    read_one(reader.as_ref(), fetcher.as_ref(), &question, round, &doc).await;
                (idx, entry, tokens, raw)
            });
        }

        let mut slots: Vec<Option<(EvidenceEntry, Option<String>)>> = vec![None; docs.len()];
        let mut expired = false;

        while !join_set.is_empty() {
            let finished = match deadline {
                Some(deadline) if !expired => {
                    tokio::select! {
                        res = join_set.join_next() => res,
                        _ = tokio::time::sleep_until(deadline) => {
                            warn!(round, "Run deadline hit with readers in flight; abandoning the rest");
                            expired = true;
                            join_set.abort_all();
                            continue;
                        }
                    }
                }
                _ => join_set.join_next().await,
            };

            match finished {
                Some(Ok((idx, entry, tokens, raw))) => {
                    batch.tokens += tokens;
                    slots[idx] = Some((entry, raw));
                }
                Some(Err(err)) if err.is_cancelled() => {}
                Some(Err(err)) => {
                    warn!(error = %err, "Reader task panicked");
                }
                None => break,
            }
        }

        let fallback_reason = if expired {
            "abandoned: run deadline exceeded"
        } else {
            "reader task failed"
        };
        for (idx, slot) in slots.into_iter().enumerate() {
            let (entry, raw) = slot.unwrap_or_else(|| {
                (
                    EvidenceEntry::failed(round, &docs[idx], ReadStatus::FetchFailed, fallback_reason),
                    None,
                )
            });
            batch.entries.push(entry);
            batch.raw_replies.push(raw);
        }

        info!(round, entries = batch.entries.len(), tokens = batch.tokens, "Reader batch complete");
        batch
    }
}

/// One reader pipeline: fetch, then summarize. Every failure mode maps to a
/// degraded entry; the agent is never invoked for a page that did not fetch.
/// The agent's raw reply rides along so the caller can record it.
async fn read_one(
    reader: &Reader,
    fetcher: &dyn DocumentFetcher,
    question: &str,
    round: u32,
    doc: &CandidateDocument,
) -> (EvidenceEntry, u32, Option<String>) {
    let excerpt = match fetcher.fetch_extract(&doc.url).await {
        Ok(excerpt) => excerpt,
        Err(err) => {
            warn!(doc_id = %doc.id, url = %doc.url, error = %err, "Document fetch failed");
            return (
                EvidenceEntry::failed(round, doc, err.as_read_status(), err.to_string()),
                0,
                None,
            );
        }
    };

    match reader.read(question, doc, &excerpt).await {
        Ok(exchange) => {
            let tokens = exchange.tokens.total_tokens;
            let raw = exchange.raw;
            (
                EvidenceEntry::from_report(round, doc, exchange.value),
                tokens,
                Some(raw),
            )
        }
        Err(err) => {
            warn!(doc_id = %doc.id, error = %err, "Reader agent failed");
            let raw = match &err {
                AppError::Decode(decode_err) => Some(decode_err.raw().to_string()),
                _ => None,
            };
            (
                EvidenceEntry::failed(round, doc, ReadStatus::AgentMalformed, err.to_string()),
                0,
                raw,
            )
        }
    }
}
