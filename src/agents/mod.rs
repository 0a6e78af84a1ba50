//! Agent System
//!
//! The two agent roles that drive the research loop:
//!
//! - **Planner**: decides whether to research at all, which results to read,
//!   whether to keep searching, and composes the final answer
//! - **Reader**: summarizes one fetched document and scores its relevance
//!
//! ## Loop Overview
//!
//! ```text
//! Question
//!     │
//!     ▼
//! ┌─────────┐  direct_answer
//! │  plan   │ ───────────────▶ Final Answer
//! └─────────┘
//!     │ search_then_answer
//!     ▼
//! ┌─────────┐    ┌─────────┐    ┌──────────┐
//! │ search  │ ──▶│ select  │ ──▶│ readers  │  (bounded concurrency)
//! └─────────┘    └─────────┘    └──────────┘
//!     ▲                              │
//!     │ search_then_answer           ▼
//! ┌─────────┐                Evidence Ledger
//! │ reflect │ ◀──────────────────────┘
//! └─────────┘
//!     │ conclude, or round/time/token cap
//!     ▼
//! ┌────────────┐
//! │ synthesize │ ──▶ Final Answer
//! └────────────┘
//! ```
//!
//! Every agent exchange goes through [`invoke_json`]: one chat call, strict
//! JSON decoding, at most one repair turn on malformed output.

pub mod planner;
pub mod reader;

// Re-export main components
pub use planner::Planner;
pub use reader::{ReadBatch, Reader, ReaderDispatcher};

use crate::llm::LLM;
use crate::protocol::DecodeError;
use crate::types::{AppError, AppResult, LLMMessage, LLMRequest, TokenUsage};
use tracing::warn;

/// One decoded agent exchange plus the bookkeeping the controller records.
#[derive(Debug)]
pub struct AgentExchange<T> {
    pub value: T,
    /// Raw text of the reply that decoded successfully.
    pub raw: String,
    /// Usage summed over the first call and any repair call.
    pub tokens: TokenUsage,
    pub repaired: bool,
}

impl<T> AgentExchange<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AgentExchange<U> {
        AgentExchange {
            value: f(self.value),
            raw: self.raw,
            tokens: self.tokens,
            repaired: self.repaired,
        }
    }
}

/// Invoke an agent and decode its JSON reply.
///
/// On a decode failure the malformed reply and the decode reason are appended
/// to the conversation and the agent is asked once to reissue valid output. A
/// second failure is returned as `AppError::Decode` carrying the raw text.
pub(crate) async fn invoke_json<T>(
    llm: &LLM,
    model: &str,
    max_tokens: u32,
    temperature: f32,
    system_prompt: &str,
    payload: String,
    decode: impl Fn(&str) -> Result<T, DecodeError>,
) -> AppResult<AgentExchange<T>> {
    let mut messages = vec![LLMMessage::user(payload)];
    let mut tokens = TokenUsage::default();

    let request = LLMRequest {
        model: model.to_string(),
        messages: messages.clone(),
        max_tokens: Some(max_tokens),
        temperature: Some(temperature),
        system_instruction: Some(system_prompt.to_string()),
        json_mode: true,
    };
    let response = llm.create_chat_completion(&request).await?;
    add_usage(&mut tokens, response.usage);

    let first_error = match decode(&response.content) {
        Ok(value) => {
            return Ok(AgentExchange {
                value,
                raw: response.content,
                tokens,
                repaired: false,
            });
        }
        Err(err) => err,
    };

    warn!(error = %first_error, "Agent output failed to decode; requesting repair");
    messages.push(LLMMessage::assistant(&response.content));
    messages.push(LLMMessage::user(format!(
        "Your previous output was invalid: {}. Reply again with ONLY a single valid JSON object in the required format.",
        first_error
    )));

    let repair_request = LLMRequest {
        model: model.to_string(),
        messages,
        max_tokens: Some(max_tokens),
        temperature: Some(temperature),
        system_instruction: Some(system_prompt.to_string()),
        json_mode: true,
    };
    let repair = llm.create_chat_completion(&repair_request).await?;
    add_usage(&mut tokens, repair.usage);

    match decode(&repair.content) {
        Ok(value) => Ok(AgentExchange {
            value,
            raw: repair.content,
            tokens,
            repaired: true,
        }),
        Err(err) => {
            warn!(error = %err, "Agent repair output still invalid");
            Err(AppError::Decode(err))
        }
    }
}

fn add_usage(total: &mut TokenUsage, usage: TokenUsage) {
    total.prompt_tokens += usage.prompt_tokens;
    total.completion_tokens += usage.completion_tokens;
    total.total_tokens += usage.total_tokens;
}
