//! Agent message codec.
//!
//! Every agent in the loop is expected to answer with exactly one JSON
//! object, either bare or inside a single fenced code block. This module owns
//! all of the scraping and validation: callers hand it raw model output and
//! get back a typed message or a [`DecodeError`] explaining what was wrong.
//! Decoding is pure, so the same raw text always yields the same message.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{SearchFilters, SearchQuery, When};

/// Why a piece of raw model output could not be decoded. Each variant keeps
/// the raw text so fallback paths can surface it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("no JSON block found in output")]
    NoBlock { raw: String },

    #[error("multiple JSON blocks found in output")]
    MultipleBlocks { raw: String },

    #[error("invalid JSON: {message}")]
    InvalidJson { message: String, raw: String },

    #[error("missing required field: {field}")]
    MissingField { field: String, raw: String },

    #[error("field '{field}' has the wrong type (expected {expected})")]
    WrongType {
        field: String,
        expected: String,
        raw: String,
    },

    #[error("field '{field}' is out of range: {value}")]
    OutOfRange {
        field: String,
        value: String,
        raw: String,
    },
}

impl DecodeError {
    /// The raw model output that failed to decode.
    pub fn raw(&self) -> &str {
        match self {
            DecodeError::NoBlock { raw }
            | DecodeError::MultipleBlocks { raw }
            | DecodeError::InvalidJson { raw, .. }
            | DecodeError::MissingField { raw, .. }
            | DecodeError::WrongType { raw, .. }
            | DecodeError::OutOfRange { raw, .. } => raw,
        }
    }
}

/// Planning decision: answer directly or search first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    DirectAnswer,
    SearchThenAnswer,
}

/// Decoded plan message, shared by the planning and reflection stages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub action: PlanAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// The search the planner asked for, before run-level caps are applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchSpec {
    pub query: String,
    pub when: Option<When>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub allow_domains: Vec<String>,
    pub deny_domains: Vec<String>,
    pub max_results: Option<usize>,
}

impl SearchSpec {
    /// Turn the wire request into a bounded [`SearchQuery`]: a missing
    /// `when` means no recency preference, and `max_results` is clamped to
    /// the run-level cap.
    pub fn into_query(self, default_max: usize, cap: usize) -> SearchQuery {
        SearchQuery {
            query: self.query,
            when: self.when.unwrap_or(When::Any),
            filters: SearchFilters {
                include: self.include,
                exclude: self.exclude,
                allow_domains: self.allow_domains,
                deny_domains: self.deny_domains,
            },
            max_results: self.max_results.unwrap_or(default_max).min(cap).max(1),
        }
    }
}

/// Decoded selection message: which candidate ids to read deeply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub selected_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Decoded per-document reader report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReaderReportMsg {
    pub title: String,
    pub summary: String,
    pub key_points: Vec<String>,
    pub relevance_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Decoded synthesis message: the final answer body plus citations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Synthesis {
    pub answer: String,
    pub key_points: Vec<String>,
    pub used_results: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Decode a plan for the initial planning stage. `direct_answer` must carry
/// text when the action is `direct_answer`.
pub fn decode_plan(raw: &str) -> Result<Plan, DecodeError> {
    parse_plan(raw, true)
}

/// Decode a plan for the reflection stage. Here `direct_answer` means
/// "conclude, move to synthesis", so the answer text itself is optional and
/// ignored.
pub fn decode_reflection(raw: &str) -> Result<Plan, DecodeError> {
    parse_plan(raw, false)
}

/// Decode a selection message.
pub fn decode_selection(raw: &str) -> Result<Selection, DecodeError> {
    let obj = parse_object(raw)?;
    let selected_ids = require_str_list(&obj, "selected_ids", raw)?;
    Ok(Selection {
        selected_ids,
        notes: opt_str(&obj, "notes"),
    })
}

/// Decode a reader report. `relevance_score` must be a number in [0, 1].
pub fn decode_reader_report(raw: &str) -> Result<ReaderReportMsg, DecodeError> {
    let obj = parse_object(raw)?;
    let title = require_str(&obj, "title", raw)?;
    let summary = require_str(&obj, "summary", raw)?;
    let key_points = require_str_list(&obj, "key_points", raw)?;
    let relevance_score = require_unit_score(&obj, "relevance_score", raw)?;
    Ok(ReaderReportMsg {
        title,
        summary,
        key_points,
        relevance_score,
        notes: opt_str(&obj, "notes"),
    })
}

/// Decode a synthesis message. The answer body must be non-empty.
pub fn decode_synthesis(raw: &str) -> Result<Synthesis, DecodeError> {
    let obj = parse_object(raw)?;
    let answer = require_str(&obj, "answer", raw)?;
    if answer.trim().is_empty() {
        return Err(DecodeError::MissingField {
            field: "answer".to_string(),
            raw: raw.to_string(),
        });
    }
    Ok(Synthesis {
        answer,
        key_points: require_str_list(&obj, "key_points", raw)?,
        used_results: require_str_list(&obj, "used_results", raw)?,
        notes: opt_str(&obj, "notes"),
    })
}

fn parse_plan(raw: &str, require_direct_text: bool) -> Result<Plan, DecodeError> {
    let obj = parse_object(raw)?;
    let action_str = require_str(&obj, "action", raw)?;
    let action = match action_str.as_str() {
        "direct_answer" => PlanAction::DirectAnswer,
        "search_then_answer" => PlanAction::SearchThenAnswer,
        other => {
            return Err(DecodeError::OutOfRange {
                field: "action".to_string(),
                value: other.to_string(),
                raw: raw.to_string(),
            })
        }
    };

    let direct_answer = opt_str(&obj, "direct_answer");
    let notes = opt_str(&obj, "notes");

    match action {
        PlanAction::DirectAnswer => {
            if require_direct_text && direct_answer.as_deref().map_or(true, |s| s.trim().is_empty())
            {
                return Err(DecodeError::MissingField {
                    field: "direct_answer".to_string(),
                    raw: raw.to_string(),
                });
            }
            Ok(Plan {
                action,
                direct_answer,
                search: None,
                notes,
            })
        }
        PlanAction::SearchThenAnswer => {
            let search = parse_search_spec(&obj, raw)?;
            Ok(Plan {
                action,
                direct_answer,
                search: Some(search),
                notes,
            })
        }
    }
}

fn parse_search_spec(obj: &Map<String, Value>, raw: &str) -> Result<SearchSpec, DecodeError> {
    let search = match obj.get("search") {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => {
            return Err(DecodeError::MissingField {
                field: "search".to_string(),
                raw: raw.to_string(),
            })
        }
        Some(_) => {
            return Err(DecodeError::WrongType {
                field: "search".to_string(),
                expected: "object".to_string(),
                raw: raw.to_string(),
            })
        }
    };

    let query = require_str(search, "search.query", raw)?;
    if query.trim().is_empty() {
        return Err(DecodeError::MissingField {
            field: "search.query".to_string(),
            raw: raw.to_string(),
        });
    }

    let when = match search.get("when") {
        Some(Value::String(s)) if !s.trim().is_empty() => match s.parse::<When>() {
            Ok(when) => Some(when),
            Err(_) => {
                return Err(DecodeError::OutOfRange {
                    field: "search.when".to_string(),
                    value: s.clone(),
                    raw: raw.to_string(),
                })
            }
        },
        _ => None,
    };

    let max_results = match search.get("max_results") {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => {
                return Err(DecodeError::OutOfRange {
                    field: "search.max_results".to_string(),
                    value: "0".to_string(),
                    raw: raw.to_string(),
                })
            }
            Some(n) => Some(n as usize),
            None => {
                return Err(DecodeError::OutOfRange {
                    field: "search.max_results".to_string(),
                    value: n.to_string(),
                    raw: raw.to_string(),
                })
            }
        },
        Some(Value::Null) | None => None,
        Some(_) => {
            return Err(DecodeError::WrongType {
                field: "search.max_results".to_string(),
                expected: "integer".to_string(),
                raw: raw.to_string(),
            })
        }
    };

    Ok(SearchSpec {
        query,
        when,
        include: lenient_str_list(search, "include"),
        exclude: lenient_str_list(search, "exclude"),
        allow_domains: lenient_str_list(search, "allow_domains"),
        deny_domains: lenient_str_list(search, "deny_domains"),
        max_results,
    })
}

/// Locate the one JSON object in a piece of model output and parse it.
fn parse_object(raw: &str) -> Result<Map<String, Value>, DecodeError> {
    let candidate = extract_block(raw)?;
    let value: Value = serde_json::from_str(&candidate).map_err(|e| DecodeError::InvalidJson {
        message: e.to_string(),
        raw: raw.to_string(),
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::WrongType {
            field: "$".to_string(),
            expected: "object".to_string(),
            raw: raw.to_string(),
        }),
    }
}

/// Pull the single structured block out of raw output. Fenced blocks win over
/// bare text; more than one fenced JSON block is an error, not a guess.
fn extract_block(raw: &str) -> Result<String, DecodeError> {
    let mut fenced: Vec<&str> = Vec::new();
    for (i, segment) in raw.split("```").enumerate() {
        if i % 2 == 0 {
            continue;
        }
        let body = strip_fence_tag(segment).trim();
        if body.starts_with('{') {
            fenced.push(body);
        }
    }

    match fenced.len() {
        1 => return Ok(fenced[0].to_string()),
        0 => {}
        _ => {
            return Err(DecodeError::MultipleBlocks {
                raw: raw.to_string(),
            })
        }
    }

    let trimmed = raw.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => Ok(trimmed[start..=end].to_string()),
        _ => Err(DecodeError::NoBlock {
            raw: raw.to_string(),
        }),
    }
}

/// Drop a leading language tag line ("json", "JSON", ...) inside a fence.
fn strip_fence_tag(segment: &str) -> &str {
    match segment.find('\n') {
        Some(idx) => {
            let first_line = &segment[..idx];
            if first_line.contains('{') {
                segment
            } else {
                &segment[idx + 1..]
            }
        }
        None => segment,
    }
}

fn require_str(obj: &Map<String, Value>, field: &str, raw: &str) -> Result<String, DecodeError> {
    // Nested fields are addressed as "outer.inner"; lookup uses the last
    // segment while errors report the full path.
    let key = field.rsplit('.').next().unwrap_or(field);
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(DecodeError::MissingField {
            field: field.to_string(),
            raw: raw.to_string(),
        }),
        Some(_) => Err(DecodeError::WrongType {
            field: field.to_string(),
            expected: "string".to_string(),
            raw: raw.to_string(),
        }),
    }
}

fn opt_str(obj: &Map<String, Value>, field: &str) -> Option<String> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn require_str_list(
    obj: &Map<String, Value>,
    field: &str,
    raw: &str,
) -> Result<Vec<String>, DecodeError> {
    match obj.get(field) {
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    _ => {
                        return Err(DecodeError::WrongType {
                            field: field.to_string(),
                            expected: "array of strings".to_string(),
                            raw: raw.to_string(),
                        })
                    }
                }
            }
            Ok(out)
        }
        Some(Value::Null) | None => Err(DecodeError::MissingField {
            field: field.to_string(),
            raw: raw.to_string(),
        }),
        Some(_) => Err(DecodeError::WrongType {
            field: field.to_string(),
            expected: "array of strings".to_string(),
            raw: raw.to_string(),
        }),
    }
}

/// Optional string list; anything malformed is treated as absent.
fn lenient_str_list(obj: &Map<String, Value>, field: &str) -> Vec<String> {
    match obj.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn require_unit_score(
    obj: &Map<String, Value>,
    field: &str,
    raw: &str,
) -> Result<f64, DecodeError> {
    let value = match obj.get(field) {
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) => v,
            None => {
                return Err(DecodeError::WrongType {
                    field: field.to_string(),
                    expected: "number".to_string(),
                    raw: raw.to_string(),
                })
            }
        },
        Some(Value::Null) | None => {
            return Err(DecodeError::MissingField {
                field: field.to_string(),
                raw: raw.to_string(),
            })
        }
        Some(_) => {
            return Err(DecodeError::WrongType {
                field: field.to_string(),
                expected: "number".to_string(),
                raw: raw.to_string(),
            })
        }
    };
    if !(0.0..=1.0).contains(&value) {
        return Err(DecodeError::OutOfRange {
            field: field.to_string(),
            value: format!("{}", value),
            raw: raw.to_string(),
        });
    }
    Ok(value)
}
