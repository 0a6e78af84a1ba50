//! Run trace.
//!
//! An ordered record of everything a run did: stage transitions, raw and
//! decoded agent messages, and every degraded path taken. The trace is the
//! artifact returned with the final report; it never feeds back into loop
//! decisions. Events are mirrored to `tracing` for live console output.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Which part of the loop an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStage {
    Plan,
    Search,
    Select,
    Read,
    Reflect,
    Synthesize,
    Final,
}

impl std::fmt::Display for TraceStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceStage::Plan => write!(f, "plan"),
            TraceStage::Search => write!(f, "search"),
            TraceStage::Select => write!(f, "select"),
            TraceStage::Read => write!(f, "read"),
            TraceStage::Reflect => write!(f, "reflect"),
            TraceStage::Synthesize => write!(f, "synthesize"),
            TraceStage::Final => write!(f, "final"),
        }
    }
}

/// One trace entry. `seq` is assigned on append and starts at 1; `round` is 0
/// for events outside any search round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub round: u32,
    pub stage: TraceStage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub error: bool,
}

/// Append-only list of [`TraceEvent`]s for one run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct RunTrace {
    events: Vec<TraceEvent>,
}

impl RunTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, round: u32, stage: TraceStage, message: impl Into<String>) {
        self.push(round, stage, message.into(), None, false);
    }

    pub fn log_data(
        &mut self,
        round: u32,
        stage: TraceStage,
        message: impl Into<String>,
        data: Value,
    ) {
        self.push(round, stage, message.into(), Some(data), false);
    }

    pub fn log_error(&mut self, round: u32, stage: TraceStage, message: impl Into<String>) {
        self.push(round, stage, message.into(), None, true);
    }

    fn push(&mut self, round: u32, stage: TraceStage, message: String, data: Option<Value>, error: bool) {
        if error {
            tracing::warn!(round, stage = %stage, "{}", message);
        } else {
            tracing::info!(round, stage = %stage, "{}", message);
        }
        self.events.push(TraceEvent {
            seq: self.events.len() as u64 + 1,
            at: Utc::now(),
            round,
            stage,
            message,
            data,
            error,
        });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All events as pretty-printed JSON, for the CLI and for callers that
    /// archive runs.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.events).unwrap_or_else(|_| "[]".to_string())
    }
}
