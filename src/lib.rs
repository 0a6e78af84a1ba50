// Delver - Iterative web research agent: plan, search, read, reflect, answer

pub mod config;
pub mod models;
pub mod types;
pub mod agents;
pub mod llm;
pub mod search;    // Search gateway (SerpAPI)
pub mod fetch;     // Page fetch and text extraction
pub mod protocol;  // JSON message formats between controller and agents
pub mod orchestrator;
pub mod trace;

// Re-exports for convenience
pub use config::Config;
pub use models::{FinalAnswer, RunOutcome, RunReport};
pub use orchestrator::Orchestrator;
// Note: Import specific items from types module instead of glob to avoid name conflicts
// e.g., use delver::types::{LLMRequest, LLMResponse, AppResult};
