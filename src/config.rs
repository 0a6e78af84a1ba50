use anyhow::Result;
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub llm: LLMConfig,
    pub search: SearchConfig,
    pub fetch: FetchConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    pub provider: String,
    pub openai_api_key: String,
    pub groq_api_key: String,
    pub openrouter_api_key: String,
    pub base_url: Option<String>,
    pub planner_model: String,
    pub planner_max_tokens: u32,
    pub reader_model: String,
    pub reader_max_tokens: u32,
}

impl LLMConfig {
    /// API key for the configured provider, if one is set.
    pub fn active_api_key(&self) -> Option<String> {
        let key = match self.provider.as_str() {
            "openai" => &self.openai_api_key,
            "groq" => &self.groq_api_key,
            "openrouter" => &self.openrouter_api_key,
            _ => return None,
        };
        if key.is_empty() {
            None
        } else {
            Some(key.clone())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub serpapi_key: String,
    pub engine: String,
    pub max_results: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub excerpt_max_chars: usize,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub max_rounds: u32,
    pub concurrency: usize,
    pub per_round_result_cap: usize,
    pub per_round_selection_cap: usize,
    pub deadline_secs: Option<u64>,
    pub token_budget: Option<u32>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            concurrency: 6,
            per_round_result_cap: 10,
            per_round_selection_cap: 4,
            deadline_secs: None,
            token_budget: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            llm: LLMConfig {
                provider: env::var("DELVER_LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string()),
                openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                groq_api_key: env::var("GROQ_API_KEY").unwrap_or_default(),
                openrouter_api_key: env::var("OPENROUTER_API_KEY").unwrap_or_default(),
                base_url: env::var("OPENAI_BASE_URL").ok(),
                planner_model: env::var("DELVER_PLANNER_MODEL")
                    .unwrap_or_else(|_| "gpt-4o".to_string()),
                planner_max_tokens: env::var("DELVER_PLANNER_MAX_TOKENS")
                    .unwrap_or_else(|_| "4096".to_string())
                    .parse()?,
                reader_model: env::var("DELVER_READER_MODEL")
                    .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                reader_max_tokens: env::var("DELVER_READER_MAX_TOKENS")
                    .unwrap_or_else(|_| "1536".to_string())
                    .parse()?,
            },
            search: SearchConfig {
                serpapi_key: env::var("SERPAPI_KEY").unwrap_or_default(),
                engine: env::var("DELVER_SEARCH_ENGINE").unwrap_or_else(|_| "google".to_string()),
                max_results: env::var("DELVER_MAX_RESULTS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
            },
            fetch: FetchConfig {
                timeout_secs: env::var("DELVER_FETCH_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "12".to_string())
                    .parse()?,
                excerpt_max_chars: env::var("DELVER_EXCERPT_MAX_CHARS")
                    .unwrap_or_else(|_| "8000".to_string())
                    .parse()?,
                user_agent: env::var("DELVER_USER_AGENT")
                    .unwrap_or_else(|_| "Mozilla/5.0 (compatible; delver/0.1)".to_string()),
            },
            run: RunConfig {
                max_rounds: env::var("DELVER_MAX_ROUNDS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()?,
                concurrency: env::var("DELVER_CONCURRENCY")
                    .unwrap_or_else(|_| "6".to_string())
                    .parse()?,
                per_round_result_cap: env::var("DELVER_RESULT_CAP")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
                per_round_selection_cap: env::var("DELVER_SELECTION_CAP")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()?,
                deadline_secs: env::var("DELVER_DEADLINE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok()),
                token_budget: env::var("DELVER_TOKEN_BUDGET")
                    .ok()
                    .and_then(|v| v.parse().ok()),
            },
        })
    }
}
