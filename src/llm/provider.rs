use crate::types::{AppError, AppResult, LLMRequest, LLMResponse};
use async_trait::async_trait;

#[async_trait]
pub trait LLMAdapter: Send + Sync {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse>;
}

/// Configuration for an LLM provider.
pub struct LLMProviderConfig {
    pub name: String,
    pub api_key: String,
    /// Optional endpoint override; only honored for the plain "openai"
    /// provider (groq/openrouter carry their own endpoints).
    pub base_url: Option<String>,
}

pub struct LLM {
    adapter: Box<dyn LLMAdapter>,
    provider_name: String,
}

impl LLM {
    pub fn new(provider: LLMProviderConfig) -> AppResult<Self> {
        let adapter: Box<dyn LLMAdapter> = match provider.name.as_str() {
            "openai" => match provider.base_url.as_deref() {
                Some(base) => Box::new(crate::llm::openai::OpenAIAdapter::new_with_api_base(
                    &provider.api_key,
                    base,
                )),
                None => Box::new(crate::llm::openai::OpenAIAdapter::new(&provider.api_key)),
            },
            "groq" => Box::new(crate::llm::groq::GroqAdapter::new(&provider.api_key)),
            "openrouter" => Box::new(crate::llm::openrouter::OpenRouterAdapter::new(
                &provider.api_key,
            )),
            other => {
                return Err(AppError::Config(format!(
                    "unsupported LLM provider: {}",
                    other
                )))
            }
        };

        Ok(Self {
            adapter,
            provider_name: provider.name,
        })
    }

    /// Wrap an adapter directly, bypassing provider dispatch. Used by tests
    /// and by callers that bring their own adapter.
    pub fn from_adapter(adapter: Box<dyn LLMAdapter>, name: impl Into<String>) -> Self {
        Self {
            adapter,
            provider_name: name.into(),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        self.adapter.create_chat_completion(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_is_a_config_error() {
        let result = LLM::new(LLMProviderConfig {
            name: "carrier-pigeon".to_string(),
            api_key: "k".to_string(),
            base_url: None,
        });
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_known_providers_construct() {
        for name in ["openai", "groq", "openrouter"] {
            let llm = LLM::new(LLMProviderConfig {
                name: name.to_string(),
                api_key: "test-key".to_string(),
                base_url: None,
            })
            .unwrap();
            assert_eq!(llm.provider_name(), name);
        }
    }
}
