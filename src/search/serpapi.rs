//! SerpAPI Gateway
//!
//! Production `SearchGateway` backed by SerpAPI's Google engines. Builds the
//! engine parameter map (query, locale, result count, recency window via
//! `tbs`) and parses `organic_results` rows out of the returned JSON value,
//! tolerating missing fields. Filtering and id assignment happen after
//! parsing, so the ids the planner sees are dense.

use crate::models::{CandidateDocument, SearchQuery, When};
use crate::search::{apply_filters, assign_result_ids, domain_of, SearchError, SearchGateway};
use async_trait::async_trait;
use serpapi_search_rust::serp_api_search::SerpApiSearch;
use std::collections::HashMap;
use tracing::{debug, info};

/// SerpAPI-backed web search gateway
pub struct SerpApiGateway {
    api_key: String,
    engine: String,
    hl: String,
    gl: String,
}

impl SerpApiGateway {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            engine: "google".to_string(),
            hl: "en".to_string(),
            gl: "us".to_string(),
        }
    }

    /// Configure the gateway from config; `None` when no API key is set.
    pub fn from_config(config: &crate::config::SearchConfig) -> Option<Self> {
        if config.serpapi_key.is_empty() {
            return None;
        }

        Some(Self::new(config.serpapi_key.clone()).with_engine(&config.engine))
    }

    /// Override the SerpAPI engine (`google`, `google_light`, `bing`, ...).
    pub fn with_engine(mut self, engine: &str) -> Self {
        self.engine = engine.to_string();
        self
    }

    fn build_params(&self, query: &SearchQuery) -> HashMap<String, String> {
        let mut params = HashMap::<String, String>::new();
        params.insert("engine".to_string(), self.engine.clone());
        params.insert("q".to_string(), query.query.clone());
        params.insert("hl".to_string(), self.hl.clone());
        params.insert("gl".to_string(), self.gl.clone());
        params.insert("num".to_string(), query.max_results.to_string());
        if let Some(tbs) = freshness_param(query.when) {
            params.insert("tbs".to_string(), tbs.to_string());
        }
        params
    }
}

#[async_trait]
impl SearchGateway for SerpApiGateway {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<CandidateDocument>, SearchError> {
        if self.api_key.is_empty() {
            return Err(SearchError::NoApiKey);
        }

        info!(query = %query.query, when = %query.when, "Searching the web via SerpAPI");

        let params = self.build_params(query);
        let search = SerpApiSearch::google(params, self.api_key.clone());

        let value = search
            .json()
            .await
            .map_err(|e| SearchError::RequestFailed(e.to_string()))?;

        debug!("Raw search response received");

        let mut results = parse_organic_results(&value)?;
        if !query.filters.is_empty() {
            let before = results.len();
            results = apply_filters(results, &query.filters);
            debug!(before, after = results.len(), "Applied result filters");
        }
        results.truncate(query.max_results);
        assign_result_ids(&mut results);

        info!(count = results.len(), "Search completed");
        Ok(results)
    }
}

/// Google `tbs` recency window for a `When` filter.
fn freshness_param(when: When) -> Option<&'static str> {
    match when {
        When::Day => Some("qdr:d"),
        When::Week => Some("qdr:w"),
        When::Month => Some("qdr:m"),
        When::Any => None,
    }
}

/// Parse `organic_results` rows into candidate documents.
///
/// Rows without a link are skipped. A response without `organic_results` is
/// an empty result set unless the engine reported an error.
fn parse_organic_results(value: &serde_json::Value) -> Result<Vec<CandidateDocument>, SearchError> {
    let organic = match value.get("organic_results") {
        Some(organic) => organic,
        None => {
            if let Some(message) = value.get("error").and_then(|v| v.as_str()) {
                return Err(SearchError::RequestFailed(message.to_string()));
            }
            return Ok(Vec::new());
        }
    };

    let rows = organic
        .as_array()
        .ok_or_else(|| SearchError::ParseError("expected array of results".to_string()))?;

    let mut results = Vec::new();
    for row in rows {
        let link = match row.get("link").and_then(|v| v.as_str()) {
            Some(link) if !link.is_empty() => link,
            _ => continue,
        };

        let title = row
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Untitled")
            .to_string();

        let snippet = row
            .get("snippet")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let domain = domain_of(link).or_else(|| {
            row.get("source")
                .and_then(|v| v.as_str())
                .map(|s| s.to_lowercase())
        });

        let published = row
            .get("date")
            .and_then(|v| v.as_str())
            .map(String::from);

        results.push(CandidateDocument {
            id: String::new(),
            title,
            url: link.to_string(),
            snippet,
            domain,
            published,
        });
    }

    Ok(results)
}
