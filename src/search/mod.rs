//! Web Search Module
//!
//! A single `SearchGateway` trait fronts the concrete engine so the research
//! loop can run against in-memory gateways in tests. The production gateway
//! talks to SerpAPI (`serpapi.rs`).
//!
//! Post-processing shared by every gateway lives here:
//! - keyword and domain filters applied to raw engine rows
//! - dense result ids (`r1`, `r2`, ...) assigned after filtering, which the
//!   planner uses to refer to documents during selection

pub mod serpapi;

pub use serpapi::SerpApiGateway;

use crate::models::{CandidateDocument, SearchFilters, SearchQuery};
use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during search operations
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("SerpAPI key not configured")]
    NoApiKey,

    #[error("Search request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse search results: {0}")]
    ParseError(String),
}

/// One round of web search: a query in, a bounded ordered candidate list out.
///
/// A failed search is recoverable for the caller (the round proceeds with
/// zero new candidates), so implementations return an empty list rather than
/// an error when the engine simply found nothing.
#[async_trait]
pub trait SearchGateway: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<CandidateDocument>, SearchError>;
}

/// Lowercased host part of a URL, if it has one.
pub fn domain_of(url: &str) -> Option<String> {
    url.split('/')
        .nth(2)
        .filter(|host| !host.is_empty())
        .map(|host| host.to_lowercase())
}

fn result_domain(doc: &CandidateDocument) -> Option<String> {
    doc.domain
        .as_deref()
        .map(|d| d.to_lowercase())
        .or_else(|| domain_of(&doc.url))
}

/// Apply keyword and domain filters to raw engine rows.
///
/// - `include`: every word must appear in title+snippet (case-insensitive)
/// - `exclude`: any word present drops the row
/// - `allow_domains`: keep only rows whose domain ends with an entry; rows
///   without a resolvable domain are dropped
/// - `deny_domains`: drop rows whose domain ends with an entry
pub fn apply_filters(
    results: Vec<CandidateDocument>,
    filters: &SearchFilters,
) -> Vec<CandidateDocument> {
    if filters.is_empty() {
        return results;
    }

    let include: Vec<String> = filters.include.iter().map(|w| w.to_lowercase()).collect();
    let exclude: Vec<String> = filters.exclude.iter().map(|w| w.to_lowercase()).collect();
    let allow: Vec<String> = filters
        .allow_domains
        .iter()
        .map(|d| d.to_lowercase())
        .collect();
    let deny: Vec<String> = filters
        .deny_domains
        .iter()
        .map(|d| d.to_lowercase())
        .collect();

    results
        .into_iter()
        .filter(|doc| {
            let haystack = format!("{} {}", doc.title, doc.snippet).to_lowercase();
            if !include.iter().all(|word| haystack.contains(word)) {
                return false;
            }
            if exclude.iter().any(|word| haystack.contains(word)) {
                return false;
            }

            let domain = result_domain(doc);
            if !allow.is_empty() {
                match &domain {
                    Some(d) => {
                        if !allow.iter().any(|entry| d.ends_with(entry)) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
            if let Some(d) = &domain {
                if deny.iter().any(|entry| d.ends_with(entry)) {
                    return false;
                }
            }

            true
        })
        .collect()
}

/// Assign the dense ids (`r1`, `r2`, ...) the planner selects by.
///
/// Runs after filtering and truncation so the sequence has no gaps.
pub fn assign_result_ids(results: &mut [CandidateDocument]) {
    for (idx, doc) in results.iter_mut().enumerate() {
        doc.id = format!("r{}", idx + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str, url: &str, snippet: &str) -> CandidateDocument {
        CandidateDocument {
            id: String::new(),
            title: title.to_string(),
            url: url.to_string(),
            snippet: snippet.to_string(),
            domain: None,
            published: None,
        }
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(
            domain_of("https://Example.com/path/page"),
            Some("example.com".to_string())
        );
        assert_eq!(
            domain_of("http://sub.site.org"),
            Some("sub.site.org".to_string())
        );
        assert_eq!(domain_of("not a url"), None);
    }

    #[test]
    fn test_empty_filters_keep_everything() {
        let results = vec![doc("A", "https://a.com/1", "x"), doc("B", "https://b.com/2", "y")];
        let kept = apply_filters(results.clone(), &SearchFilters::default());
        assert_eq!(kept, results);
    }

    #[test]
    fn test_include_requires_every_word() {
        let filters = SearchFilters {
            include: vec!["rust".to_string(), "async".to_string()],
            ..Default::default()
        };
        let results = vec![
            doc("Rust async book", "https://a.com/1", "tasks and executors"),
            doc("Rust intro", "https://a.com/2", "ownership only"),
            doc("Concurrency", "https://a.com/3", "ASYNC in Rust explained"),
        ];
        let kept = apply_filters(results, &filters);
        let titles: Vec<&str> = kept.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["Rust async book", "Concurrency"]);
    }

    #[test]
    fn test_exclude_drops_any_match() {
        let filters = SearchFilters {
            exclude: vec!["sponsored".to_string()],
            ..Default::default()
        };
        let results = vec![
            doc("Review", "https://a.com/1", "independent benchmark"),
            doc("Best tools (Sponsored)", "https://a.com/2", "listicle"),
        ];
        let kept = apply_filters(results, &filters);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "Review");
    }

    #[test]
    fn test_domain_allow_and_deny() {
        let allow = SearchFilters {
            allow_domains: vec!["nature.com".to_string()],
            ..Default::default()
        };
        let deny = SearchFilters {
            deny_domains: vec!["pinterest.com".to_string()],
            ..Default::default()
        };
        let results = vec![
            doc("Paper", "https://www.nature.com/articles/x", ""),
            doc("Board", "https://pinterest.com/pin/1", ""),
            doc("Post", "https://blog.example.net/p", ""),
        ];

        let kept = apply_filters(results.clone(), &allow);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "Paper");

        let kept = apply_filters(results, &deny);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|d| d.title != "Board"));
    }

    #[test]
    fn test_allow_drops_rows_without_a_domain() {
        let filters = SearchFilters {
            allow_domains: vec!["example.com".to_string()],
            ..Default::default()
        };
        let results = vec![doc("No host", "nothing-here", "")];
        assert!(apply_filters(results, &filters).is_empty());
    }

    #[test]
    fn test_assign_result_ids_is_dense() {
        let mut results = vec![
            doc("A", "https://a.com/1", ""),
            doc("B", "https://b.com/2", ""),
            doc("C", "https://c.com/3", ""),
        ];
        assign_result_ids(&mut results);
        let ids: Vec<&str> = results.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }
}
