//! Search results → prompt context and citation sources.

use crate::{SearchResult, Source};

/// Renders the first `cap` results as numbered excerpts separated by a blank line.
///
/// An empty slice yields an empty string, which callers treat as "no grounding".
pub fn build_context(results: &[SearchResult], cap: usize) -> String {
    results
        .iter()
        .take(cap)
        .enumerate()
        .map(|(i, r)| {
            format!(
                "[{}] 標題: {}\n連結: {}\n摘要: {}",
                i + 1,
                r.title,
                r.url,
                r.snippet
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Citation list for the first `cap` results; an untitled result is labelled by its URL.
pub fn build_sources(results: &[SearchResult], cap: usize) -> Vec<Source> {
    results
        .iter()
        .take(cap)
        .map(|r| Source {
            title: if r.title.is_empty() {
                r.url.clone()
            } else {
                r.title.clone()
            },
            url: r.url.clone(),
        })
        .collect()
}
