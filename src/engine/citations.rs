//! Citation extraction from tool results and final text.
//!
//! Offsets on produced [`Annotation`]s are placeholders (`i * 100`,
//! `(i + 1) * 100`), not character positions in the answer text.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::normalized::Annotation;

static MARKDOWN_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]\n]*)\]\((https?://[^\s)]+)\)").unwrap());

static BARE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>()\[\]"'`]+"#).unwrap());

const PLACEHOLDER_SPAN: usize = 100;
const MAX_DEPTH: usize = 6;

/// Candidate `(url, title)` pair before deduplication.
type Candidate = (String, Option<String>);

/// Produces deduplicated annotations, one batch per extraction pass.
#[derive(Debug, Default)]
pub struct CitationExtractor {
    emitted: HashSet<String>,
}

impl CitationExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Extracts citations from one tool result.
    ///
    /// Structured `url` fields win; the serialized result is scanned as text
    /// only when it has none.
    pub fn from_tool_result(&mut self, result: &Value) -> Option<Vec<Annotation>> {
        let mut candidates = Vec::new();
        collect_structured(result, 0, &mut candidates);

        if candidates.is_empty() {
            let text = match result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            candidates = scan_text(&text);
        }

        self.finish_pass(candidates, false)
    }

    /// Final pass over the accumulated answer text.
    ///
    /// Only URLs not emitted by an earlier pass of this session are returned.
    pub fn from_final_text(&mut self, text: &str) -> Option<Vec<Annotation>> {
        self.finish_pass(scan_text(text), true)
    }

    fn finish_pass(
        &mut self,
        candidates: Vec<Candidate>,
        only_new: bool,
    ) -> Option<Vec<Annotation>> {
        let candidates = candidates
            .into_iter()
            .filter(|(url, _)| !only_new || !self.emitted.contains(url));
        let annotations = annotate(candidates);
        if annotations.is_empty() {
            return None;
        }
        self.emitted
            .extend(annotations.iter().map(|a| a.url.clone()));
        Some(annotations)
    }
}

/// Deduplicates by exact URL, keeping the first title, and assigns
/// placeholder offsets.
fn annotate(candidates: impl IntoIterator<Item = Candidate>) -> Vec<Annotation> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|(url, _)| seen.insert(url.clone()))
        .enumerate()
        .map(|(i, (url, title))| Annotation {
            title: title.unwrap_or_else(|| url.clone()),
            url,
            start_index: i * PLACEHOLDER_SPAN,
            end_index: (i + 1) * PLACEHOLDER_SPAN,
        })
        .collect()
}

fn collect_structured(value: &Value, depth: usize, out: &mut Vec<Candidate>) {
    if depth > MAX_DEPTH {
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_structured(item, depth + 1, out);
            }
        }
        Value::Object(obj) => {
            if let Some(url) = obj.get("url").and_then(Value::as_str).and_then(valid_url) {
                let title = ["title", "name"]
                    .iter()
                    .filter_map(|k| obj.get(*k).and_then(Value::as_str))
                    .map(str::trim)
                    .find(|t| !t.is_empty())
                    .map(ToString::to_string);
                out.push((url, title));
            }
            if let Some(urls) = obj.get("urls").and_then(Value::as_array) {
                for url in urls {
                    match url {
                        Value::String(s) => {
                            if let Some(url) = valid_url(s) {
                                out.push((url, None));
                            }
                        }
                        other => collect_structured(other, depth + 1, out),
                    }
                }
            }
            for (key, nested) in obj {
                if key != "urls" && (nested.is_array() || nested.is_object()) {
                    collect_structured(nested, depth + 1, out);
                }
            }
        }
        _ => {}
    }
}

/// Markdown links first so their titles win, then bare URLs.
fn scan_text(text: &str) -> Vec<Candidate> {
    let mut out = Vec::new();

    for caps in MARKDOWN_LINK.captures_iter(text) {
        let Some(url) = caps.get(2).and_then(|m| valid_url(m.as_str())) else {
            continue;
        };
        let title = caps
            .get(1)
            .map(|m| m.as_str().trim())
            .filter(|t| !t.is_empty())
            .map(ToString::to_string);
        out.push((url, title));
    }

    for m in BARE_URL.find_iter(text) {
        if let Some(url) = valid_url(m.as_str()) {
            out.push((url, None));
        }
    }

    out
}

fn valid_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches(['.', ',', ';', ':', '!', '?']);
    let parsed = url::Url::parse(trimmed).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return None;
    }
    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_markdown_link_deduplicated() {
        let mut ex = CitationExtractor::new();
        let annotations = ex
            .from_final_text("See [A](https://x.com) and again [A](https://x.com).")
            .unwrap();

        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].url, "https://x.com");
        assert_eq!(annotations[0].title, "A");
    }

    #[test]
    fn test_placeholder_offsets() {
        let mut ex = CitationExtractor::new();
        let annotations = ex
            .from_final_text("[One](https://one.dev) [Two](https://two.dev) https://three.dev.")
            .unwrap();

        let spans: Vec<_> = annotations
            .iter()
            .map(|a| (a.url.as_str(), a.start_index, a.end_index))
            .collect();
        assert_eq!(
            spans,
            vec![
                ("https://one.dev", 0, 100),
                ("https://two.dev", 100, 200),
                ("https://three.dev", 200, 300),
            ]
        );
        assert_eq!(annotations[2].title, "https://three.dev");
    }

    #[test]
    fn test_structured_urls_array() {
        let mut ex = CitationExtractor::new();
        let annotations = ex
            .from_tool_result(&json!({ "urls": ["https://a.com", "not a url", "https://a.com"] }))
            .unwrap();

        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].url, "https://a.com");
    }

    #[test]
    fn test_structured_results_with_titles() {
        let mut ex = CitationExtractor::new();
        let annotations = ex
            .from_tool_result(&json!({
                "results": [
                    { "url": "https://docs.rs", "title": "Docs" },
                    { "url": "https://crates.io", "title": "" }
                ],
                "summary": "also mentions https://ignored.example"
            }))
            .unwrap();

        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].title, "Docs");
        assert_eq!(annotations[1].title, "https://crates.io");
    }

    #[test]
    fn test_single_url_object() {
        let mut ex = CitationExtractor::new();
        let annotations = ex
            .from_tool_result(&json!({ "url": "https://single.example", "title": "One" }))
            .unwrap();
        assert_eq!(annotations[0].title, "One");
    }

    #[test]
    fn test_text_result_is_scanned() {
        let mut ex = CitationExtractor::new();
        let annotations = ex
            .from_tool_result(&json!("Found it at https://blog.example/post, enjoy"))
            .unwrap();
        assert_eq!(annotations[0].url, "https://blog.example/post");
    }

    #[test]
    fn test_no_citations() {
        let mut ex = CitationExtractor::new();
        assert_eq!(ex.from_tool_result(&json!({ "value": 42 })), None);
        assert_eq!(ex.from_final_text("plain text"), None);
    }

    #[test]
    fn test_final_pass_skips_already_emitted() {
        let mut ex = CitationExtractor::new();
        ex.from_tool_result(&json!({ "urls": ["https://a.com"] }));

        let annotations = ex
            .from_final_text("Sources: [A](https://a.com), [B](https://b.com)")
            .unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].url, "https://b.com");
        assert_eq!(annotations[0].start_index, 0);

        assert_eq!(ex.from_final_text("[A](https://a.com)"), None);
    }
}
