//! Table-of-contents detection agent.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::types::{CancelToken, TocDetection};
use crate::io::oracle::{Oracle, OracleRequest, parse_structured, run_tool_loop};
use crate::io::prompt::PromptBuilder;
use crate::pages::PageSet;

use super::read_page_tool;

const TOC_SCAN_SCHEMA: &str = include_str!("../../schemas/toc_scan.schema.json");

/// Configuration for a TOC-scan invocation.
#[derive(Debug, Clone)]
pub struct TocAgentConfig {
    /// Pages included as direct context.
    pub context_pages: u32,
    pub page_excerpt_chars: usize,
    pub prompt_budget_bytes: usize,
    pub max_tool_rounds: u32,
    pub oracle_timeout: Duration,
}

/// TOC-scan agent wrapper that owns schema and prompt settings.
#[derive(Debug, Clone)]
pub struct TocAgent {
    config: TocAgentConfig,
}

impl TocAgent {
    pub fn new(config: TocAgentConfig) -> Self {
        Self { config }
    }

    /// Scan the opening pages for a table of contents.
    ///
    /// The oracle sees the first `context_pages` pages directly and may pull
    /// others through the bounded `read_page` tool. Entries pointing past the
    /// document are dropped; no entries means "proceed without hints".
    #[instrument(skip_all, fields(total_pages = pages.total_pages()))]
    pub fn detect<O: Oracle>(
        &self,
        oracle: &O,
        pages: &PageSet,
        cancel: &CancelToken,
    ) -> Result<TocDetection> {
        let total = pages.total_pages();
        let context_end = self.config.context_pages.min(total).max(1);
        let rendered = pages.tagged_range(1, context_end, self.config.page_excerpt_chars);
        let prompt =
            PromptBuilder::new(self.config.prompt_budget_bytes).build_toc_scan(total, &rendered);

        let request = OracleRequest {
            prompt,
            schema: TOC_SCAN_SCHEMA,
            timeout: self.config.oracle_timeout,
        };
        let tool = read_page_tool(pages, self.config.page_excerpt_chars);
        let value = run_tool_loop(
            oracle,
            &request,
            std::slice::from_ref(&tool),
            self.config.max_tool_rounds,
            cancel,
        )?;
        let mut detection: TocDetection = parse_structured(value)?;
        sanitize(&mut detection, total);
        debug!(
            has_toc = detection.has_toc,
            entries = detection.entries.len(),
            "toc scan finished"
        );
        Ok(detection)
    }
}

fn sanitize(detection: &mut TocDetection, total_pages: u32) {
    if detection.toc_end_page.is_some_and(|page| page > total_pages) {
        warn!(toc_end_page = ?detection.toc_end_page, "toc end page past document, ignoring");
        detection.toc_end_page = None;
    }
    let before = detection.entries.len();
    detection
        .entries
        .retain(|entry| entry.page_number <= total_pages);
    if detection.entries.len() < before {
        warn!(
            dropped = before - detection.entries.len(),
            "dropped toc entries pointing past the document"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::oracle::{OracleReply, ToolCall};
    use crate::test_support::{ScriptedOracle, synthetic_pages};
    use serde_json::json;

    fn agent() -> TocAgent {
        TocAgent::new(TocAgentConfig {
            context_pages: 10,
            page_excerpt_chars: 500,
            prompt_budget_bytes: 100_000,
            max_tool_rounds: 20,
            oracle_timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn detects_toc_from_direct_context() {
        let pages = synthetic_pages(30, 80);
        let oracle = ScriptedOracle::structured(vec![json!({
            "has_toc": true,
            "toc_end_page": 2,
            "entries": [
                {"title": "Introduction", "page_number": 3, "level": 0},
                {"title": "Methods", "page_number": 9, "level": 0}
            ]
        })]);

        let detection = agent()
            .detect(&oracle, &pages, &CancelToken::new())
            .expect("detect");

        assert!(detection.has_toc);
        assert_eq!(detection.toc_end_page, Some(2));
        assert_eq!(detection.entries.len(), 2);
        assert_eq!(detection.entries[0].title, "Introduction");

        let request = &oracle.requests()[0];
        assert!(request.prompt.contains("### Toc Scan Contract"));
        assert!(request.prompt.contains("<page number=\"10\">"));
        assert!(!request.prompt.contains("<page number=\"11\">"));
    }

    #[test]
    fn oracle_can_pull_pages_via_tool() {
        let pages = synthetic_pages(30, 80);
        let oracle = ScriptedOracle::new(vec![
            Ok(OracleReply::ToolCall(ToolCall {
                name: "read_page".to_string(),
                arguments: json!({"page": 25}),
            })),
            Ok(OracleReply::Structured(json!({
                "has_toc": false,
                "entries": []
            }))),
        ]);

        let detection = agent()
            .detect(&oracle, &pages, &CancelToken::new())
            .expect("detect");
        assert!(!detection.has_toc);
        let transcript = oracle.last_transcript().expect("transcript");
        assert!(transcript[0].result.contains("page 25"));
    }

    #[test]
    fn entries_past_document_are_dropped() {
        let pages = synthetic_pages(10, 80);
        let oracle = ScriptedOracle::structured(vec![json!({
            "has_toc": true,
            "toc_end_page": 90,
            "entries": [
                {"title": "Real", "page_number": 4, "level": 0},
                {"title": "Ghost", "page_number": 99, "level": 0}
            ]
        })]);

        let detection = agent()
            .detect(&oracle, &pages, &CancelToken::new())
            .expect("detect");
        assert_eq!(detection.toc_end_page, None);
        assert_eq!(detection.entries.len(), 1);
        assert_eq!(detection.entries[0].title, "Real");
    }

    #[test]
    fn malformed_output_is_an_error() {
        let pages = synthetic_pages(10, 80);
        let oracle = ScriptedOracle::structured(vec![json!({"entries": []})]);
        let err = agent()
            .detect(&oracle, &pages, &CancelToken::new())
            .expect_err("missing has_toc");
        assert!(err.to_string().contains("violates contract"));
    }
}
