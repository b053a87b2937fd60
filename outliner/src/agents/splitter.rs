//! Recursive decomposition of oversized sections.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::budget::{SplitBudget, is_oversized};
use crate::core::types::{CancelToken, Cancelled};
use crate::io::oracle::{Oracle, OracleRequest, parse_structured, run_tool_loop};
use crate::io::prompt::PromptBuilder;
use crate::pages::PageSet;
use crate::tree::{IdAllocator, Section};

const SUBSECTIONS_SCHEMA: &str = include_str!("../../schemas/subsections.schema.json");

/// Configuration for the splitter.
#[derive(Debug, Clone)]
pub struct SplitterConfig {
    pub budget: SplitBudget,
    pub page_excerpt_chars: usize,
    pub prompt_budget_bytes: usize,
    /// Drop the first returned subsection when its title repeats the node's
    /// own heading. Tunable; a false-positive match drops a real subsection.
    pub skip_repeated_heading: bool,
    pub oracle_timeout: Duration,
}

/// Counters reported after a split pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SplitStats {
    pub nodes_split: u32,
    pub nodes_failed: u32,
    pub sections_added: u32,
}

/// Depth-first, sequential splitter. Oracle failures leave the node unsplit;
/// only cancellation aborts the pass.
#[derive(Debug, Clone)]
pub struct SectionSplitter {
    config: SplitterConfig,
}

#[derive(Debug, Deserialize)]
struct SubsectionOutput {
    subsections: Vec<SubsectionRow>,
}

#[derive(Debug, Deserialize)]
struct SubsectionRow {
    #[allow(dead_code)]
    structure: String,
    title: String,
    page_start: u32,
}

impl SectionSplitter {
    pub fn new(config: SplitterConfig) -> Self {
        Self { config }
    }

    /// Decompose every oversized node below the root.
    #[instrument(skip_all, fields(nodes = root.count()))]
    pub fn split_tree<O: Oracle>(
        &self,
        oracle: &O,
        root: &mut Section,
        pages: &PageSet,
        ids: &mut IdAllocator,
        cancel: &CancelToken,
    ) -> Result<SplitStats> {
        let mut stats = SplitStats::default();
        for child in &mut root.children {
            self.split_node(oracle, child, pages, ids, cancel, &mut stats)?;
        }
        debug!(?stats, "split pass finished");
        Ok(stats)
    }

    fn split_node<O: Oracle>(
        &self,
        oracle: &O,
        node: &mut Section,
        pages: &PageSet,
        ids: &mut IdAllocator,
        cancel: &CancelToken,
        stats: &mut SplitStats,
    ) -> Result<()> {
        cancel.check()?;

        let mut original_range = None;
        if is_oversized(node, pages, &self.config.budget) {
            let start = node.page_start.expect("oversized node has a range");
            let end = node.page_end.expect("oversized node has a range");
            original_range = Some((start, end));

            match self.request_subsections(oracle, node, start, end, pages, cancel) {
                Ok(rows) => {
                    let kept = self.usable_rows(node, start, end, rows);
                    if kept.is_empty() {
                        debug!(id = %node.id, "no usable subsections, leaving unsplit");
                    } else {
                        apply_split(node, end, &kept, ids);
                        stats.nodes_split += 1;
                        stats.sections_added += kept.len() as u32;
                    }
                }
                Err(err) => {
                    if err.downcast_ref::<Cancelled>().is_some() {
                        return Err(err);
                    }
                    warn!(id = %node.id, err = %format!("{err:#}"), "split failed, leaving node unsplit");
                    stats.nodes_failed += 1;
                }
            }
        }

        for child in &mut node.children {
            // A child spanning the node's entire original range would recurse
            // forever on the same pages.
            if let Some((start, end)) = original_range
                && (child.page_start, child.page_end) == (Some(start), Some(end))
            {
                warn!(id = %child.id, "child covers the full original range, not recursing");
                continue;
            }
            self.split_node(oracle, child, pages, ids, cancel, stats)?;
        }
        Ok(())
    }

    fn request_subsections<O: Oracle>(
        &self,
        oracle: &O,
        node: &Section,
        start: u32,
        end: u32,
        pages: &PageSet,
        cancel: &CancelToken,
    ) -> Result<Vec<SubsectionRow>> {
        let rendered = pages.tagged_range(start, end, self.config.page_excerpt_chars);
        let prompt = PromptBuilder::new(self.config.prompt_budget_bytes)
            .build_split(&node.title, start, end, &rendered);
        let request = OracleRequest {
            prompt,
            schema: SUBSECTIONS_SCHEMA,
            timeout: self.config.oracle_timeout,
        };
        let value = run_tool_loop(oracle, &request, &[], 1, cancel)?;
        let output: SubsectionOutput = parse_structured(value)?;
        Ok(output.subsections)
    }

    /// Apply the skip rule, then keep rows inside the node's range with
    /// strictly increasing start pages.
    fn usable_rows(
        &self,
        node: &Section,
        start: u32,
        end: u32,
        mut rows: Vec<SubsectionRow>,
    ) -> Vec<SubsectionRow> {
        if self.config.skip_repeated_heading
            && rows
                .first()
                .is_some_and(|row| titles_match(&row.title, &node.title))
        {
            debug!(id = %node.id, "first subsection repeats the node heading, skipping");
            rows.remove(0);
        }

        let mut kept: Vec<SubsectionRow> = Vec::with_capacity(rows.len());
        for row in rows {
            if row.page_start < start || row.page_start > end {
                warn!(title = %row.title, page = row.page_start, "subsection outside node range, dropped");
                continue;
            }
            if kept
                .last()
                .is_some_and(|previous| row.page_start <= previous.page_start)
            {
                warn!(title = %row.title, page = row.page_start, "subsection not in reading order, dropped");
                continue;
            }
            kept.push(row);
        }
        kept
    }
}

/// Convert kept rows into children appended after any existing ones. Child N
/// ends where child N+1 starts; the last child inherits the node's original
/// `page_end`; the node keeps only its lead-in span.
fn apply_split(node: &mut Section, original_end: u32, kept: &[SubsectionRow], ids: &mut IdAllocator) {
    let first_start = kept[0].page_start;
    for (position, row) in kept.iter().enumerate() {
        let mut child = Section::new(ids.next_id(), row.title.clone(), node.level + 1);
        child.page_start = Some(row.page_start);
        child.page_end = Some(match kept.get(position + 1) {
            Some(next) => next.page_start - 1,
            None => original_end,
        });
        node.children.push(child);
    }
    let lead_in_end = first_start.saturating_sub(1).max(node.page_start.unwrap_or(1));
    node.page_end = Some(lead_in_end);
}

/// Case-insensitive, whitespace-collapsed title comparison.
fn titles_match(left: &str, right: &str) -> bool {
    static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
    let normalize =
        |title: &str| WHITESPACE.replace_all(title.trim(), " ").to_lowercase();
    normalize(left) == normalize(right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedOracle, section_with_range, synthetic_pages};
    use serde_json::json;

    fn splitter() -> SectionSplitter {
        SectionSplitter::new(SplitterConfig {
            budget: SplitBudget {
                max_pages_per_node: 15,
                max_tokens_per_node: 1_000,
            },
            page_excerpt_chars: 200,
            prompt_budget_bytes: 500_000,
            skip_repeated_heading: true,
            oracle_timeout: Duration::from_secs(5),
        })
    }

    fn big_tree() -> Section {
        let mut root = section_with_range("s1", "Doc", 0, 1, 100);
        root.children
            .push(section_with_range("s2", "Part I", 1, 1, 100));
        root
    }

    fn subsections(rows: &[(&str, &str, u32)]) -> serde_json::Value {
        json!({
            "subsections": rows
                .iter()
                .map(|(structure, title, page)| json!({
                    "structure": structure,
                    "title": title,
                    "page_start": page
                }))
                .collect::<Vec<_>>()
        })
    }

    #[test]
    fn oversized_node_gains_children_and_keeps_lead_in() {
        let pages = synthetic_pages(100, 200);
        let mut root = big_tree();
        let mut ids = IdAllocator::new();
        ids.next_id();
        ids.next_id();
        // First call splits s2; the children (each 30-ish pages) are split
        // candidates too, so script empty follow-ups.
        let oracle = ScriptedOracle::new(vec![
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[
                ("1", "Chapter 1", 5),
                ("2", "Chapter 2", 41),
                ("3", "Chapter 3", 72),
            ]))),
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[]))),
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[]))),
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[]))),
        ]);

        let stats = splitter()
            .split_tree(&oracle, &mut root, &pages, &mut ids, &CancelToken::new())
            .expect("split");

        assert_eq!(stats.nodes_split, 1);
        assert_eq!(stats.sections_added, 3);

        let part = &root.children[0];
        // Lead-in narrowed to pages before the first subsection.
        assert_eq!(part.page_end, Some(4));
        assert_eq!(part.children.len(), 3);
        assert_eq!(part.children[0].page_start, Some(5));
        assert_eq!(part.children[0].page_end, Some(40));
        assert_eq!(part.children[1].page_end, Some(71));
        // Last child inherits the original end.
        assert_eq!(part.children[2].page_end, Some(100));
        assert!(part.children.iter().all(|child| child.level == 2));
    }

    #[test]
    fn repeated_heading_is_skipped() {
        let pages = synthetic_pages(100, 200);
        let mut root = big_tree();
        let mut ids = IdAllocator::new();
        ids.next_id();
        ids.next_id();
        let oracle = ScriptedOracle::new(vec![
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[
                ("1", "  part  i ", 1),
                ("2", "Chapter 1", 30),
                ("3", "Chapter 2", 65),
            ]))),
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[]))),
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[]))),
        ]);

        let stats = splitter()
            .split_tree(&oracle, &mut root, &pages, &mut ids, &CancelToken::new())
            .expect("split");

        assert_eq!(stats.sections_added, 2);
        let part = &root.children[0];
        assert_eq!(part.children[0].title, "Chapter 1");
    }

    #[test]
    fn skip_rule_can_be_disabled() {
        let pages = synthetic_pages(100, 200);
        let mut root = big_tree();
        let mut ids = IdAllocator::new();
        ids.next_id();
        ids.next_id();
        let mut splitter = splitter();
        splitter.config.skip_repeated_heading = false;
        let oracle = ScriptedOracle::new(vec![
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[
                ("1", "Part I", 8),
                ("2", "Chapter 1", 40),
            ]))),
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[]))),
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[]))),
        ]);

        splitter
            .split_tree(&oracle, &mut root, &pages, &mut ids, &CancelToken::new())
            .expect("split");
        assert_eq!(root.children[0].children[0].title, "Part I");
    }

    #[test]
    fn out_of_range_and_unordered_rows_are_dropped() {
        let pages = synthetic_pages(100, 200);
        let mut root = big_tree();
        let mut ids = IdAllocator::new();
        ids.next_id();
        ids.next_id();
        let oracle = ScriptedOracle::new(vec![
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[
                ("1", "Chapter 1", 30),
                ("2", "Ghost", 300),
                ("3", "Backwards", 12),
                ("4", "Chapter 2", 70),
            ]))),
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[]))),
            Ok(crate::io::oracle::OracleReply::Structured(subsections(&[]))),
        ]);

        splitter()
            .split_tree(&oracle, &mut root, &pages, &mut ids, &CancelToken::new())
            .expect("split");

        let titles: Vec<&str> = root.children[0]
            .children
            .iter()
            .map(|child| child.title.as_str())
            .collect();
        assert_eq!(titles, vec!["Chapter 1", "Chapter 2"]);
    }

    #[test]
    fn oracle_failure_leaves_node_unsplit() {
        let pages = synthetic_pages(100, 200);
        let mut root = big_tree();
        let mut ids = IdAllocator::new();
        ids.next_id();
        ids.next_id();
        let oracle = ScriptedOracle::new(vec![Err(anyhow::anyhow!("oracle down"))]);

        let stats = splitter()
            .split_tree(&oracle, &mut root, &pages, &mut ids, &CancelToken::new())
            .expect("split pass survives");

        assert_eq!(stats.nodes_failed, 1);
        assert_eq!(stats.nodes_split, 0);
        assert!(root.children[0].children.is_empty());
        assert_eq!(root.children[0].page_end, Some(100));
    }

    #[test]
    fn small_nodes_never_reach_the_oracle() {
        let pages = synthetic_pages(20, 200);
        let mut root = section_with_range("s1", "Doc", 0, 1, 20);
        root.children
            .push(section_with_range("s2", "Short", 1, 1, 10));
        let mut ids = IdAllocator::new();
        let oracle = ScriptedOracle::new(Vec::new());

        let stats = splitter()
            .split_tree(&oracle, &mut root, &pages, &mut ids, &CancelToken::new())
            .expect("split");
        assert_eq!(stats, SplitStats::default());
        assert!(oracle.requests().is_empty());
    }

    #[test]
    fn single_full_range_child_does_not_recurse() {
        let pages = synthetic_pages(100, 200);
        let mut root = big_tree();
        let mut ids = IdAllocator::new();
        ids.next_id();
        ids.next_id();
        // One subsection spanning the node's entire range; without the guard
        // this would request a split of the identical range again.
        let oracle = ScriptedOracle::new(vec![Ok(crate::io::oracle::OracleReply::Structured(
            subsections(&[("1", "Everything", 1)]),
        ))]);

        let stats = splitter()
            .split_tree(&oracle, &mut root, &pages, &mut ids, &CancelToken::new())
            .expect("split");

        assert_eq!(stats.nodes_split, 1);
        assert_eq!(oracle.requests().len(), 1);
        let child = &root.children[0].children[0];
        assert_eq!(child.page_start, Some(1));
        assert_eq!(child.page_end, Some(100));
    }

    #[test]
    fn cancellation_aborts_the_pass() {
        let pages = synthetic_pages(100, 200);
        let mut root = big_tree();
        let mut ids = IdAllocator::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let oracle = ScriptedOracle::new(Vec::new());

        let err = splitter()
            .split_tree(&oracle, &mut root, &pages, &mut ids, &cancel)
            .expect_err("cancelled");
        assert!(err.downcast_ref::<Cancelled>().is_some());
    }
}
