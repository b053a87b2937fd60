//! Skeleton extraction agent: the initial, unverified outline.

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::types::{CancelToken, TocDetection};
use crate::io::oracle::{Oracle, OracleRequest, parse_structured, run_tool_loop};
use crate::io::prompt::PromptBuilder;
use crate::pages::PageSet;
use crate::tree::{IdAllocator, Section, document_root};

use super::read_page_tool;

const SKELETON_SCHEMA: &str = include_str!("../../schemas/skeleton.schema.json");

/// Configuration for a skeleton-extraction invocation.
#[derive(Debug, Clone)]
pub struct SkeletonAgentConfig {
    /// Maximum sampled pages fed as direct context.
    pub sample_cap: usize,
    /// Maximum TOC entry pages folded into the sample.
    pub toc_entry_cap: usize,
    pub page_excerpt_chars: usize,
    pub prompt_budget_bytes: usize,
    pub max_tool_rounds: u32,
    pub oracle_timeout: Duration,
}

/// Skeleton agent wrapper that owns schema and prompt settings.
#[derive(Debug, Clone)]
pub struct SkeletonAgent {
    config: SkeletonAgentConfig,
}

#[derive(Debug, Deserialize)]
struct SkeletonOutput {
    title: String,
    sections: Vec<SkeletonSection>,
}

#[derive(Debug, Deserialize)]
struct SkeletonSection {
    title: String,
    #[allow(dead_code)]
    level: u32,
    page_start: u32,
    page_end: u32,
    #[serde(default)]
    children: Vec<SkeletonSection>,
}

impl SkeletonAgent {
    pub fn new(config: SkeletonAgentConfig) -> Self {
        Self { config }
    }

    /// Extract the initial outline from a bounded page sample.
    ///
    /// Failure here is fatal for the pipeline: without a skeleton there is
    /// nothing to validate, split, or verify.
    #[instrument(skip_all, fields(total_pages = pages.total_pages(), toc_entries = toc.entries.len()))]
    pub fn extract<O: Oracle>(
        &self,
        oracle: &O,
        pages: &PageSet,
        toc: &TocDetection,
        ids: &mut IdAllocator,
        cancel: &CancelToken,
    ) -> Result<Section> {
        let total = pages.total_pages();
        let sample = sample_pages(pages, toc, self.config.sample_cap, self.config.toc_entry_cap);
        debug!(sampled = sample.len(), "skeleton page sample chosen");

        let mut rendered = String::new();
        for number in &sample {
            rendered.push_str(&pages.tagged_range(
                *number,
                *number,
                self.config.page_excerpt_chars,
            ));
        }
        let hints = render_toc_hints(toc);
        let prompt = PromptBuilder::new(self.config.prompt_budget_bytes).build_skeleton(
            total,
            hints.as_deref(),
            &rendered,
        );

        let request = OracleRequest {
            prompt,
            schema: SKELETON_SCHEMA,
            timeout: self.config.oracle_timeout,
        };
        let tool = read_page_tool(pages, self.config.page_excerpt_chars);
        let value = run_tool_loop(
            oracle,
            &request,
            std::slice::from_ref(&tool),
            self.config.max_tool_rounds,
            cancel,
        )
        .context("build outline skeleton")?;
        let output: SkeletonOutput = parse_structured(value)?;
        Ok(into_tree(output, ids, total))
    }
}

/// Choose the page numbers shown to the oracle: the content start and the page
/// after it, the midpoint to the end, the last page, and up to `toc_entry_cap`
/// TOC entry pages. Deduplicated, sorted, capped at `sample_cap`.
pub(crate) fn sample_pages(
    pages: &PageSet,
    toc: &TocDetection,
    sample_cap: usize,
    toc_entry_cap: usize,
) -> Vec<u32> {
    let total = pages.total_pages();
    let content_start = toc
        .toc_end_page
        .map(|page| page + 1)
        .filter(|page| *page <= total)
        .unwrap_or_else(|| pages.first_content_page());

    let mut sample = vec![
        content_start,
        content_start + 1,
        content_start.midpoint(total),
        total,
    ];
    sample.extend(
        toc.entries
            .iter()
            .take(toc_entry_cap)
            .map(|entry| entry.page_number),
    );
    sample.retain(|number| *number >= 1 && *number <= total);
    sample.sort_unstable();
    sample.dedup();
    sample.truncate(sample_cap);
    sample
}

fn render_toc_hints(toc: &TocDetection) -> Option<String> {
    if toc.entries.is_empty() {
        return None;
    }
    let mut out = String::new();
    for entry in &toc.entries {
        let _ = writeln!(
            out,
            "- {} (page {}, level {})",
            entry.title, entry.page_number, entry.level
        );
    }
    Some(out)
}

/// Convert oracle output into a tree with fresh ids. The root spans the whole
/// document; levels are derived from depth so the parent/child invariant holds
/// regardless of what the oracle reported.
fn into_tree(output: SkeletonOutput, ids: &mut IdAllocator, total_pages: u32) -> Section {
    let mut root = document_root(ids, output.title, total_pages);
    for section in output.sections {
        let child = convert(section, ids, 1);
        root.children.push(child);
    }
    root
}

fn convert(section: SkeletonSection, ids: &mut IdAllocator, level: u32) -> Section {
    let mut node = Section::new(ids.next_id(), section.title, level);
    node.page_start = Some(section.page_start);
    node.page_end = Some(section.page_end);
    node.children = section
        .children
        .into_iter()
        .map(|child| convert(child, ids, level + 1))
        .collect();
    node
}
