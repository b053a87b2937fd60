//! Prompt rendering for oracle interactions.
//!
//! Templates are compiled once per builder; page excerpts arrive pre-bounded,
//! and the rendered prompt is clipped to a byte budget as a final guard.

use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

const TOC_SCAN_TEMPLATE: &str = include_str!("prompts/toc_scan.md");
const SKELETON_TEMPLATE: &str = include_str!("prompts/skeleton.md");
const SPLIT_TEMPLATE: &str = include_str!("prompts/split_section.md");
const VERIFY_BATCH_TEMPLATE: &str = include_str!("prompts/verify_batch.md");
const VERIFY_START_TEMPLATE: &str = include_str!("prompts/verify_start.md");
const LOCATE_TEMPLATE: &str = include_str!("prompts/locate_heading.md");

/// One candidate block in a batched verification prompt.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyEntry {
    pub index: usize,
    pub title: String,
    pub page_number: u32,
    pub excerpt: String,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        for (name, template) in [
            ("toc_scan", TOC_SCAN_TEMPLATE),
            ("skeleton", SKELETON_TEMPLATE),
            ("split_section", SPLIT_TEMPLATE),
            ("verify_batch", VERIFY_BATCH_TEMPLATE),
            ("verify_start", VERIFY_START_TEMPLATE),
            ("locate_heading", LOCATE_TEMPLATE),
        ] {
            env.add_template(name, template)
                .expect("prompt template should be valid");
        }
        Self { env }
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> String {
        self.env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .expect("prompt template rendering should not fail")
    }
}

/// Builds prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_toc_scan(&self, total_pages: u32, pages: &str) -> String {
        let engine = PromptEngine::new();
        self.clip(engine.render(
            "toc_scan",
            context! {
                total_pages => total_pages,
                pages => pages.trim_end(),
            },
        ))
    }

    pub fn build_skeleton(
        &self,
        total_pages: u32,
        toc_entries: Option<&str>,
        pages: &str,
    ) -> String {
        let engine = PromptEngine::new();
        self.clip(engine.render(
            "skeleton",
            context! {
                total_pages => total_pages,
                toc_entries => toc_entries.map(str::trim).filter(|s| !s.is_empty()),
                pages => pages.trim_end(),
            },
        ))
    }

    pub fn build_split(&self, title: &str, page_start: u32, page_end: u32, pages: &str) -> String {
        let engine = PromptEngine::new();
        self.clip(engine.render(
            "split_section",
            context! {
                title => title,
                page_start => page_start,
                page_end => page_end,
                pages => pages.trim_end(),
            },
        ))
    }

    pub fn build_verify_batch(&self, entries: &[VerifyEntry]) -> String {
        let engine = PromptEngine::new();
        self.clip(engine.render("verify_batch", context! { entries => entries }))
    }

    pub fn build_verify_start(&self, entries: &[VerifyEntry]) -> String {
        let engine = PromptEngine::new();
        self.clip(engine.render("verify_start", context! { entries => entries }))
    }

    pub fn build_locate(
        &self,
        title: &str,
        recorded_page: u32,
        first_page: u32,
        last_page: u32,
        pages: &str,
    ) -> String {
        let engine = PromptEngine::new();
        self.clip(engine.render(
            "locate_heading",
            context! {
                title => title,
                recorded_page => recorded_page,
                first_page => first_page,
                last_page => last_page,
                pages => pages.trim_end(),
            },
        ))
    }

    fn clip(&self, prompt: String) -> String {
        if prompt.len() <= self.budget_bytes {
            return prompt;
        }
        let mut cut = self.budget_bytes;
        while cut > 0 && !prompt.is_char_boundary(cut) {
            cut -= 1;
        }
        debug!(
            bytes_dropped = prompt.len() - cut,
            "clipped prompt to budget"
        );
        format!("{}\n[truncated]", &prompt[..cut])
    }
}
