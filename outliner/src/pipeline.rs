//! Pipeline orchestration: strictly sequential stages with progress events.
//!
//! TOC detect -> skeleton -> validate/preface -> split -> validate -> verify
//! -> repair. Only the skeleton stage is fatal; every other stage degrades to
//! a reported imperfection. The caller always receives a tree plus the
//! summaries needed to decide whether to trust it.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::agents::repairer::{BoundaryRepairer, RepairerConfig};
use crate::agents::skeleton::{SkeletonAgent, SkeletonAgentConfig};
use crate::agents::splitter::{SectionSplitter, SplitStats, SplitterConfig};
use crate::agents::toc::{TocAgent, TocAgentConfig};
use crate::agents::verifier::{BoundaryVerifier, VerifierConfig};
use crate::core::bounds::{BoundsReport, clamp_to_page_count, insert_preface};
use crate::core::budget::SplitBudget;
use crate::core::types::{
    CancelToken, Cancelled, RepairSummary, TocDetection, VerifySummary,
};
use crate::io::config::OutlinerConfig;
use crate::io::oracle::Oracle;
use crate::pages::PageSet;
use crate::tree::{IdAllocator, Section};

/// Progress event kind, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Started,
    Progress,
    Completed,
    Error,
}

/// One progress event. Delivery, buffering, and backpressure belong to the
/// caller's sink; this core only produces events, in order.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl PipelineEvent {
    fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Everything a run produces. Summaries are `None` when their stage was
/// skipped or failed recoverably.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub tree: Section,
    pub toc: TocDetection,
    pub bounds: BoundsReport,
    pub preface_added: bool,
    pub split: SplitStats,
    pub verification: Option<VerifySummary>,
    pub repair: Option<RepairSummary>,
}

/// Run the full discovery pipeline over `pages`.
///
/// `hints` short-circuits TOC detection when the caller already has entries.
/// Events stream through `on_event`; `cancel` is honored between stages and
/// between tool-loop rounds.
#[instrument(skip_all, fields(total_pages = pages.total_pages()))]
pub fn run_pipeline<O: Oracle, F: FnMut(PipelineEvent)>(
    oracle: &O,
    pages: &PageSet,
    hints: Option<TocDetection>,
    config: &OutlinerConfig,
    cancel: &CancelToken,
    mut on_event: F,
) -> Result<PipelineOutcome> {
    config.validate()?;
    if pages.is_empty() {
        return Err(anyhow::anyhow!("cannot outline an empty document"));
    }
    let total_pages = pages.total_pages();
    let oracle_timeout = Duration::from_secs(config.oracle.timeout_secs);
    let mut ids = IdAllocator::new();

    on_event(PipelineEvent::new(
        EventType::Started,
        json!({"stage": "pipeline", "total_pages": total_pages}),
    ));

    // TOC detection. Recoverable: a failed scan means no hints.
    cancel.check()?;
    let toc = match hints {
        Some(hints) => hints,
        None => {
            on_event(PipelineEvent::new(
                EventType::Progress,
                json!({"stage": "toc_scan"}),
            ));
            let agent = TocAgent::new(TocAgentConfig {
                context_pages: config.toc_context_pages,
                page_excerpt_chars: config.page_excerpt_chars,
                prompt_budget_bytes: config.prompt_budget_bytes,
                max_tool_rounds: config.max_tool_rounds,
                oracle_timeout,
            });
            match agent.detect(oracle, pages, cancel) {
                Ok(toc) => toc,
                Err(err) => {
                    if err.downcast_ref::<Cancelled>().is_some() {
                        return Err(err);
                    }
                    warn!(err = %format!("{err:#}"), "toc scan failed, proceeding without hints");
                    on_event(PipelineEvent::new(
                        EventType::Error,
                        json!({"stage": "toc_scan", "message": format!("{err:#}")}),
                    ));
                    TocDetection::default()
                }
            }
        }
    };

    // Skeleton extraction. Fatal: nothing downstream works without a tree.
    cancel.check()?;
    on_event(PipelineEvent::new(
        EventType::Progress,
        json!({"stage": "skeleton", "toc_entries": toc.entries.len()}),
    ));
    let skeleton_agent = SkeletonAgent::new(SkeletonAgentConfig {
        sample_cap: config.skeleton_sample_cap,
        toc_entry_cap: config.toc_entry_sample_cap,
        page_excerpt_chars: config.page_excerpt_chars,
        prompt_budget_bytes: config.prompt_budget_bytes,
        max_tool_rounds: config.max_tool_rounds,
        oracle_timeout,
    });
    let mut tree = match skeleton_agent.extract(oracle, pages, &toc, &mut ids, cancel) {
        Ok(tree) => tree,
        Err(err) => {
            on_event(PipelineEvent::new(
                EventType::Error,
                json!({"stage": "skeleton", "message": format!("{err:#}"), "fatal": true}),
            ));
            return Err(err);
        }
    };

    // Validation + preface.
    cancel.check()?;
    let mut bounds = clamp_to_page_count(&mut tree, total_pages);
    let preface_added = insert_preface(&mut tree, &mut ids);
    on_event(PipelineEvent::new(
        EventType::Progress,
        json!({
            "stage": "validate",
            "truncated": bounds.truncated_count,
            "preface_added": preface_added
        }),
    ));

    // Recursive split of oversized nodes, then re-validate the new ranges.
    cancel.check()?;
    on_event(PipelineEvent::new(
        EventType::Progress,
        json!({"stage": "split"}),
    ));
    let splitter = SectionSplitter::new(SplitterConfig {
        budget: SplitBudget {
            max_pages_per_node: config.split.max_pages_per_node,
            max_tokens_per_node: config.split.max_tokens_per_node,
        },
        page_excerpt_chars: config.page_excerpt_chars,
        prompt_budget_bytes: config.prompt_budget_bytes,
        skip_repeated_heading: config.split.skip_repeated_heading,
        oracle_timeout,
    });
    let split = splitter.split_tree(oracle, &mut tree, pages, &mut ids, cancel)?;
    bounds.merge(clamp_to_page_count(&mut tree, total_pages));
    on_event(PipelineEvent::new(
        EventType::Progress,
        json!({
            "stage": "split",
            "nodes_split": split.nodes_split,
            "sections_added": split.sections_added,
            "nodes_failed": split.nodes_failed
        }),
    ));

    // Batched verification. Recoverable: a failed batch leaves the summary
    // empty and skips repair.
    cancel.check()?;
    on_event(PipelineEvent::new(
        EventType::Progress,
        json!({"stage": "verify", "nodes": tree.count() - 1}),
    ));
    let verifier = BoundaryVerifier::new(VerifierConfig {
        sample_size: config.verify.sample_size,
        check_page_start: config.verify.check_page_start,
        seed: config.verify.seed,
        page_excerpt_chars: config.page_excerpt_chars,
        prompt_budget_bytes: config.prompt_budget_bytes,
        oracle_timeout,
    });
    let verification = match verifier.verify(oracle, &tree, pages, cancel, |result| {
        on_event(PipelineEvent::new(
            EventType::Progress,
            json!({"stage": "verify", "result": result}),
        ));
    }) {
        Ok(summary) => {
            on_event(PipelineEvent::new(
                EventType::Progress,
                json!({"stage": "verify", "summary": summary}),
            ));
            Some(summary)
        }
        Err(err) => {
            if err.downcast_ref::<Cancelled>().is_some() {
                return Err(err);
            }
            warn!(err = %format!("{err:#}"), "verification failed, skipping repair");
            on_event(PipelineEvent::new(
                EventType::Error,
                json!({"stage": "verify", "message": format!("{err:#}")}),
            ));
            None
        }
    };

    // Repair, only when verification flagged nodes.
    let repair = match &verification {
        Some(summary) if !summary.incorrect_nodes.is_empty() => {
            cancel.check()?;
            on_event(PipelineEvent::new(
                EventType::Progress,
                json!({"stage": "repair", "incorrect": summary.incorrect_nodes.len()}),
            ));
            let repairer = BoundaryRepairer::new(RepairerConfig {
                max_retries: config.repair.max_retries,
                confidence_threshold: config.repair.confidence_threshold,
                verify_after_fix: config.repair.verify_after_fix,
                page_excerpt_chars: config.page_excerpt_chars,
                prompt_budget_bytes: config.prompt_budget_bytes,
                oracle_timeout,
            });
            match repairer.repair(
                oracle,
                &mut tree,
                &summary.incorrect_nodes,
                pages,
                &verifier,
                cancel,
                |fix| {
                    on_event(PipelineEvent::new(
                        EventType::Progress,
                        json!({"stage": "repair", "fix": fix}),
                    ));
                },
            ) {
                Ok(summary) => Some(summary),
                Err(err) => {
                    if err.downcast_ref::<Cancelled>().is_some() {
                        return Err(err);
                    }
                    warn!(err = %format!("{err:#}"), "repair failed");
                    on_event(PipelineEvent::new(
                        EventType::Error,
                        json!({"stage": "repair", "message": format!("{err:#}")}),
                    ));
                    None
                }
            }
        }
        _ => None,
    };

    // A relocation may land past the node's own end page; one more clamp
    // restores the range invariant and is a no-op otherwise.
    bounds.merge(clamp_to_page_count(&mut tree, total_pages));

    info!(
        nodes = tree.count(),
        accuracy = verification.as_ref().map(|summary| summary.accuracy),
        "pipeline finished"
    );
    on_event(PipelineEvent::new(
        EventType::Completed,
        json!({
            "stage": "pipeline",
            "nodes": tree.count(),
            "accuracy": verification.as_ref().map(|summary| summary.accuracy),
            "fixed": repair.as_ref().map(|summary| summary.fixed)
        }),
    ));

    Ok(PipelineOutcome {
        tree,
        toc,
        bounds,
        preface_added,
        split,
        verification,
        repair,
    })
}
