//! Bounded, confidence-gated relocation of incorrect boundaries.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::core::range::{OrderedNode, SearchRange, repair_search_range};
use crate::core::types::{CancelToken, Cancelled, FixEvent, RepairSummary};
use crate::io::oracle::{Oracle, OracleRequest, parse_structured, run_tool_loop};
use crate::io::prompt::PromptBuilder;
use crate::pages::PageSet;
use crate::tree::Section;

use super::verifier::BoundaryVerifier;

const LOCATE_SCHEMA: &str = include_str!("../../schemas/locate_heading.schema.json");

/// Configuration for a repair pass.
#[derive(Debug, Clone)]
pub struct RepairerConfig {
    /// Retry rounds before giving up on remaining incorrect nodes.
    pub max_retries: u32,
    /// Minimum oracle confidence to accept a relocation.
    pub confidence_threshold: f64,
    /// Re-verify each accepted fix with a single-node check.
    pub verify_after_fix: bool,
    pub page_excerpt_chars: usize,
    pub prompt_budget_bytes: usize,
    pub oracle_timeout: Duration,
}

/// Boundary repairer wrapper that owns schema and prompt settings.
#[derive(Debug, Clone)]
pub struct BoundaryRepairer {
    config: RepairerConfig,
}

#[derive(Debug, Deserialize)]
struct LocateOutput {
    page_number: Option<u32>,
    confidence: f64,
}

impl BoundaryRepairer {
    pub fn new(config: RepairerConfig) -> Self {
        Self { config }
    }

    /// Relocate the start pages of `incorrect` nodes, retrying until the set
    /// converges or `max_retries` rounds are exhausted. Accepted fixes stream
    /// through `on_fix` in round order, node order within a round. Never
    /// fatal: unrepaired nodes are reported in the summary.
    #[instrument(skip_all, fields(incorrect = incorrect.len(), max_retries = self.config.max_retries))]
    pub fn repair<O: Oracle, F: FnMut(&FixEvent)>(
        &self,
        oracle: &O,
        root: &mut Section,
        incorrect: &[String],
        pages: &PageSet,
        verifier: &BoundaryVerifier,
        cancel: &CancelToken,
        mut on_fix: F,
    ) -> Result<RepairSummary> {
        let mut pending: Vec<String> = incorrect
            .iter()
            .filter(|id| {
                let known = root.find(id).is_some();
                if !known {
                    warn!(id = %id, "incorrect node not in tree, ignoring");
                }
                known
            })
            .cloned()
            .collect();
        let initially_incorrect = pending.len();
        let total_pages = pages.total_pages();

        let mut attempts = 0u32;
        while !pending.is_empty() && attempts < self.config.max_retries {
            attempts += 1;
            let incorrect_set: HashSet<String> = pending.iter().cloned().collect();
            let ordered: Vec<OrderedNode> = root
                .descendants()
                .into_iter()
                .map(|node| OrderedNode {
                    id: node.id.clone(),
                    page_start: node.page_start,
                })
                .collect();

            let mut still_incorrect = Vec::new();
            for id in &pending {
                cancel.check()?;
                let Some(range) =
                    repair_search_range(&ordered, id, &incorrect_set, total_pages)
                else {
                    still_incorrect.push(id.clone());
                    continue;
                };
                let (title, old_page) = {
                    let node = root.find(id).expect("pending ids exist in tree");
                    (node.title.clone(), node.page_start.unwrap_or(0))
                };

                let located = match self.locate(oracle, &title, old_page, range, pages, cancel) {
                    Ok(located) => located,
                    Err(err) => {
                        if err.downcast_ref::<Cancelled>().is_some() {
                            return Err(err);
                        }
                        warn!(id = %id, err = %format!("{err:#}"), "locate failed");
                        still_incorrect.push(id.clone());
                        continue;
                    }
                };

                let Some((new_page, confidence)) = located else {
                    debug!(id = %id, "heading not found in search range");
                    still_incorrect.push(id.clone());
                    continue;
                };
                if confidence <= self.config.confidence_threshold || new_page > total_pages {
                    debug!(id = %id, new_page, confidence, "fix below threshold, keeping incorrect");
                    still_incorrect.push(id.clone());
                    continue;
                }

                root.find_mut(id).expect("pending ids exist in tree").page_start =
                    Some(new_page);
                on_fix(&FixEvent {
                    node_id: id.clone(),
                    old_page,
                    new_page,
                });

                if self.config.verify_after_fix {
                    match verifier.verify_single(oracle, &title, new_page, pages, cancel) {
                        Ok((true, _)) => {}
                        Ok((false, _)) => {
                            debug!(id = %id, new_page, "fixed page failed re-verification");
                            still_incorrect.push(id.clone());
                        }
                        Err(err) => {
                            if err.downcast_ref::<Cancelled>().is_some() {
                                return Err(err);
                            }
                            warn!(id = %id, err = %format!("{err:#}"), "re-verification failed");
                            still_incorrect.push(id.clone());
                        }
                    }
                }
            }
            pending = still_incorrect;
        }

        let fixed = (initially_incorrect - pending.len()) as u32;
        Ok(RepairSummary {
            fixed,
            still_incorrect: pending,
            attempts,
        })
    }

    fn locate<O: Oracle>(
        &self,
        oracle: &O,
        title: &str,
        recorded_page: u32,
        range: SearchRange,
        pages: &PageSet,
        cancel: &CancelToken,
    ) -> Result<Option<(u32, f64)>> {
        let rendered = pages.tagged_range(
            range.first_page,
            range.last_page,
            self.config.page_excerpt_chars,
        );
        let prompt = PromptBuilder::new(self.config.prompt_budget_bytes).build_locate(
            title,
            recorded_page,
            range.first_page,
            range.last_page,
            &rendered,
        );
        let request = OracleRequest {
            prompt,
            schema: LOCATE_SCHEMA,
            timeout: self.config.oracle_timeout,
        };
        let value = run_tool_loop(oracle, &request, &[], 1, cancel)?;
        let output: LocateOutput = parse_structured(value)?;
        Ok(output
            .page_number
            .map(|page| (page, output.confidence.clamp(0.0, 1.0))))
    }
}
