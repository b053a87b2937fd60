//! Batched confidence scoring of section boundaries.
//!
//! The whole point of this stage is its cost shape: verifying N nodes issues
//! one batched oracle call (two with the page-start check), never N calls.

use std::time::Duration;

use anyhow::Result;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::core::types::{CancelToken, VerificationResult, VerifySummary};
use crate::io::oracle::{Oracle, OracleRequest, parse_structured, run_tool_loop};
use crate::io::prompt::{PromptBuilder, VerifyEntry};
use crate::pages::PageSet;
use crate::tree::Section;

const VERIFY_BATCH_SCHEMA: &str = include_str!("../../schemas/verify_batch.schema.json");
const VERIFY_START_SCHEMA: &str = include_str!("../../schemas/verify_start.schema.json");

/// Configuration for a verification pass.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Verify only a uniform random sample of this size (all nodes if unset).
    pub sample_size: Option<usize>,
    /// Issue the second batched call asking whether each heading opens its page.
    pub check_page_start: bool,
    /// RNG seed for sampling, for reproducible runs.
    pub seed: Option<u64>,
    pub page_excerpt_chars: usize,
    pub prompt_budget_bytes: usize,
    pub oracle_timeout: Duration,
}

/// Boundary verifier wrapper that owns schemas and prompt settings.
#[derive(Debug, Clone)]
pub struct BoundaryVerifier {
    config: VerifierConfig,
}

#[derive(Debug, Clone)]
struct Candidate {
    id: String,
    title: String,
    page_start: u32,
}

#[derive(Debug, Deserialize)]
struct BatchOutput {
    results: Vec<BatchRow>,
}

#[derive(Debug, Deserialize)]
struct BatchRow {
    index: usize,
    appears: bool,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct StartOutput {
    results: Vec<StartRow>,
}

#[derive(Debug, Deserialize)]
struct StartRow {
    index: usize,
    at_start: bool,
}

impl BoundaryVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// Verify every positioned non-root node (or a sample of them) with one
    /// batched call. Results stream through `on_result` in submitted order,
    /// followed by the summary. Nodes whose page has no extracted content are
    /// recorded unverified at confidence 0 without spending a call.
    #[instrument(skip_all, fields(check_page_start = self.config.check_page_start))]
    pub fn verify<O: Oracle, F: FnMut(&VerificationResult)>(
        &self,
        oracle: &O,
        root: &Section,
        pages: &PageSet,
        cancel: &CancelToken,
        mut on_result: F,
    ) -> Result<VerifySummary> {
        cancel.check()?;
        let candidates = self.sample(collect_candidates(root));
        debug!(candidates = candidates.len(), "verification batch assembled");

        let mut results: Vec<VerificationResult> = candidates
            .iter()
            .map(|candidate| VerificationResult {
                node_id: candidate.id.clone(),
                title: candidate.title.clone(),
                page_start: candidate.page_start,
                verified: false,
                confidence: 0.0,
                appears_at_start: None,
            })
            .collect();

        let entries: Vec<VerifyEntry> = candidates
            .iter()
            .enumerate()
            .filter_map(|(index, candidate)| {
                let excerpt = pages
                    .excerpt(candidate.page_start, self.config.page_excerpt_chars)
                    .filter(|content| !content.trim().is_empty())?;
                Some(VerifyEntry {
                    index,
                    title: candidate.title.clone(),
                    page_number: candidate.page_start,
                    excerpt,
                })
            })
            .collect();

        if !entries.is_empty() {
            let prompt =
                PromptBuilder::new(self.config.prompt_budget_bytes).build_verify_batch(&entries);
            let request = OracleRequest {
                prompt,
                schema: VERIFY_BATCH_SCHEMA,
                timeout: self.config.oracle_timeout,
            };
            let value = run_tool_loop(oracle, &request, &[], 1, cancel)?;
            let output: BatchOutput = parse_structured(value)?;
            for row in output.results {
                match results.get_mut(row.index) {
                    Some(result) => {
                        result.verified = row.appears;
                        result.confidence = row.confidence.clamp(0.0, 1.0);
                    }
                    None => warn!(index = row.index, "batch row for unknown index, ignored"),
                }
            }

            if self.config.check_page_start {
                let appearing: Vec<VerifyEntry> = entries
                    .iter()
                    .filter(|entry| results[entry.index].verified)
                    .cloned()
                    .collect();
                if !appearing.is_empty() {
                    let prompt = PromptBuilder::new(self.config.prompt_budget_bytes)
                        .build_verify_start(&appearing);
                    let request = OracleRequest {
                        prompt,
                        schema: VERIFY_START_SCHEMA,
                        timeout: self.config.oracle_timeout,
                    };
                    let value = run_tool_loop(oracle, &request, &[], 1, cancel)?;
                    let output: StartOutput = parse_structured(value)?;
                    for row in output.results {
                        match results.get_mut(row.index) {
                            Some(result) => result.appears_at_start = Some(row.at_start),
                            None => {
                                warn!(index = row.index, "start row for unknown index, ignored");
                            }
                        }
                    }
                }
            }
        }

        let mut verified = 0u32;
        let mut failed = 0u32;
        let mut incorrect_nodes = Vec::new();
        for result in &results {
            on_result(result);
            if result.verified {
                verified += 1;
            } else {
                failed += 1;
                incorrect_nodes.push(result.node_id.clone());
            }
        }
        Ok(VerifySummary::from_counts(verified, failed, incorrect_nodes))
    }

    /// Single-node primitive used by the repairer after a fix: does `title`
    /// appear on `page_number`, and with what confidence?
    pub fn verify_single<O: Oracle>(
        &self,
        oracle: &O,
        title: &str,
        page_number: u32,
        pages: &PageSet,
        cancel: &CancelToken,
    ) -> Result<(bool, f64)> {
        let Some(excerpt) = pages
            .excerpt(page_number, self.config.page_excerpt_chars)
            .filter(|content| !content.trim().is_empty())
        else {
            return Ok((false, 0.0));
        };

        let entries = vec![VerifyEntry {
            index: 0,
            title: title.to_string(),
            page_number,
            excerpt,
        }];
        let prompt =
            PromptBuilder::new(self.config.prompt_budget_bytes).build_verify_batch(&entries);
        let request = OracleRequest {
            prompt,
            schema: VERIFY_BATCH_SCHEMA,
            timeout: self.config.oracle_timeout,
        };
        let value = run_tool_loop(oracle, &request, &[], 1, cancel)?;
        let output: BatchOutput = parse_structured(value)?;
        Ok(output
            .results
            .iter()
            .find(|row| row.index == 0)
            .map_or((false, 0.0), |row| {
                (row.appears, row.confidence.clamp(0.0, 1.0))
            }))
    }

    /// Uniform random sample of `sample_size` candidates, document order
    /// preserved. No-op when unset or the batch is already small enough.
    fn sample(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let Some(size) = self.config.sample_size else {
            return candidates;
        };
        if candidates.len() <= size {
            return candidates;
        }
        let mut rng: StdRng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut picked = rand::seq::index::sample(&mut rng, candidates.len(), size).into_vec();
        picked.sort_unstable();
        picked
            .into_iter()
            .map(|index| candidates[index].clone())
            .collect()
    }
}

/// Every non-root node with a defined, positive start page, in document order.
fn collect_candidates(root: &Section) -> Vec<Candidate> {
    root.descendants()
        .into_iter()
        .filter_map(|node| {
            let page_start = node.page_start.filter(|start| *start > 0)?;
            Some(Candidate {
                id: node.id.clone(),
                title: node.title.clone(),
                page_start,
            })
        })
        .collect()
}
