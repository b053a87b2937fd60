//! Shared budget helpers: oracle-call deadlines and split-size estimates.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use crate::pages::PageSet;
use crate::tree::Section;

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("stage timed out"));
    }
    Ok(remaining)
}

/// Size limits beyond which a section must be split before it can be
/// summarized or verified reliably.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitBudget {
    pub max_pages_per_node: u32,
    pub max_tokens_per_node: u64,
}

impl Default for SplitBudget {
    fn default() -> Self {
        Self {
            max_pages_per_node: 15,
            max_tokens_per_node: 20_000,
        }
    }
}

/// Coarse token estimate over a page range: `ceil(content_len / 4)` per page.
/// A proxy, not a tokenizer.
pub fn estimated_tokens(pages: &PageSet, start: u32, end: u32) -> u64 {
    if start > end {
        return 0;
    }
    (start..=end)
        .filter_map(|number| pages.content(number))
        .map(|content| (content.len() as u64).div_ceil(4))
        .sum()
}

/// True when the node's span exceeds the page budget AND its estimated token
/// count reaches the token budget. Unpositioned nodes are never oversized.
pub fn is_oversized(node: &Section, pages: &PageSet, budget: &SplitBudget) -> bool {
    let (Some(start), Some(end)) = (node.page_start, node.page_end) else {
        return false;
    };
    if start > end {
        return false;
    }
    let span = end - start + 1;
    span > budget.max_pages_per_node
        && estimated_tokens(pages, start, end) >= budget.max_tokens_per_node
}
