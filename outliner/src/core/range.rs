//! Neighbor-bounded search ranges for boundary repair.

use std::collections::HashSet;

/// Inclusive page range to search for a relocated section heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRange {
    pub first_page: u32,
    pub last_page: u32,
}

/// A node's position in the flattened document-order listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedNode {
    pub id: String,
    pub page_start: Option<u32>,
}

/// Compute the search range for `target_id`, bounded by the nearest preceding
/// and following document-order neighbors that are not themselves in the
/// incorrect set. Falls back to `1` / `total_pages` at the ends.
///
/// Returns `None` when `target_id` is not in `ordered`.
pub fn repair_search_range(
    ordered: &[OrderedNode],
    target_id: &str,
    incorrect: &HashSet<String>,
    total_pages: u32,
) -> Option<SearchRange> {
    let position = ordered.iter().position(|node| node.id == target_id)?;

    let first_page = ordered[..position]
        .iter()
        .rev()
        .filter(|node| !incorrect.contains(&node.id))
        .find_map(|node| node.page_start)
        .unwrap_or(1);

    let last_page = ordered[position + 1..]
        .iter()
        .filter(|node| !incorrect.contains(&node.id))
        .find_map(|node| node.page_start)
        .unwrap_or(total_pages);

    Some(SearchRange {
        first_page: first_page.min(total_pages.max(1)),
        last_page: last_page.max(first_page),
    })
}
