//! Boundary validation: clamp page ranges against document length.

use serde::{Deserialize, Serialize};

use crate::tree::{IdAllocator, Section};

/// Title used for a synthesized lead-in section covering pages before the
/// first positioned child.
pub const PREFACE_TITLE: &str = "Preface";

/// What the validator changed. A second run over the same tree reports zeros.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundsReport {
    /// Nodes whose range was clamped to the document length.
    pub truncated_count: u32,
    /// Titles of nodes whose `page_start` pointed past the last page.
    #[serde(default)]
    pub invalid_titles: Vec<String>,
}

impl BoundsReport {
    pub fn merge(&mut self, other: BoundsReport) {
        self.truncated_count += other.truncated_count;
        self.invalid_titles.extend(other.invalid_titles);
    }
}

/// Clamp every node's range to `1..=total_pages`, in place.
///
/// For each node: `page_start > total_pages` clamps to `total_pages` and
/// records the title; `page_end > total_pages` clamps; a range left inverted
/// afterwards collapses to `page_end = page_start`. Idempotent.
pub fn clamp_to_page_count(root: &mut Section, total_pages: u32) -> BoundsReport {
    let mut report = BoundsReport::default();
    root.walk_mut(&mut |node| {
        let mut clamped = false;
        if let Some(start) = node.page_start
            && start > total_pages
        {
            node.page_start = Some(total_pages);
            report.invalid_titles.push(node.title.clone());
            clamped = true;
        }
        if let Some(end) = node.page_end
            && end > total_pages
        {
            node.page_end = Some(total_pages);
            clamped = true;
        }
        if let (Some(start), Some(end)) = (node.page_start, node.page_end)
            && start > end
        {
            node.page_end = Some(start);
            clamped = true;
        }
        if clamped {
            report.truncated_count += 1;
        }
    });
    report
}

/// Insert a synthetic lead-in section when the root's first child starts past
/// page 1.
///
/// The new child spans `1..=first_child.page_start - 1` at level 1, position 0.
/// Returns `false` without mutating when page 1 is already covered or the
/// first child has no position.
pub fn insert_preface(root: &mut Section, ids: &mut IdAllocator) -> bool {
    let Some(first) = root.children.first() else {
        return false;
    };
    let Some(first_start) = first.page_start else {
        return false;
    };
    if first_start <= 1 {
        return false;
    }

    let mut preface = Section::new(ids.next_id(), PREFACE_TITLE, 1);
    preface.page_start = Some(1);
    preface.page_end = Some(first_start - 1);
    root.children.insert(0, preface);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{section, section_with_range};

    fn tree_with_child(start: u32, end: u32) -> Section {
        let mut root = section_with_range("s1", "Doc", 0, 1, 50);
        root.children
            .push(section_with_range("s2", "Chapter", 1, start, end));
        root
    }

    #[test]
    fn clamps_range_past_document_end() {
        let mut root = tree_with_child(60, 70);
        let report = clamp_to_page_count(&mut root, 50);

        let child = &root.children[0];
        assert_eq!(child.page_start, Some(50));
        assert_eq!(child.page_end, Some(50));
        assert_eq!(report.truncated_count, 1);
        assert_eq!(report.invalid_titles, vec!["Chapter".to_string()]);
    }

    #[test]
    fn clamp_is_idempotent() {
        let mut root = tree_with_child(60, 70);
        clamp_to_page_count(&mut root, 50);
        let before = root.clone();

        let second = clamp_to_page_count(&mut root, 50);
        assert_eq!(root, before);
        assert_eq!(second, BoundsReport::default());
    }

    #[test]
    fn clamp_collapses_inverted_range() {
        let mut root = tree_with_child(9, 3);
        let report = clamp_to_page_count(&mut root, 50);
        assert_eq!(root.children[0].page_end, Some(9));
        assert_eq!(report.truncated_count, 1);
        assert!(report.invalid_titles.is_empty());
    }

    #[test]
    fn clamp_skips_unpositioned_nodes() {
        let mut root = section("s1", "Doc", 0);
        root.children.push(section("s2", "Loose", 1));
        let report = clamp_to_page_count(&mut root, 10);
        assert_eq!(report, BoundsReport::default());
        assert_eq!(root.children[0].page_start, None);
    }

    #[test]
    fn preface_inserted_once() {
        let mut root = section_with_range("s1", "Doc", 0, 1, 50);
        root.children
            .push(section_with_range("s2", "Chapter 1", 1, 5, 20));
        let mut ids = IdAllocator::new();

        assert!(insert_preface(&mut root, &mut ids));
        let preface = &root.children[0];
        assert_eq!(preface.title, PREFACE_TITLE);
        assert_eq!(preface.level, 1);
        assert_eq!(preface.page_start, Some(1));
        assert_eq!(preface.page_end, Some(4));

        assert!(!insert_preface(&mut root, &mut ids));
        assert_eq!(root.children.len(), 2);
    }

    #[test]
    fn preface_skipped_when_page_one_covered() {
        let mut root = section_with_range("s1", "Doc", 0, 1, 50);
        root.children
            .push(section_with_range("s2", "Intro", 1, 1, 4));
        let mut ids = IdAllocator::new();
        assert!(!insert_preface(&mut root, &mut ids));
    }

    #[test]
    fn preface_skipped_for_empty_root() {
        let mut root = section("s1", "Doc", 0);
        let mut ids = IdAllocator::new();
        assert!(!insert_preface(&mut root, &mut ids));
    }
}
