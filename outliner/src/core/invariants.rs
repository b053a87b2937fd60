//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::tree::Section;

/// Check semantic invariants not expressible in JSON Schema:
/// - No duplicate ids
/// - `level` increases by exactly 1 from parent to child
/// - `page_start <= page_end` wherever both are present
pub fn validate_invariants(root: &Section) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    validate_node(root, &mut seen, &mut errors, root.id.as_str());
    errors
}

fn validate_node(
    node: &Section,
    seen: &mut HashSet<String>,
    errors: &mut Vec<String>,
    path: &str,
) {
    if !seen.insert(node.id.clone()) {
        errors.push(format!("duplicate id '{}' at {}", node.id, path));
    }

    if let (Some(start), Some(end)) = (node.page_start, node.page_end)
        && start > end
    {
        errors.push(format!("{}: page_start {} exceeds page_end {}", path, start, end));
    }

    for child in &node.children {
        if child.level != node.level + 1 {
            errors.push(format!(
                "{}/{}: level {} does not follow parent level {}",
                path, child.id, child.level, node.level
            ));
        }
        let child_path = format!("{}/{}", path, child.id);
        validate_node(child, seen, errors, &child_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{section, section_with_range};

    #[test]
    fn valid_tree_has_no_errors() {
        let mut root = section_with_range("s1", "Doc", 0, 1, 10);
        root.children.push(section_with_range("s2", "A", 1, 1, 5));
        root.children.push(section_with_range("s3", "B", 1, 6, 10));
        assert!(validate_invariants(&root).is_empty());
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let mut root = section("s1", "Doc", 0);
        root.children.push(section("s2", "A", 1));
        root.children.push(section("s2", "B", 1));
        let errors = validate_invariants(&root);
        assert!(errors.iter().any(|err| err.contains("duplicate id 's2'")));
    }

    #[test]
    fn level_gaps_are_reported() {
        let mut root = section("s1", "Doc", 0);
        root.children.push(section("s2", "A", 3));
        let errors = validate_invariants(&root);
        assert!(errors.iter().any(|err| err.contains("level 3")));
    }

    #[test]
    fn inverted_ranges_are_reported() {
        let root = section_with_range("s1", "Doc", 0, 9, 3);
        let errors = validate_invariants(&root);
        assert!(errors.iter().any(|err| err.contains("page_start 9")));
    }
}
