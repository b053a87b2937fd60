//! Outline load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

use crate::core::invariants::validate_invariants;
use crate::io::oracle::validate_against_schema;
use crate::tree::Section;

const OUTLINE_SCHEMA: &str = include_str!("../../schemas/outline.schema.json");

/// Load and validate an outline from disk (schema + invariants).
pub fn load_outline(path: &Path) -> Result<Section> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read outline {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_against_schema(&value, OUTLINE_SCHEMA)
        .with_context(|| format!("validate outline {}", path.display()))?;
    let tree: Section = serde_json::from_value(value)
        .with_context(|| format!("deserialize outline {}", path.display()))?;
    validate_outline_invariants(&tree)?;
    Ok(tree)
}

/// Write an outline to disk as pretty JSON with a trailing newline.
pub fn write_outline(path: &Path, tree: &Section) -> Result<()> {
    validate_outline_invariants(tree)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create outline dir {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(tree)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write outline {}", path.display()))
}

fn validate_outline_invariants(tree: &Section) -> Result<()> {
    let errors = validate_invariants(tree);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("outline invariants failed: {}", errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{section, section_with_range};

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("outline.json");

        let mut root = section_with_range("s1", "Doc", 0, 1, 30);
        root.children
            .push(section_with_range("s2", "Intro", 1, 1, 10));
        write_outline(&path, &root).expect("write");

        let loaded = load_outline(&path).expect("load");
        assert_eq!(loaded, root);
    }

    #[test]
    fn invalid_trees_are_refused_on_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("outline.json");

        let mut root = section("s1", "Doc", 0);
        root.children.push(section("s1", "Dup", 1));
        let err = write_outline(&path, &root).expect_err("duplicate ids");
        assert!(err.to_string().contains("invariants failed"));
    }

    #[test]
    fn schema_violations_are_refused_on_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("outline.json");
        fs::write(&path, r#"{"id": "s1", "title": "Doc"}"#).expect("write");
        let err = load_outline(&path).expect_err("missing level");
        assert!(err.to_string().contains("validate outline"));
    }
}
