//! File-backed page input for the CLI.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::pages::{Page, PageSet};

/// Load pages from a JSON array of `{page_number, content}` objects.
pub fn load_pages(path: &Path) -> Result<PageSet> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read pages {}", path.display()))?;
    let pages: Vec<Page> =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if pages.is_empty() {
        return Err(anyhow!("no pages in {}", path.display()));
    }
    if let Some(bad) = pages.iter().find(|page| page.page_number == 0) {
        return Err(anyhow!(
            "page numbers start at 1, found 0 in {} ({} chars)",
            path.display(),
            bad.content.len()
        ));
    }
    Ok(PageSet::new(pages))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_and_orders_pages() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pages.json");
        fs::write(
            &path,
            r#"[{"page_number": 2, "content": "b"}, {"page_number": 1, "content": "a"}]"#,
        )
        .expect("write pages");

        let pages = load_pages(&path).expect("load");
        assert_eq!(pages.total_pages(), 2);
        assert_eq!(pages.content(1), Some("a"));
    }

    #[test]
    fn rejects_empty_and_zero_numbered_input() {
        let temp = tempfile::tempdir().expect("tempdir");
        let empty = temp.path().join("empty.json");
        fs::write(&empty, "[]").expect("write");
        assert!(load_pages(&empty).is_err());

        let zero = temp.path().join("zero.json");
        fs::write(&zero, r#"[{"page_number": 0, "content": "x"}]"#).expect("write");
        assert!(load_pages(&zero).is_err());
    }
}
