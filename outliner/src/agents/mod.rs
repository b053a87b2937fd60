//! Oracle-backed pipeline stages.

use anyhow::{Context, anyhow};
use serde_json::{Value, json};

use crate::io::oracle::Tool;
use crate::pages::PageSet;

pub mod repairer;
pub mod skeleton;
pub mod splitter;
pub mod toc;
pub mod verifier;

/// Bounded page-read capability exposed to tool-looped stages, so the oracle
/// can request pages outside its direct context.
pub(crate) fn read_page_tool(pages: &PageSet, max_chars: usize) -> Tool<'_> {
    Tool {
        name: "read_page",
        description: "Read the extracted text of one page by number",
        parameters: json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["page"],
            "properties": { "page": { "type": "integer", "minimum": 1 } }
        }),
        handler: Box::new(move |args| {
            let number = args
                .get("page")
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow!("read_page requires an integer 'page' argument"))?;
            let number = u32::try_from(number).context("page number out of range")?;
            Ok(pages
                .excerpt(number, max_chars)
                .unwrap_or_else(|| format!("page {number} has no extracted content")))
        }),
    }
}
