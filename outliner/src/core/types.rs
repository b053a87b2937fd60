//! Shared deterministic types for pipeline core logic.
//!
//! These types define stable contracts between stages. They must not depend on
//! external state or I/O and must remain deterministic across runs.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A table-of-contents hint. Produced once during TOC detection, consumed only
/// while the skeleton is built; never authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    pub page_number: u32,
    pub level: u32,
}

/// Outcome of TOC detection. `entries` empty means "proceed without hints".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocDetection {
    pub has_toc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toc_end_page: Option<u32>,
    #[serde(default)]
    pub entries: Vec<TocEntry>,
}

/// Per-node boundary verification outcome. Produced fresh each pass and never
/// persisted on the tree; `node_id` is a weak reference by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub node_id: String,
    pub title: String,
    pub page_start: u32,
    pub verified: bool,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appears_at_start: Option<bool>,
}

/// Final verification summary. `accuracy` is exactly `verified / total`, and 0
/// when no nodes were processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifySummary {
    pub accuracy: f64,
    pub verified: u32,
    pub failed: u32,
    #[serde(default)]
    pub incorrect_nodes: Vec<String>,
}

impl VerifySummary {
    pub fn from_counts(verified: u32, failed: u32, incorrect_nodes: Vec<String>) -> Self {
        let total = verified + failed;
        let accuracy = if total == 0 {
            0.0
        } else {
            f64::from(verified) / f64::from(total)
        };
        Self {
            accuracy,
            verified,
            failed,
            incorrect_nodes,
        }
    }
}

/// A single accepted boundary relocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixEvent {
    pub node_id: String,
    pub old_page: u32,
    pub new_page: u32,
}

/// Final repair summary. Residual incorrect nodes are reported, never thrown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSummary {
    pub fixed: u32,
    #[serde(default)]
    pub still_incorrect: Vec<String>,
    pub attempts: u32,
}

/// Caller-supplied cancellation signal, checked between stages and between
/// tool-loop rounds.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error with a downcastable [`Cancelled`] marker when the token is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(anyhow::Error::new(Cancelled));
        }
        Ok(())
    }
}

/// Typed marker for cancellation, recoverable via `downcast_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline cancelled")
    }
}

impl std::error::Error for Cancelled {}
