//! Pipeline configuration stored as TOML.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Outliner configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutlinerConfig {
    /// Pages handed to the TOC scan as direct context.
    pub toc_context_pages: u32,

    /// Maximum tool rounds per oracle interaction.
    pub max_tool_rounds: u32,

    /// Maximum sampled pages fed to skeleton extraction.
    pub skeleton_sample_cap: usize,

    /// Maximum TOC entry pages folded into the skeleton sample.
    pub toc_entry_sample_cap: usize,

    /// Per-page character budget for prompt excerpts.
    pub page_excerpt_chars: usize,

    /// Prompt byte budget before truncation.
    pub prompt_budget_bytes: usize,

    pub split: SplitConfig,
    pub verify: VerifyConfig,
    pub repair: RepairConfig,
    pub oracle: OracleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SplitConfig {
    /// Page span above which a node is a split candidate.
    pub max_pages_per_node: u32,

    /// Estimated token count at which a wide node must actually be split.
    pub max_tokens_per_node: u64,

    /// Drop the first returned subsection when its title repeats the node's
    /// own heading. Heuristic; disable if legitimate subsections get dropped.
    pub skip_repeated_heading: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Verify only a uniform random sample of this size (all nodes if unset).
    pub sample_size: Option<usize>,

    /// Issue the second batched call asking whether each heading opens its page.
    pub check_page_start: bool,

    /// RNG seed for sampling, for reproducible runs.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepairConfig {
    /// Retry rounds before giving up on remaining incorrect nodes.
    pub max_retries: u32,

    /// Minimum oracle confidence to accept a relocation.
    pub confidence_threshold: f64,

    /// Re-verify each accepted fix with a single-node check.
    pub verify_after_fix: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Per-round wall-clock budget in seconds.
    pub timeout_secs: u64,

    /// Truncate oracle subprocess stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for OutlinerConfig {
    fn default() -> Self {
        Self {
            toc_context_pages: 10,
            max_tool_rounds: 500,
            skeleton_sample_cap: 12,
            toc_entry_sample_cap: 15,
            page_excerpt_chars: 2000,
            prompt_budget_bytes: 200_000,
            split: SplitConfig::default(),
            verify: VerifyConfig::default(),
            repair: RepairConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_pages_per_node: 15,
            max_tokens_per_node: 20_000,
            skip_repeated_heading: true,
        }
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            confidence_threshold: 0.5,
            verify_after_fix: false,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

impl OutlinerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.toc_context_pages == 0 {
            return Err(anyhow!("toc_context_pages must be > 0"));
        }
        if self.max_tool_rounds == 0 {
            return Err(anyhow!("max_tool_rounds must be > 0"));
        }
        if self.skeleton_sample_cap == 0 {
            return Err(anyhow!("skeleton_sample_cap must be > 0"));
        }
        if self.page_excerpt_chars == 0 {
            return Err(anyhow!("page_excerpt_chars must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.split.max_pages_per_node == 0 {
            return Err(anyhow!("split.max_pages_per_node must be > 0"));
        }
        if self.split.max_tokens_per_node == 0 {
            return Err(anyhow!("split.max_tokens_per_node must be > 0"));
        }
        if self.repair.max_retries == 0 {
            return Err(anyhow!("repair.max_retries must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.repair.confidence_threshold) {
            return Err(anyhow!("repair.confidence_threshold must be in [0, 1]"));
        }
        if self.verify.sample_size == Some(0) {
            return Err(anyhow!("verify.sample_size must be > 0 when set"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.output_limit_bytes == 0 {
            return Err(anyhow!("oracle.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OutlinerConfig::default()`.
pub fn load_config(path: &Path) -> Result<OutlinerConfig> {
    if !path.exists() {
        let cfg = OutlinerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OutlinerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OutlinerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OutlinerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = OutlinerConfig {
            verify: VerifyConfig {
                sample_size: Some(40),
                check_page_start: true,
                seed: Some(7),
            },
            ..OutlinerConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let cfg = OutlinerConfig {
            repair: RepairConfig {
                confidence_threshold: 1.5,
                ..RepairConfig::default()
            },
            ..OutlinerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_budgets_are_rejected() {
        let cfg = OutlinerConfig {
            split: SplitConfig {
                max_pages_per_node: 0,
                ..SplitConfig::default()
            },
            ..OutlinerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
