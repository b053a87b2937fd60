//! Document outline CLI.
//!
//! Turns a pages JSON file into a verified hierarchical outline, or runs the
//! offline validation / verification stages over a stored outline.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use outliner::agents::verifier::{BoundaryVerifier, VerifierConfig};
use outliner::core::bounds::clamp_to_page_count;
use outliner::core::types::CancelToken;
use outliner::exit_codes;
use outliner::io::config::{OutlinerConfig, load_config};
use outliner::io::oracle::ProcessOracle;
use outliner::io::outline_store::{load_outline, write_outline};
use outliner::io::pages_file::load_pages;
use outliner::logging;
use outliner::pipeline::run_pipeline;

#[derive(Parser)]
#[command(
    name = "outliner",
    version,
    about = "Self-correcting document outline discovery"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline: TOC scan, skeleton, split, verify, repair.
    Run {
        /// JSON file with an array of {page_number, content} objects.
        pages: PathBuf,
        /// Pipeline configuration (TOML). Defaults apply when missing.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Where to write the outline JSON.
        #[arg(long, default_value = "outline.json")]
        out: PathBuf,
    },
    /// Clamp a stored outline against the document length and report changes.
    Validate {
        /// Outline JSON produced by `run`.
        tree: PathBuf,
        /// Pages the outline refers to.
        pages: PathBuf,
    },
    /// Re-run batched boundary verification over a stored outline.
    Verify {
        /// Outline JSON produced by `run`.
        tree: PathBuf,
        /// Pages the outline refers to.
        pages: PathBuf,
        /// Verify only a uniform random sample of this size.
        #[arg(long)]
        sample: Option<usize>,
        /// Also check whether each heading opens its page.
        #[arg(long)]
        page_start: bool,
        /// Pipeline configuration (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { pages, config, out } => cmd_run(&pages, config.as_deref(), &out),
        Command::Validate { tree, pages } => cmd_validate(&tree, &pages),
        Command::Verify {
            tree,
            pages,
            sample,
            page_start,
            config,
        } => cmd_verify(&tree, &pages, sample, page_start, config.as_deref()),
    }
}

fn load_config_or_default(path: Option<&Path>) -> Result<OutlinerConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(OutlinerConfig::default()),
    }
}

fn oracle_for(config: &OutlinerConfig, state_dir: &Path) -> ProcessOracle {
    ProcessOracle::new(state_dir.to_path_buf(), config.oracle.output_limit_bytes)
}

fn cmd_run(pages_path: &Path, config_path: Option<&Path>, out: &Path) -> Result<i32> {
    let config = load_config_or_default(config_path)?;
    let pages = load_pages(pages_path)?;
    let state_dir = out
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(".outliner");
    let oracle = oracle_for(&config, &state_dir);
    let cancel = CancelToken::new();

    let outcome = run_pipeline(&oracle, &pages, None, &config, &cancel, |event| {
        if let Ok(line) = serde_json::to_string(&event) {
            eprintln!("{line}");
        }
    })?;

    write_outline(out, &outcome.tree)?;
    let report = json!({
        "outline": out.display().to_string(),
        "nodes": outcome.tree.count(),
        "bounds": outcome.bounds,
        "preface_added": outcome.preface_added,
        "split": outcome.split,
        "verification": outcome.verification,
        "repair": outcome.repair,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    let residual = outcome
        .repair
        .as_ref()
        .map(|summary| !summary.still_incorrect.is_empty())
        .or_else(|| {
            outcome
                .verification
                .as_ref()
                .map(|summary| !summary.incorrect_nodes.is_empty())
        })
        .unwrap_or(true);
    Ok(if residual {
        exit_codes::RESIDUAL
    } else {
        exit_codes::OK
    })
}

fn cmd_validate(tree_path: &Path, pages_path: &Path) -> Result<i32> {
    let mut tree = load_outline(tree_path)?;
    let pages = load_pages(pages_path)?;
    let report = clamp_to_page_count(&mut tree, pages.total_pages());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.truncated_count == 0 {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn cmd_verify(
    tree_path: &Path,
    pages_path: &Path,
    sample: Option<usize>,
    page_start: bool,
    config_path: Option<&Path>,
) -> Result<i32> {
    let config = load_config_or_default(config_path)?;
    let tree = load_outline(tree_path)?;
    let pages = load_pages(pages_path)?;
    let state_dir = tree_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(".outliner");
    let oracle = oracle_for(&config, &state_dir);

    let verifier = BoundaryVerifier::new(VerifierConfig {
        sample_size: sample.or(config.verify.sample_size),
        check_page_start: page_start || config.verify.check_page_start,
        seed: config.verify.seed,
        page_excerpt_chars: config.page_excerpt_chars,
        prompt_budget_bytes: config.prompt_budget_bytes,
        oracle_timeout: std::time::Duration::from_secs(config.oracle.timeout_secs),
    });
    let summary = verifier
        .verify(&oracle, &tree, &pages, &CancelToken::new(), |result| {
            if let Ok(line) = serde_json::to_string(result) {
                println!("{line}");
            }
        })
        .context("verify outline")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(if summary.incorrect_nodes.is_empty() {
        exit_codes::OK
    } else {
        exit_codes::RESIDUAL
    })
}
