mod ai;
mod config;
mod error;
mod hasher;
mod keys;
mod ledger;
mod models;
mod persist;
mod pipeline;
mod render;
mod source;
mod sync;
mod worker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ai::{GeminiBackend, GenerationClient};
use config::Settings;
use error::PipelineError;
use keys::KeyRotationManager;
use ledger::Ledger;
use models::JobPosting;
use persist::PersistenceManager;
use pipeline::Pipeline;
use render::{PandocRenderer, Renderer};
use source::{HtmlPageSource, JsonLinesSource};
use sync::SyncReconciler;
use worker::GenerationWorker;

#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Turn job postings into tailored resumes and cover letters, once per posting")]
struct Cli {
    /// Directory for per-job folders (overrides OUTPUT_DIR)
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Master ledger CSV (overrides LEDGER_PATH)
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    /// Base resume sent with every prompt (overrides RESUME_PATH)
    #[arg(long, global = true)]
    resume: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate application material for new postings
    Run {
        /// JSON-lines file of postings, or a directory of saved pages with --html
        #[arg(short, long)]
        postings: PathBuf,

        /// Read saved HTML job pages instead of JSON lines
        #[arg(long)]
        html: bool,

        /// Skip PDF rendering
        #[arg(long)]
        no_pdf: bool,
    },

    /// Fold hand edits of a job folder back into its metadata and the ledger
    Sync {
        /// Job folder containing metadata.json
        folder: PathBuf,

        /// Skip PDF regeneration
        #[arg(long)]
        no_pdf: bool,
    },

    /// List ledger rows
    List {
        /// Filter by status (Generated, Applied, ...)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Print the fingerprint of a posting
    Hash {
        company: String,
        title: String,
        description: String,
    },

    /// Recompute every fingerprint in the ledger (keeps a .bak copy)
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jobforge=info")))
        .init();
}

fn renderer(settings: &Settings, no_pdf: bool) -> Option<Box<dyn Renderer + Send>> {
    if no_pdf {
        None
    } else {
        Some(Box::new(PandocRenderer::new(
            &settings.pdf_renderer,
            &settings.user_full_name,
        )))
    }
}

fn run_pipeline(settings: &Settings, postings: &Path, html: bool, no_pdf: bool) -> Result<()> {
    let keys = KeyRotationManager::from_env()?;
    if !settings.resume_path.is_file() {
        return Err(PipelineError::MissingInput(settings.resume_path.clone()).into());
    }

    let source: Box<dyn Iterator<Item = Result<JobPosting>>> = if html {
        Box::new(HtmlPageSource::open(postings)?)
    } else {
        Box::new(JsonLinesSource::open(postings)?)
    };

    let backend = GeminiBackend::new()?;
    let client = GenerationClient::new(
        Box::new(backend),
        keys,
        &settings.model,
        settings.resume_path.clone(),
    )?;
    let worker = GenerationWorker::spawn(client)?;
    let persistence = PersistenceManager::new(
        settings.output_dir.clone(),
        Ledger::new(settings.ledger_path.clone()),
        renderer(settings, no_pdf),
    );

    let pipeline = Pipeline::new(worker, persistence);
    pipeline::watch_for_interrupt(pipeline.interrupt_flag())
        .context("Failed to install Ctrl-C handler")?;

    let outcome = pipeline.run(source);
    pipeline.shutdown();
    let stats = outcome?;

    println!();
    println!(
        "Done: {} seen, {} generated, {} duplicates, {} skipped, {} failed.",
        stats.seen, stats.generated, stats.duplicates, stats.skipped, stats.failed
    );
    if stats.interrupted {
        println!("Run was interrupted before the end of the postings.");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    init_tracing();

    if let Some(dir) = cli.output_dir {
        settings.output_dir = dir;
    }
    if let Some(path) = cli.ledger {
        settings.ledger_path = path;
    }
    if let Some(path) = cli.resume {
        settings.resume_path = path;
    }

    match cli.command {
        Commands::Run { postings, html, no_pdf } => {
            run_pipeline(&settings, &postings, html, no_pdf)?;
        }

        Commands::Sync { folder, no_pdf } => {
            if !folder.is_dir() {
                anyhow::bail!("Folder '{}' does not exist", folder.display());
            }
            let reconciler = SyncReconciler::new(
                Ledger::new(settings.ledger_path.clone()),
                renderer(&settings, no_pdf),
            );
            let report = reconciler.reconcile(&folder)?;
            if report.is_dirty() {
                println!(
                    "Synced {}: resume {}, cover letter {}, {} ledger row(s) updated.",
                    folder.display(),
                    if report.resume_changed { "updated" } else { "unchanged" },
                    if report.cover_letter_changed { "updated" } else { "unchanged" },
                    report.ledger_rows_updated
                );
            }
        }

        Commands::List { status } => {
            let ledger = Ledger::new(settings.ledger_path.clone());
            let rows: Vec<_> = ledger
                .rows()?
                .into_iter()
                .filter(|row| {
                    status
                        .as_deref()
                        .is_none_or(|s| row.status.eq_ignore_ascii_case(s))
                })
                .collect();

            if rows.is_empty() {
                println!("No applications found.");
            } else {
                println!("{:<10} {:<12} {:<24} {:<34} {:>6}", "HASH", "STATUS", "COMPANY", "TITLE", "SCORE");
                println!("{}", "-".repeat(90));
                for row in rows {
                    println!(
                        "{:<10} {:<12} {:<24} {:<34} {:>6}",
                        hasher::short(&row.job_hash),
                        truncate(&row.status, 12),
                        truncate(&row.company, 22),
                        truncate(&row.title, 32),
                        if row.tailored_score.is_empty() { "-" } else { row.tailored_score.as_str() }
                    );
                }
            }
        }

        Commands::Hash { company, title, description } => {
            println!(
                "{}",
                hasher::fingerprint(Some(&company), Some(&title), Some(&description))
            );
        }

        Commands::Migrate => {
            let ledger = Ledger::new(settings.ledger_path.clone());
            if !ledger.path().is_file() {
                anyhow::bail!("Ledger '{}' not found", ledger.path().display());
            }
            let count = ledger.rehash()?;
            println!(
                "Recomputed {} fingerprint(s) in {} (backup: {}.bak).",
                count,
                ledger.path().display(),
                ledger.path().display()
            );
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("Acme", 10), "Acme");
        assert_eq!(truncate("Senior Data Engineer", 10), "Senior ...");
        assert_eq!(truncate("Zürich Büro GmbH", 8), "Züric...");
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from(["jobforge", "run", "--postings", "jobs.jsonl", "--no-pdf"]).unwrap();
        match cli.command {
            Commands::Run { postings, html, no_pdf } => {
                assert_eq!(postings, PathBuf::from("jobs.jsonl"));
                assert!(!html);
                assert!(no_pdf);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_global_overrides_after_subcommand() {
        let cli = Cli::try_parse_from(["jobforge", "list", "--ledger", "other.csv"]).unwrap();
        assert_eq!(cli.ledger, Some(PathBuf::from("other.csv")));
    }
}
