use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::hasher;
use crate::ledger::{Ledger, LedgerRow};
use crate::models::{GenerationResult, JobMetadata, JobPosting};
use crate::render::{self, DocumentKind, Renderer};

pub const REPORT_FILE: &str = "0_analysis_report.md";
pub const DESCRIPTION_FILE: &str = "1_job_description.md";
pub const RESUME_FILE: &str = "2_tailored_resume.md";
pub const COVER_LETTER_FILE: &str = "3_cover_letter.md";
pub const METADATA_FILE: &str = "metadata.json";

/// Writes one job's folder, its metadata record and its ledger row.
pub struct PersistenceManager {
    output_dir: PathBuf,
    ledger: Ledger,
    renderer: Option<Box<dyn Renderer + Send>>,
}

impl PersistenceManager {
    /// `renderer: None` skips the PDF step entirely.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        ledger: Ledger,
        renderer: Option<Box<dyn Renderer + Send>>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            ledger,
            renderer,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn save(
        &self,
        posting: &JobPosting,
        result: &GenerationResult,
        fingerprint: &str,
    ) -> Result<PathBuf> {
        self.save_at(posting, result, fingerprint, Local::now())
    }

    pub fn save_at(
        &self,
        posting: &JobPosting,
        result: &GenerationResult,
        fingerprint: &str,
        now: DateTime<Local>,
    ) -> Result<PathBuf> {
        let folder = self
            .output_dir
            .join(folder_name(posting, fingerprint, &now.format("%Y%m%d").to_string()));
        fs::create_dir_all(&folder)?;

        let resume = result.resume_markdown();
        let cover_letter = result.cover_letter_markdown();

        fs::write(folder.join(DESCRIPTION_FILE), posting.description_text())?;
        fs::write(folder.join(RESUME_FILE), resume)?;
        fs::write(folder.join(COVER_LETTER_FILE), cover_letter)?;
        fs::write(folder.join(REPORT_FILE), analysis_report(posting, result))?;

        if let Some(renderer) = &self.renderer {
            println!("   Generating PDFs for {}...", posting.title_text());
            let company = posting.company_name();
            let title = posting.title_text();
            render_document(&**renderer, DocumentKind::Resume, company, title, resume, &folder);
            render_document(&**renderer, DocumentKind::CoverLetter, company, title, cover_letter, &folder);
        }

        let timestamp = now.naive_local().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        let metadata = JobMetadata::build(posting, result, fingerprint, timestamp);
        write_json(&folder.join(METADATA_FILE), &metadata)?;

        self.ledger.append(&LedgerRow::from_metadata(&metadata))?;
        println!(
            "   Job registered in ledger with hash: {}",
            hasher::short(fingerprint)
        );

        info!(folder = %folder.display(), job_hash = %hasher::short(fingerprint), "Job saved");
        Ok(folder)
    }
}

/// `YYYYMMDD-<company>-<title>-<hash8>`.
pub fn folder_name(posting: &JobPosting, fingerprint: &str, date: &str) -> String {
    format!(
        "{}-{}-{}-{}",
        date,
        folder_component(posting.company_name()),
        folder_component(posting.title_text()),
        hasher::short(fingerprint)
    )
}

fn folder_component(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn score_text(score: Option<f64>) -> String {
    score.unwrap_or(0.0).to_string()
}

/// The human-readable summary written as `0_analysis_report.md`.
pub fn analysis_report(posting: &JobPosting, result: &GenerationResult) -> String {
    let mut report = format!("# Application Analysis: {}\n\n", posting.title_text());
    report.push_str(&format!(
        "**Match Score:** {} → **Optimized:** {}\n\n",
        score_text(result.scores.original),
        score_text(result.scores.tailored)
    ));
    report.push_str(&format!("## How to Apply\n{}\n\n", result.apply_instructions()));
    report.push_str(&format!("### Fit Analysis\n{}\n\n", result.fit_report()));
    report.push_str("### Gaps & Missing Skills\n");
    if result.analysis.gaps.is_empty() {
        report.push_str("- None identified\n\n");
    } else {
        for gap in &result.analysis.gaps {
            report.push_str(&format!("- {}\n", gap));
        }
        report.push('\n');
    }
    report.push_str(&format!("### Mitigation Strategy\n{}\n", result.mitigation_strategy()));
    report
}

/// Best-effort PDF step. Failures are logged and swallowed.
pub fn render_document(
    renderer: &(dyn Renderer + Send),
    kind: DocumentKind,
    company: &str,
    title: &str,
    markdown: &str,
    folder: &Path,
) -> Option<PathBuf> {
    if markdown.trim().is_empty() {
        debug!(kind = kind.label(), "Nothing to render");
        return None;
    }

    let doc_title = render::document_title(kind, company, title);
    match renderer.render(markdown, &doc_title, folder) {
        Ok(path) => {
            debug!(path = %path.display(), "PDF written");
            Some(path)
        }
        Err(err) => {
            let err = PipelineError::Render(err);
            println!("   PDF error for {}: {}", doc_title, err);
            None
        }
    }
}

/// Pretty JSON with four-space indentation.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    fs::write(path, buf)?;
    Ok(())
}
