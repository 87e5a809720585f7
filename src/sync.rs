use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::hasher;
use crate::ledger::Ledger;
use crate::persist::{self, COVER_LETTER_FILE, METADATA_FILE, RESUME_FILE};
use crate::render::{DocumentKind, Renderer};

const RESUME_KEY: &str = "resume_markdown";
const COVER_LETTER_KEY: &str = "cover_letter_markdown";

/// What a reconciliation changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    pub resume_changed: bool,
    pub cover_letter_changed: bool,
    pub ledger_rows_updated: usize,
    pub pdfs: Vec<PathBuf>,
}

impl SyncReport {
    pub fn is_dirty(&self) -> bool {
        self.resume_changed || self.cover_letter_changed
    }
}

/// Folds hand edits of a job folder back into its metadata record and ledger row.
pub struct SyncReconciler {
    ledger: Ledger,
    renderer: Option<Box<dyn Renderer + Send>>,
}

impl SyncReconciler {
    pub fn new(ledger: Ledger, renderer: Option<Box<dyn Renderer + Send>>) -> Self {
        Self { ledger, renderer }
    }

    pub fn reconcile(&self, folder: &Path) -> Result<SyncReport> {
        let metadata_path = folder.join(METADATA_FILE);
        if !metadata_path.is_file() {
            return Err(PipelineError::MissingMetadata(folder.to_path_buf()));
        }

        let mut metadata: Value = serde_json::from_str(&fs::read_to_string(&metadata_path)?)?;
        let fingerprint = text_at(&metadata, "/application_meta/job_hash");
        let company = text_at(&metadata, "/job_info/company").unwrap_or_else(|| "unknown".to_string());
        let title = text_at(&metadata, "/job_info/title").unwrap_or_else(|| "unknown".to_string());

        let content = content_section(&mut metadata)
            .ok_or_else(|| PipelineError::InvalidMetadata(folder.to_path_buf()))?;

        let mut report = SyncReport::default();
        let resume = read_if_present(&folder.join(RESUME_FILE))?;
        let cover_letter = read_if_present(&folder.join(COVER_LETTER_FILE))?;

        if let Some(text) = &resume {
            report.resume_changed = replace_if_changed(content, RESUME_KEY, text);
        }
        if let Some(text) = &cover_letter {
            report.cover_letter_changed = replace_if_changed(content, COVER_LETTER_KEY, text);
        }

        if !report.is_dirty() {
            println!("No changes found in {}.", folder.display());
            return Ok(report);
        }

        let current_resume = content.get(RESUME_KEY).and_then(Value::as_str).unwrap_or("").to_string();
        let current_cover = content.get(COVER_LETTER_KEY).and_then(Value::as_str).unwrap_or("").to_string();

        persist::write_json(&metadata_path, &metadata)?;

        match fingerprint.as_deref() {
            Some(hash) => {
                report.ledger_rows_updated =
                    self.ledger.update_content(hash, &current_resume, &current_cover)?;
                if report.ledger_rows_updated == 0 {
                    warn!(job_hash = %hasher::short(hash), "No ledger row for this job; ledger left as is");
                } else {
                    println!("   Metadata and ledger updated.");
                }
            }
            None => {
                warn!(folder = %folder.display(), "Record has no job_hash; run `migrate` on the ledger");
            }
        }

        if let Some(renderer) = &self.renderer {
            let changed = [
                (report.resume_changed, DocumentKind::Resume, current_resume.as_str()),
                (report.cover_letter_changed, DocumentKind::CoverLetter, current_cover.as_str()),
            ];
            for (kind, markdown) in changed.iter().filter(|c| c.0).map(|c| (c.1, c.2)) {
                if let Some(path) = persist::render_document(&**renderer, kind, &company, &title, markdown, folder) {
                    println!("   Regenerated {}", path.display());
                    report.pdfs.push(path);
                }
            }
        }

        info!(
            folder = %folder.display(),
            resume = report.resume_changed,
            cover_letter = report.cover_letter_changed,
            "Reconciled"
        );
        Ok(report)
    }
}

fn text_at(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

/// The `generated_content` object, created when absent or null.
fn content_section(metadata: &mut Value) -> Option<&mut Map<String, Value>> {
    let section = metadata
        .as_object_mut()?
        .entry("generated_content")
        .or_insert(Value::Null);
    if section.is_null() {
        *section = Value::Object(Map::new());
    }
    section.as_object_mut()
}

fn replace_if_changed(content: &mut Map<String, Value>, key: &str, text: &str) -> bool {
    if content.get(key).and_then(Value::as_str) == Some(text) {
        return false;
    }
    content.insert(key.to_string(), Value::String(text.to_string()));
    true
}

fn read_if_present(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::tests::VALID_RESPONSE;
    use crate::ledger::COLUMNS;
    use crate::models::{GenerationResult, JobPosting};
    use crate::persist::PersistenceManager;
    use crate::render::tests::RecordingRenderer;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        folder: PathBuf,
        ledger: Ledger,
        fingerprint: String,
    }

    fn saved_job() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("log.csv"));
        let manager = PersistenceManager::new(dir.path().join("out"), ledger.clone(), None);
        let posting = JobPosting::new("Acme", "Data Engineer", "5 years SQL...", "https://x/1");
        let result: GenerationResult = serde_json::from_str(VALID_RESPONSE).unwrap();
        let fingerprint = posting.fingerprint();
        let folder = manager.save(&posting, &result, &fingerprint).unwrap();
        Fixture { _dir: dir, folder, ledger, fingerprint }
    }

    fn set_user_columns(ledger: &Ledger) {
        let text = fs::read_to_string(ledger.path()).unwrap();
        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let mut writer = csv::Writer::from_path(ledger.path()).unwrap();
        writer.write_record(COLUMNS).unwrap();
        for record in reader.records() {
            let mut fields: Vec<String> = record.unwrap().iter().map(str::to_string).collect();
            fields[16] = "Applied".to_string();
            fields[21] = "Recruiter is Sam".to_string();
            writer.write_record(&fields).unwrap();
        }
        writer.flush().unwrap();
    }

    fn read_metadata(folder: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(folder.join(METADATA_FILE)).unwrap()).unwrap()
    }

    #[test]
    fn test_resume_edit_updates_only_resume_fields() {
        let job = saved_job();
        set_user_columns(&job.ledger);
        let renderer = RecordingRenderer::default();
        let titles = Arc::clone(&renderer.titles);
        let reconciler = SyncReconciler::new(job.ledger.clone(), Some(Box::new(renderer)));

        fs::write(job.folder.join(RESUME_FILE), "# Resume\n\nSQL expert, now with Airflow").unwrap();
        let report = reconciler.reconcile(&job.folder).unwrap();

        assert!(report.resume_changed);
        assert!(!report.cover_letter_changed);
        assert_eq!(report.ledger_rows_updated, 1);

        let metadata = read_metadata(&job.folder);
        assert_eq!(
            metadata["generated_content"]["resume_markdown"],
            "# Resume\n\nSQL expert, now with Airflow"
        );
        assert_eq!(metadata["generated_content"]["cover_letter_markdown"], "Dear team,");
        assert_eq!(metadata["application_meta"]["job_hash"], job.fingerprint.as_str());

        let rows = job.ledger.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].resume_content_md, "# Resume\n\nSQL expert, now with Airflow");
        assert_eq!(rows[0].cover_letter_md, "Dear team,");
        assert_eq!(rows[0].status, "Applied");
        assert_eq!(rows[0].notes, "Recruiter is Sam");

        assert_eq!(*titles.lock().unwrap(), vec!["Resume_Acme_Data_Engineer"]);
    }

    #[test]
    fn test_unchanged_folder_is_a_no_op() {
        let job = saved_job();
        let before = fs::read_to_string(job.folder.join(METADATA_FILE)).unwrap();
        let renderer = RecordingRenderer::default();
        let titles = Arc::clone(&renderer.titles);
        let reconciler = SyncReconciler::new(job.ledger.clone(), Some(Box::new(renderer)));

        let report = reconciler.reconcile(&job.folder).unwrap();

        assert_eq!(report, SyncReport::default());
        assert_eq!(fs::read_to_string(job.folder.join(METADATA_FILE)).unwrap(), before);
        assert!(titles.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_metadata_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = SyncReconciler::new(Ledger::new(dir.path().join("log.csv")), None);
        assert!(matches!(
            reconciler.reconcile(dir.path()),
            Err(PipelineError::MissingMetadata(_))
        ));
    }

    #[test]
    fn test_missing_ledger_row_is_not_fatal() {
        let job = saved_job();
        fs::remove_file(job.ledger.path()).unwrap();
        let reconciler = SyncReconciler::new(job.ledger.clone(), None);

        fs::write(job.folder.join(COVER_LETTER_FILE), "Dear hiring manager,").unwrap();
        let report = reconciler.reconcile(&job.folder).unwrap();

        assert!(report.cover_letter_changed);
        assert_eq!(report.ledger_rows_updated, 0);
        assert_eq!(
            read_metadata(&job.folder)["generated_content"]["cover_letter_markdown"],
            "Dear hiring manager,"
        );
    }

    #[test]
    fn test_unknown_metadata_fields_survive() {
        let job = saved_job();
        let mut metadata = read_metadata(&job.folder);
        metadata["job_info"]["recruiter"] = Value::String("Sam".to_string());
        persist::write_json(&job.folder.join(METADATA_FILE), &metadata).unwrap();

        fs::write(job.folder.join(RESUME_FILE), "edited").unwrap();
        SyncReconciler::new(job.ledger.clone(), None).reconcile(&job.folder).unwrap();

        let metadata = read_metadata(&job.folder);
        assert_eq!(metadata["job_info"]["recruiter"], "Sam");
        assert_eq!(metadata["generated_content"]["resume_markdown"], "edited");
    }

    #[test]
    fn test_non_object_metadata_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(METADATA_FILE), "[1, 2]").unwrap();
        let reconciler = SyncReconciler::new(Ledger::new(dir.path().join("log.csv")), None);
        assert!(matches!(
            reconciler.reconcile(dir.path()),
            Err(PipelineError::InvalidMetadata(_))
        ));
    }
}
