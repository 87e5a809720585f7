use std::env;
use std::path::PathBuf;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_RESUME_PATH: &str = "assets/resume.txt";
pub const DEFAULT_OUTPUT_DIR: &str = "zzz_output";
pub const DEFAULT_LEDGER_PATH: &str = "applications_master_log.csv";
pub const DEFAULT_USER_NAME: &str = "Candidate";
pub const DEFAULT_PDF_RENDERER: &str = "pandoc";

/// Runtime settings read from the environment (and `.env`, if present).
///
/// API keys are not held here; [`crate::keys::KeyRotationManager::from_env`] reads them only for
/// the commands that call the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub model: String,
    pub resume_path: PathBuf,
    pub output_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub user_full_name: String,
    pub pdf_renderer: String,
}

impl Settings {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            model: get("GEMINI_MODEL_NAME", DEFAULT_MODEL),
            resume_path: PathBuf::from(get("RESUME_PATH", DEFAULT_RESUME_PATH)),
            output_dir: PathBuf::from(get("OUTPUT_DIR", DEFAULT_OUTPUT_DIR)),
            ledger_path: PathBuf::from(get("LEDGER_PATH", DEFAULT_LEDGER_PATH)),
            user_full_name: get("USER_FULL_NAME", DEFAULT_USER_NAME),
            pdf_renderer: get("PDF_RENDERER", DEFAULT_PDF_RENDERER),
        }
    }
}
