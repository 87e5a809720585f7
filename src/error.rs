use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by the pipeline.
///
/// Per-posting failures (`QuotaExhausted`, `MalformedResponse`, `Generation`) are logged by the
/// orchestrator and the run continues. `Configuration` and `MissingInput` abort the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Required input not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("All API keys in the pool are exhausted: {0:#}")]
    QuotaExhausted(anyhow::Error),

    #[error("API key pool has no key at position {0}")]
    PoolExhausted(usize),

    #[error("Malformed generation response: {0}")]
    MalformedResponse(String),

    #[error("Generation failed: {0:#}")]
    Generation(anyhow::Error),

    #[error("PDF rendering failed: {0:#}")]
    Render(anyhow::Error),

    #[error("metadata.json not found in {}", .0.display())]
    MissingMetadata(PathBuf),

    #[error("metadata.json in {} is not a job record", .0.display())]
    InvalidMetadata(PathBuf),

    #[error("Generation worker is no longer running")]
    WorkerUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether the error means the whole run cannot continue.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_)
                | PipelineError::MissingInput(_)
                | PipelineError::WorkerUnavailable
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
