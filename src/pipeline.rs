use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::error::Result;
use crate::hasher;
use crate::models::JobPosting;
use crate::persist::PersistenceManager;
use crate::worker::GenerationWorker;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub seen: usize,
    pub generated: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub interrupted: bool,
}

enum Outcome {
    Generated(PathBuf),
    Duplicate(String),
    Skipped,
}

/// Fingerprint, dedup gate, generation, persistence; one posting at a time.
pub struct Pipeline {
    worker: GenerationWorker,
    persistence: PersistenceManager,
    interrupted: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(worker: GenerationWorker, persistence: PersistenceManager) -> Self {
        Self {
            worker,
            persistence,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops the run before the next posting.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Drives every posting through the pipeline.
    ///
    /// Per-posting failures are logged and counted. Only setup-level failures (missing resume,
    /// dead worker) end the run early with an error.
    pub fn run<I>(&self, postings: I) -> Result<RunStats>
    where
        I: IntoIterator<Item = anyhow::Result<JobPosting>>,
    {
        let mut stats = RunStats::default();

        for item in postings {
            if self.interrupted.load(Ordering::SeqCst) {
                println!("Interrupted. No further postings will be processed.");
                stats.interrupted = true;
                break;
            }
            stats.seen += 1;

            let posting = match item {
                Ok(posting) => posting,
                Err(err) => {
                    println!("   Skipping unreadable posting: {:#}", err);
                    stats.failed += 1;
                    continue;
                }
            };

            match self.process(&posting) {
                Ok(Outcome::Generated(folder)) => {
                    println!("   Saved to {}", folder.display());
                    stats.generated += 1;
                }
                Ok(Outcome::Duplicate(fingerprint)) => {
                    println!(
                        "   Skipping: {} at {} already processed (hash {}).",
                        posting.title_text(),
                        posting.company_name(),
                        hasher::short(&fingerprint)
                    );
                    stats.duplicates += 1;
                }
                Ok(Outcome::Skipped) => {
                    println!(
                        "   Skipping: {} at {} has no description.",
                        posting.title_text(),
                        posting.company_name()
                    );
                    stats.skipped += 1;
                }
                Err(err) if err.is_fatal_for_run() => return Err(err),
                Err(err) => {
                    let fingerprint = posting.fingerprint();
                    println!(
                        "   Failed: {} at {} (hash {}): {}",
                        posting.title_text(),
                        posting.company_name(),
                        hasher::short(&fingerprint),
                        err
                    );
                    stats.failed += 1;
                }
            }
        }

        info!(?stats, "Run finished");
        Ok(stats)
    }

    fn process(&self, posting: &JobPosting) -> Result<Outcome> {
        if !posting.has_description() {
            return Ok(Outcome::Skipped);
        }

        let fingerprint = posting.fingerprint();
        if self.persistence.ledger().contains(&fingerprint)? {
            return Ok(Outcome::Duplicate(fingerprint));
        }

        println!(
            "Generating: {} at {} (hash {})",
            posting.title_text(),
            posting.company_name(),
            hasher::short(&fingerprint)
        );
        let result = self.worker.generate(
            posting.description_text(),
            posting.title_text(),
            posting.company_name(),
        )?;
        let folder = self.persistence.save(posting, &result, &fingerprint)?;
        Ok(Outcome::Generated(folder))
    }

    /// Closes the generation worker, waiting for an in-flight call to finish.
    pub fn shutdown(self) {
        self.worker.shutdown();
    }
}

/// Sets `flag` on the first Ctrl-C; a second Ctrl-C exits immediately with status 130.
pub fn watch_for_interrupt(flag: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async {
                loop {
                    if tokio::signal::ctrl_c().await.is_err() {
                        warn!("Interrupt handler unavailable");
                        return;
                    }
                    if flag.swap(true, Ordering::SeqCst) {
                        eprintln!("Forced exit.");
                        std::process::exit(130);
                    }
                    eprintln!("Interrupt received. Finishing the current posting; press Ctrl-C again to force exit.");
                }
            })
        })
}
