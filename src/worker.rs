use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::ai::GenerationClient;
use crate::error::{PipelineError, Result};
use crate::models::GenerationResult;

struct GenerationTask {
    description: String,
    title: String,
    company: String,
    reply: Sender<Result<GenerationResult>>,
}

/// A single dedicated thread that owns the [`GenerationClient`].
///
/// Generation calls never run on the caller's thread, so they cannot collide with whatever
/// runtime or event loop the posting source drives. At most one call is in flight.
pub struct GenerationWorker {
    sender: Option<Sender<GenerationTask>>,
    handle: Option<JoinHandle<()>>,
}

impl GenerationWorker {
    pub fn spawn(client: GenerationClient) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<GenerationTask>();

        let handle = thread::Builder::new()
            .name("generation".to_string())
            .spawn(move || run(client, receiver))?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Runs one generation on the worker and blocks until it finishes.
    pub fn generate(
        &self,
        description: &str,
        title: &str,
        company: &str,
    ) -> Result<GenerationResult> {
        let sender = self.sender.as_ref().ok_or(PipelineError::WorkerUnavailable)?;
        let (reply, response) = mpsc::channel();

        sender
            .send(GenerationTask {
                description: description.to_string(),
                title: title.to_string(),
                company: company.to_string(),
                reply,
            })
            .map_err(|_| PipelineError::WorkerUnavailable)?;

        response.recv().map_err(|_| PipelineError::WorkerUnavailable)?
    }

    /// Stops accepting work and waits for the in-flight call to drain.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Generation worker panicked");
            } else {
                info!("Generation worker stopped");
            }
        }
    }
}

impl Drop for GenerationWorker {
    fn drop(&mut self) {
        self.close();
    }
}

fn run(mut client: GenerationClient, receiver: Receiver<GenerationTask>) {
    for task in receiver {
        debug!(title = %task.title, company = %task.company, "Generation task received");
        let result = client.process(&task.description, &task.title, &task.company);
        // The caller may have gone away; nothing to do with the result then.
        let _ = task.reply.send(result);
    }
}
