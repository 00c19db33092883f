//! Fire-and-forget job queue
//!
//! A dispatcher task drains the channel and runs each job on its own task,
//! at most `concurrency` at a time.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{run_job, Job, TaskContext};
use crate::error::{BeamlineError, Result};

#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl TaskQueue {
    /// Start the dispatcher.
    ///
    /// The returned handle resolves once every queue handle is dropped and
    /// all running jobs have finished.
    pub fn start(ctx: TaskContext, concurrency: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(dispatch(ctx, receiver, concurrency.max(1)));
        (Self { sender }, handle)
    }

    pub fn enqueue(&self, job: Job) -> Result<()> {
        debug!("Enqueueing {}", job);
        self.sender
            .send(job)
            .map_err(|e| BeamlineError::Config(format!("Task queue is closed, dropped {}", e.0)))
    }
}

async fn dispatch(ctx: TaskContext, mut receiver: mpsc::UnboundedReceiver<Job>, concurrency: usize) {
    let slots = Arc::new(Semaphore::new(concurrency));
    while let Some(job) = receiver.recv().await {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let name = job.to_string();
            debug!("Running {}", name);
            if let Err(e) = run_job(&ctx, job).await {
                error!(job = %name, category = %e.category(), "Job failed: {}", e);
            }
        });
    }

    // wait for jobs still running
    let _ = slots.acquire_many(concurrency as u32).await;
}
