//! Bounded extraction worker pool.
//!
//! Downloaded documents are handed to a fixed number of workers through one
//! bounded channel. [`QueueHandle::submit`] waits when the channel is full,
//! so a burst of downloads slows the producer down instead of spawning an
//! unbounded number of tasks. A failing job is logged and the worker moves
//! on to the next one.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// One document waiting for skill extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionJob {
    pub contact_id: String,
    pub document_id: i64,
    pub file_path: PathBuf,
    pub document_name: String,
}

#[async_trait]
pub trait ExtractionHandler: Send + Sync + 'static {
    /// Process one job; returns the number of skills stored.
    async fn handle(&self, job: &ExtractionJob) -> anyhow::Result<usize>;
}

#[derive(Debug, Error)]
#[error("extraction queue is shut down")]
pub struct QueueClosed;

/// Cheap, cloneable producer side of the queue.
#[derive(Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<ExtractionJob>,
}

impl QueueHandle {
    /// Enqueue a job, waiting for capacity when the queue is full.
    pub async fn submit(&self, job: ExtractionJob) -> Result<(), QueueClosed> {
        debug!(document_id = job.document_id, "queueing extraction job");
        self.sender.send(job).await.map_err(|_| QueueClosed)
    }
}

pub struct ExtractionQueue {
    handle: QueueHandle,
    workers: Vec<JoinHandle<()>>,
}

impl ExtractionQueue {
    /// Spawn `workers` tasks sharing one channel of `capacity` jobs.
    /// Must be called from within a Tokio runtime.
    pub fn start(handler: Arc<dyn ExtractionHandler>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<ExtractionJob>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(workers.max(1));
        for worker in 0..workers.max(1) {
            let receiver = receiver.clone();
            let handler = handler.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    // Hold the lock only while waiting for the next job.
                    let job = { receiver.lock().await.recv().await };
                    let Some(job) = job else { break };
                    match handler.handle(&job).await {
                        Ok(count) => info!(
                            worker,
                            contact_id = %job.contact_id,
                            document = %job.document_name,
                            skills = count,
                            "skill extraction finished"
                        ),
                        Err(e) => error!(
                            worker,
                            contact_id = %job.contact_id,
                            document = %job.document_name,
                            error = %e,
                            "skill extraction failed"
                        ),
                    }
                }
                debug!(worker, "extraction worker stopped");
            }));
        }

        Self {
            handle: QueueHandle { sender },
            workers: handles,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Close the queue and wait for queued jobs to drain.
    ///
    /// Returns once every outstanding [`QueueHandle`] clone has been
    /// dropped and the workers have finished their jobs.
    pub async fn shutdown(self) {
        drop(self.handle);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
