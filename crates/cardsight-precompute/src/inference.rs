//! Dedicated encoder thread.
//!
//! The encoder is moved onto one OS thread and fed batches over a channel, so
//! model inference never blocks the async runtime and never runs twice at once.

use std::thread::JoinHandle;

use cardsight_core::{CardsightError, Encoder};
use image::RgbImage;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{PrecomputeError, Result};

type Reply = oneshot::Sender<cardsight_core::Result<Vec<Vec<f32>>>>;

struct Job {
    images: Vec<RgbImage>,
    reply: Reply,
}

/// Handle to the inference thread.
#[derive(Debug)]
pub struct InferenceWorker {
    jobs: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl InferenceWorker {
    /// Moves `encoder` onto a new thread.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the thread cannot be spawned.
    pub fn spawn<E>(encoder: E) -> Result<Self>
    where
        E: Encoder + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Job>(4);
        let thread = std::thread::Builder::new()
            .name("cardsight-inference".into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    debug!(images = job.images.len(), "running inference batch");
                    let result = encoder.embed_batch(&job.images);
                    if let Err(e) = &result {
                        error!(error = %e, "inference batch failed");
                    }
                    // the requester may have given up
                    let _ = job.reply.send(result);
                }
            })?;
        Ok(Self {
            jobs: Some(tx),
            thread: Some(thread),
        })
    }

    /// Embeds one batch, preserving order.
    ///
    /// # Errors
    ///
    /// Returns `Encoder` if inference fails or the thread has stopped.
    pub async fn embed(&self, images: Vec<RgbImage>) -> Result<Vec<Vec<f32>>> {
        let stopped = || PrecomputeError::Encoder(CardsightError::Inference(
            "inference thread stopped".into(),
        ));
        let jobs = self.jobs.as_ref().ok_or_else(stopped)?;
        let (reply, response) = oneshot::channel();
        jobs.send(Job { images, reply })
            .await
            .map_err(|_| stopped())?;
        Ok(response.await.map_err(|_| stopped())??)
    }

    /// Closes the queue and waits for the thread to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("inference thread panicked");
            }
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
