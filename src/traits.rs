use crate::errors::Result;
use crate::preprocess::ProcessedPayload;
use crate::task::ImageTask;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;

/// Turns a discovered image into something small enough to upload.
///
/// CPU-bound; the worker pool calls it on the blocking thread pool.
pub trait PayloadPreparer: Send + Sync {
    fn prepare(&self, task: &ImageTask) -> Result<ProcessedPayload>;
}

/// Finds bib numbers in one prepared image.
///
/// An empty set is a valid answer. Implementations own their retry policy;
/// an `Err` means the image is given up on.
#[async_trait]
pub trait BibDetector: Send + Sync {
    async fn detect(&self, payload: &ProcessedPayload) -> Result<BTreeSet<String>>;
}

/// A single chat-completion round trip: request in, reply text out.
///
/// Errors must already be classified as transient or fatal.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn complete(&self, request: &crate::client::CompletionRequest) -> Result<String>;
}

/// Source of backoff delays, swapped for a recording fake in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
