use crate::errors::BibSortError;
use crate::task::{DetectionResult, ImageTask};
use crate::traits::{BibDetector, PayloadPreparer};
use indicatif::ProgressBar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// State shared by every worker of one run.
///
/// The queue and result locks are only ever held for a push or a pop, never
/// across an await.
struct WorkerShared<P, D> {
    preparer: Arc<P>,
    detector: Arc<D>,
    queue: Mutex<VecDeque<ImageTask>>,
    results: Mutex<Vec<DetectionResult>>,
    completed: Arc<AtomicUsize>,
    progress: ProgressBar,
    grace_period: Duration,
    cancellation_token: CancellationToken,
}

/// Fixed-size pool that runs preprocess → detect for every image.
pub struct DetectionPool<P: PayloadPreparer, D: BibDetector> {
    preparer: Arc<P>,
    detector: Arc<D>,
    max_workers: usize,
    grace_period: Duration,
    completed: Arc<AtomicUsize>,
    progress: ProgressBar,
    cancellation_token: CancellationToken,
}

impl<P: PayloadPreparer + 'static, D: BibDetector + 'static> DetectionPool<P, D> {
    pub fn new(preparer: Arc<P>, detector: Arc<D>, max_workers: usize) -> Self {
        Self {
            preparer,
            detector,
            max_workers: max_workers.max(1),
            grace_period: Duration::from_secs(10),
            completed: Arc::new(AtomicUsize::new(0)),
            progress: ProgressBar::hidden(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Token that stops dispatch when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Tasks finished so far, successful or not.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub const fn worker_count(&self) -> usize {
        self.max_workers
    }

    /// Process every task and return one result per task that was started.
    ///
    /// Completion order is arbitrary. After cancellation, tasks that never
    /// started have no result.
    pub async fn run(&self, tasks: Vec<ImageTask>) -> Vec<DetectionResult> {
        let total = tasks.len();
        let workers = self.max_workers.min(total);
        if workers == 0 {
            return Vec::new();
        }

        let shared = Arc::new(WorkerShared {
            preparer: Arc::clone(&self.preparer),
            detector: Arc::clone(&self.detector),
            queue: Mutex::new(tasks.into()),
            results: Mutex::new(Vec::with_capacity(total)),
            completed: Arc::clone(&self.completed),
            progress: self.progress.clone(),
            grace_period: self.grace_period,
            cancellation_token: self.cancellation_token.clone(),
        });

        self.progress.set_length(total as u64);
        info!(total, workers, "starting detection pool");

        let tracker = TaskTracker::new();
        for worker_id in 0..workers {
            let shared = Arc::clone(&shared);
            tracker.spawn(async move { Self::worker_loop(worker_id, shared).await });
        }
        tracker.close();
        tracker.wait().await;

        let results = std::mem::take(&mut *shared.results.lock());
        let skipped = total - results.len();
        if skipped > 0 {
            warn!(skipped, "run cancelled before every image was dispatched");
        }
        results
    }

    async fn worker_loop(worker_id: usize, shared: Arc<WorkerShared<P, D>>) {
        loop {
            if shared.cancellation_token.is_cancelled() {
                debug!(worker_id, "stop requested, worker exiting");
                break;
            }
            let next = shared.queue.lock().pop_front();
            let Some(task) = next else {
                break;
            };

            // own task per image so a panicking detector only loses its image
            let path = task.path().to_path_buf();
            let mut handle = tokio::spawn(Self::process_task(Arc::clone(&shared), task));
            let result = tokio::select! {
                joined = &mut handle => match joined {
                    Ok(result) => result,
                    Err(join_error) => {
                        warn!(
                            worker_id,
                            path = %path.display(),
                            error = %join_error,
                            "detection task died"
                        );
                        DetectionResult::failed(
                            &path,
                            BibSortError::WorkerPool {
                                operation: "detect".to_string(),
                                message: join_error.to_string(),
                            },
                        )
                    }
                },
                _ = Self::drain_deadline(&shared) => {
                    handle.abort();
                    warn!(
                        worker_id,
                        path = %path.display(),
                        "abandoned in-flight image after grace period"
                    );
                    DetectionResult::failed(&path, BibSortError::Cancelled { path: path.clone() })
                }
            };

            shared.results.lock().push(result);
            shared.completed.fetch_add(1, Ordering::Relaxed);
            shared.progress.inc(1);
        }
    }

    /// Resolves `grace_period` after cancellation; pending forever otherwise.
    async fn drain_deadline(shared: &WorkerShared<P, D>) {
        shared.cancellation_token.cancelled().await;
        tokio::time::sleep(shared.grace_period).await;
    }

    async fn process_task(shared: Arc<WorkerShared<P, D>>, task: ImageTask) -> DetectionResult {
        let path = task.path().to_path_buf();
        let preparer = Arc::clone(&shared.preparer);

        let prepared = tokio::task::spawn_blocking(move || preparer.prepare(&task)).await;
        let payload = match prepared {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                warn!(path = %path.display(), error = %e, "preprocessing failed");
                return DetectionResult::failed(path, e);
            }
            Err(join_error) => {
                warn!(path = %path.display(), error = %join_error, "preprocessing task died");
                return DetectionResult::failed(
                    path,
                    BibSortError::WorkerPool {
                        operation: "preprocess".to_string(),
                        message: join_error.to_string(),
                    },
                );
            }
        };

        match shared.detector.detect(&payload).await {
            Ok(numbers) => {
                if !numbers.is_empty() {
                    shared.progress.println(format!(
                        "File: {} -> Detected: {}",
                        path.file_name().unwrap_or_default().to_string_lossy(),
                        numbers.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
                    ));
                }
                DetectionResult::detected(path, numbers)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "detection failed, image left unsorted");
                DetectionResult::failed(path, e)
            }
        }
    }
}
