pub mod aggregate;
pub mod client;
pub mod config;
pub mod errors;
pub mod organize;
pub mod parse;
pub mod preprocess;
pub mod retry;
pub mod task;
pub mod traits;
pub mod worker;

pub mod mocks;

use indicatif::ProgressBar;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use aggregate::{aggregate, Aggregation, Aggregator, GroupingTable};
pub use client::{DetectionClient, HttpTransport};
pub use config::{Cli, Config};
pub use errors::{BibSortError, Result};
pub use organize::{organize, scan_directory, OrganizeReport};
pub use preprocess::{prepare, JpegPreparer, ProcessedPayload};
pub use task::{DetectionResult, ImageTask};
pub use traits::*;
pub use worker::DetectionPool;

/// What one run did, for the closing report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub detected: usize,
    pub unsorted: usize,
    pub failed: usize,
    pub skipped: usize,
    pub groups: usize,
    pub copied: usize,
    pub copy_failures: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Images found:      {}", self.total)?;
        writeln!(f, "With bib numbers:  {}", self.detected)?;
        writeln!(f, "Unsorted:          {}", self.unsorted)?;
        writeln!(f, "Failed:            {}", self.failed)?;
        if self.skipped > 0 {
            writeln!(f, "Skipped (stopped): {}", self.skipped)?;
        }
        writeln!(f, "Bib folders:       {}", self.groups)?;
        write!(f, "Copies made:       {}", self.copied)?;
        if self.copy_failures > 0 {
            write!(f, " ({} failed)", self.copy_failures)?;
        }
        Ok(())
    }
}

/// Scan → detect → group → copy, for one directory.
pub struct RaceSorter<P: PayloadPreparer + 'static, D: BibDetector + 'static> {
    pool: DetectionPool<P, D>,
    config: Config,
    dry_run: bool,
}

impl<P: PayloadPreparer + 'static, D: BibDetector + 'static> RaceSorter<P, D> {
    pub fn new(preparer: P, detector: D, config: Config) -> Self {
        let pool = DetectionPool::new(Arc::new(preparer), Arc::new(detector), config.workers)
            .with_grace_period(config.grace_period());
        Self {
            pool,
            config,
            dry_run: false,
        }
    }

    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.pool = self.pool.with_progress(progress);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.pool.cancellation_token()
    }

    pub fn output_dir_for(&self, input_dir: &Path) -> PathBuf {
        self.config
            .output_dir
            .clone()
            .unwrap_or_else(|| input_dir.to_path_buf())
    }

    /// Detect bibs for every image in `input_dir` and return the grouping.
    pub async fn detect_directory(&self, input_dir: &Path) -> Result<(Aggregation, usize)> {
        let tasks = scan_directory(input_dir)?;
        let total = tasks.len();
        if total == 0 {
            info!(directory = %input_dir.display(), "no image files found");
            return Ok((Aggregation::default(), 0));
        }

        info!(
            total,
            workers = self.pool.worker_count(),
            directory = %input_dir.display(),
            "processing images"
        );

        let mut aggregator = Aggregator::new();
        for result in self.pool.run(tasks).await {
            aggregator.push(&result);
        }
        Ok((aggregator.finish(), total))
    }

    pub async fn process_directory(&self, input_dir: &Path) -> Result<RunSummary> {
        let (aggregation, total) = self.detect_directory(input_dir).await?;
        let processed = aggregation.unsorted.len()
            + aggregation.failed.len()
            + aggregation.detected_images();

        let mut summary = RunSummary {
            total,
            detected: aggregation.detected_images(),
            unsorted: aggregation.unsorted.len(),
            failed: aggregation.failed.len(),
            skipped: total.saturating_sub(processed),
            groups: aggregation.groups(),
            ..RunSummary::default()
        };

        if self.dry_run || aggregation.table.is_empty() {
            return Ok(summary);
        }

        let report = organize(&aggregation, &self.output_dir_for(input_dir));
        summary.copied = report.copied;
        summary.copy_failures = report.failures.len();
        Ok(summary)
    }
}
