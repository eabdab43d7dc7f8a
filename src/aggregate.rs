use crate::task::DetectionResult;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Bib number → images showing it.
pub type GroupingTable = BTreeMap<String, Vec<PathBuf>>;

/// Everything the organizer and the summary need from one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregation {
    pub table: GroupingTable,
    /// Processed fine, but no bib in range was found.
    pub unsorted: Vec<PathBuf>,
    /// Could not be processed; paired with the error message.
    pub failed: Vec<(PathBuf, String)>,
}

impl Aggregation {
    pub fn groups(&self) -> usize {
        self.table.len()
    }

    /// Images that ended up under at least one number.
    pub fn detected_images(&self) -> usize {
        let mut images: Vec<&Path> = self.table.values().flatten().map(PathBuf::as_path).collect();
        images.sort_unstable();
        images.dedup();
        images.len()
    }
}

/// Builds an [`Aggregation`] as results come in.
#[derive(Debug, Default)]
pub struct Aggregator {
    current: Aggregation,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: &DetectionResult) {
        if let Some(error) = &result.error {
            self.current
                .failed
                .push((result.path.clone(), error.to_string()));
            return;
        }
        if result.numbers.is_empty() {
            self.current.unsorted.push(result.path.clone());
            return;
        }
        for number in &result.numbers {
            self.current
                .table
                .entry(number.clone())
                .or_default()
                .push(result.path.clone());
        }
    }

    /// Sort and de-duplicate so the outcome does not depend on arrival order.
    pub fn finish(self) -> Aggregation {
        let mut aggregation = self.current;
        for paths in aggregation.table.values_mut() {
            paths.sort();
            paths.dedup();
        }
        aggregation.unsorted.sort();
        aggregation.unsorted.dedup();
        aggregation.failed.sort();
        aggregation
    }
}

pub fn aggregate(results: &[DetectionResult]) -> Aggregation {
    let mut aggregator = Aggregator::new();
    for result in results {
        aggregator.push(result);
    }
    aggregator.finish()
}
