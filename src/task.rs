use crate::errors::{BibSortError, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// One image waiting to be processed.
///
/// Holds only the path; the bytes are read when a worker gets to it so a
/// large batch never sits in memory at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageTask {
    path: PathBuf,
}

impl ImageTask {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|e| BibSortError::FileSystem {
            path: self.path.clone(),
            operation: "read image".to_string(),
            source: e,
        })
    }
}

/// Outcome of one image: the bibs found, or why none could be looked for.
#[derive(Debug)]
pub struct DetectionResult {
    pub path: PathBuf,
    pub numbers: BTreeSet<String>,
    pub error: Option<BibSortError>,
}

impl DetectionResult {
    pub fn detected(path: impl Into<PathBuf>, numbers: BTreeSet<String>) -> Self {
        Self {
            path: path.into(),
            numbers,
            error: None,
        }
    }

    pub fn failed(path: impl Into<PathBuf>, error: BibSortError) -> Self {
        Self {
            path: path.into(),
            numbers: BTreeSet::new(),
            error: Some(error),
        }
    }

    pub const fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}
