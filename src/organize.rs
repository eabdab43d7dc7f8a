use crate::aggregate::Aggregation;
use crate::errors::{BibSortError, Result};
use crate::preprocess::is_supported_image_format;
use crate::task::ImageTask;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Supported images directly inside `directory`, sorted by path.
///
/// Subdirectories are not entered, so folders created by earlier runs are
/// never picked up again.
pub fn scan_directory(directory: &Path) -> Result<Vec<ImageTask>> {
    if !directory.is_dir() {
        return Err(BibSortError::FileSystem {
            path: directory.to_path_buf(),
            operation: "directory existence check".to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Input directory does not exist",
            ),
        });
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(directory).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| BibSortError::FileSystem {
            path: directory.to_path_buf(),
            operation: "directory scan".to_string(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() && is_supported_image_format(entry.path()) {
            paths.push(entry.into_path());
        }
    }
    paths.sort();

    Ok(paths.into_iter().map(ImageTask::new).collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganizeReport {
    pub copied: usize,
    pub failures: Vec<(PathBuf, String)>,
}

/// Copy every grouped image into `<output_dir>/<bib>/`.
///
/// A failed copy or folder is logged and recorded; the remaining bibs and
/// copies still run.
pub fn organize(aggregation: &Aggregation, output_dir: &Path) -> OrganizeReport {
    let mut report = OrganizeReport::default();

    for (number, images) in &aggregation.table {
        let number_dir = output_dir.join(number);
        if let Err(e) = fs::create_dir_all(&number_dir) {
            let error = BibSortError::FileSystem {
                path: number_dir.clone(),
                operation: "bib directory creation".to_string(),
                source: e,
            };
            warn!(number = %number, error = %error, "skipping bib folder");
            let reason = error.to_string();
            report
                .failures
                .extend(images.iter().map(|image| (image.clone(), reason.clone())));
            continue;
        }

        let mut copied_here = 0;
        for image in images {
            let Some(file_name) = image.file_name() else {
                continue;
            };
            let target = number_dir.join(file_name);
            match fs::copy(image, &target) {
                Ok(_) => copied_here += 1,
                Err(e) => {
                    warn!(
                        source = %image.display(),
                        target = %number_dir.display(),
                        error = %e,
                        "copy failed"
                    );
                    report.failures.push((image.clone(), e.to_string()));
                }
            }
        }
        report.copied += copied_here;
        info!(
            number = %number,
            images = copied_here,
            directory = %number_dir.display(),
            "organized images"
        );
    }

    report
}
