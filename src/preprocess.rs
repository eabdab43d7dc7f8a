use crate::errors::{BibSortError, Result};
use crate::task::ImageTask;
use crate::traits::PayloadPreparer;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const QUALITY_START: u8 = 95;
const QUALITY_STEP: u8 = 5;
const QUALITY_FLOOR: u8 = 10;
/// Downscaling stops before the longest side would drop below this.
const MIN_DIMENSION: u32 = 256;

/// Image bytes ready to be sent to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedPayload {
    source: PathBuf,
    bytes: Vec<u8>,
    mime: &'static str,
}

impl ProcessedPayload {
    pub fn new(source: impl Into<PathBuf>, bytes: Vec<u8>, mime: &'static str) -> Self {
        Self {
            source: source.into(),
            bytes,
            mime,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub const fn mime(&self) -> &'static str {
        self.mime
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

pub fn is_supported_image_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            matches!(
                ext.to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "webp"
            )
        })
}

/// Load `path` and make it fit into `max_size_kb`.
pub fn prepare(path: &Path, max_size_kb: u64) -> Result<ProcessedPayload> {
    let bytes = ImageTask::new(path).read_bytes()?;
    prepare_bytes(path, bytes, max_size_kb)
}

/// Fit already-loaded image bytes into `max_size_kb`.
///
/// Files already under budget are passed through untouched. Larger ones are
/// re-encoded as JPEG, lowering quality first and resolution second. When
/// even the smallest rung at the smallest allowed resolution is too big the
/// smallest encoding is returned anyway.
pub fn prepare_bytes(path: &Path, bytes: Vec<u8>, max_size_kb: u64) -> Result<ProcessedPayload> {
    if !is_supported_image_format(path) {
        return Err(unreadable(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unsupported file extension"),
        ));
    }

    let budget = max_size_kb * 1024;
    let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
        .with_guessed_format()
        .map_err(|e| unreadable(path, e))?;

    let mime = match reader.format() {
        Some(ImageFormat::Jpeg) => "image/jpeg",
        Some(ImageFormat::Png) => "image/png",
        Some(ImageFormat::WebP) => "image/webp",
        _ => {
            return Err(unreadable(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "not a JPEG, PNG or WebP image",
                ),
            ))
        }
    };

    // a valid header says nothing about the pixel data, so always decode
    let image = reader.decode().map_err(|e| unreadable(path, e))?;
    if bytes.len() as u64 <= budget {
        return Ok(ProcessedPayload::new(path, bytes, mime));
    }

    compress_to_budget(path, DynamicImage::ImageRgb8(image.into_rgb8()), budget)
}

fn compress_to_budget(
    path: &Path,
    mut image: DynamicImage,
    budget: u64,
) -> Result<ProcessedPayload> {
    let mut smallest: Option<Vec<u8>> = None;

    loop {
        let (width, height) = image.dimensions();
        match fit_quality(path, &image, budget)? {
            Fit::Fits(bytes, quality) => {
                debug!(
                    path = %path.display(),
                    width,
                    height,
                    quality,
                    size = bytes.len(),
                    "compressed image"
                );
                return Ok(ProcessedPayload::new(path, bytes, "image/jpeg"));
            }
            Fit::TooLarge(bytes) => {
                if smallest.as_ref().map_or(true, |s| bytes.len() < s.len()) {
                    smallest = Some(bytes);
                }
            }
        }

        let (next_width, next_height) = ((width * 3 / 4).max(1), (height * 3 / 4).max(1));
        if next_width.max(next_height) < MIN_DIMENSION {
            break;
        }
        image = image.resize_exact(next_width, next_height, FilterType::Lanczos3);
    }

    let bytes = smallest.unwrap_or_default();
    warn!(
        path = %path.display(),
        size_kb = bytes.len() / 1024,
        budget_kb = budget / 1024,
        "image still over size budget at minimum resolution"
    );
    Ok(ProcessedPayload::new(path, bytes, "image/jpeg"))
}

enum Fit {
    Fits(Vec<u8>, u8),
    TooLarge(Vec<u8>),
}

/// Highest quality rung whose encoding fits the budget at this resolution.
///
/// JPEG size grows with quality, so after checking the floor the ladder is
/// bisected instead of walked.
fn fit_quality(path: &Path, image: &DynamicImage, budget: u64) -> Result<Fit> {
    let ladder: Vec<u8> = (QUALITY_FLOOR..=QUALITY_START)
        .rev()
        .step_by(QUALITY_STEP as usize)
        .collect();

    let floor = encode_jpeg(path, image, QUALITY_FLOOR)?;
    if floor.len() as u64 > budget {
        return Ok(Fit::TooLarge(floor));
    }

    // ladder is ordered from best to worst quality; find the first rung that fits
    let (mut lo, mut hi) = (0, ladder.len());
    let mut best = (floor, QUALITY_FLOOR);
    while lo < hi {
        let mid = (lo + hi) / 2;
        let quality = ladder[mid];
        let encoded = encode_jpeg(path, image, quality)?;
        if encoded.len() as u64 <= budget {
            best = (encoded, quality);
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(Fit::Fits(best.0, best.1))
}

fn encode_jpeg(path: &Path, image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    image
        .write_with_encoder(encoder)
        .map_err(|e| BibSortError::Encoding {
            path: path.to_path_buf(),
            operation: format!("JPEG encode at quality {quality}"),
            source: e,
        })?;
    Ok(buffer)
}

fn unreadable(
    path: &Path,
    source: impl std::error::Error + Send + Sync + 'static,
) -> BibSortError {
    BibSortError::UnreadableImage {
        path: path.to_path_buf(),
        source: Box::new(source),
    }
}

/// The production preparer: read from disk, fit into the size budget.
#[derive(Debug, Clone, Copy)]
pub struct JpegPreparer {
    max_size_kb: u64,
}

impl JpegPreparer {
    pub const fn new(max_size_kb: u64) -> Self {
        Self { max_size_kb }
    }
}

impl PayloadPreparer for JpegPreparer {
    fn prepare(&self, task: &ImageTask) -> Result<ProcessedPayload> {
        prepare(task.path(), self.max_size_kb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::fs;
    use tempfile::TempDir;

    fn noise_image(width: u32, height: u32) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(7);
        RgbImage::from_fn(width, height, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]))
    }

    #[test]
    fn test_supported_formats() {
        let test_cases = vec![
            ("test.jpg", true),
            ("test.JPEG", true),
            ("test.png", true),
            ("test.webp", true),
            ("test.gif", false),
            ("test.txt", false),
            ("test", false),
        ];

        for (filename, expected) in test_cases {
            assert_eq!(
                is_supported_image_format(Path::new(filename)),
                expected,
                "{filename}"
            );
        }
    }

    #[test]
    fn test_small_image_passes_through_unchanged() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("small.jpg");
        RgbImage::from_pixel(64, 64, Rgb([200, 30, 30])).save(&path)?;
        let original = fs::read(&path)?;

        let payload = prepare(&path, 1500)?;
        assert_eq!(payload.bytes(), original.as_slice());
        assert_eq!(payload.mime(), "image/jpeg");

        let again = prepare_bytes(&path, payload.bytes().to_vec(), 1500)?;
        assert_eq!(again, payload);
        Ok(())
    }

    #[test]
    fn test_small_png_keeps_its_mime_type() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("small.png");
        RgbImage::from_pixel(32, 32, Rgb([0, 0, 255])).save(&path)?;

        let payload = prepare(&path, 1500)?;
        assert_eq!(payload.mime(), "image/png");
        Ok(())
    }

    #[test]
    fn test_large_image_fits_budget() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("noise.png");
        noise_image(1024, 1024).save(&path)?;
        assert!(fs::metadata(&path)?.len() > 100 * 1024);

        let payload = prepare(&path, 100)?;
        assert!(payload.size() <= 100 * 1024, "size {}", payload.size());
        assert_eq!(payload.mime(), "image/jpeg");
        assert_eq!(payload.source(), path.as_path());
        Ok(())
    }

    #[test]
    fn test_unattainable_budget_is_best_effort() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("noise.png");
        noise_image(600, 400).save(&path)?;

        let payload = prepare(&path, 1)?;
        assert!(!payload.bytes().is_empty());
        assert_eq!(payload.mime(), "image/jpeg");
        Ok(())
    }

    #[test]
    fn test_unsupported_extension_is_unreadable() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("notes.txt");
        fs::write(&path, "hello")?;

        assert!(matches!(
            prepare(&path, 1500),
            Err(BibSortError::UnreadableImage { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_garbage_bytes_are_unreadable() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("broken.jpg");
        fs::write(&path, b"definitely not a jpeg")?;

        assert!(matches!(
            prepare(&path, 1500),
            Err(BibSortError::UnreadableImage { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_truncated_large_file_is_unreadable() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("truncated.png");
        noise_image(512, 512).save(&path)?;
        let bytes = fs::read(&path)?;
        let truncated = bytes[..bytes.len() / 2].to_vec();

        assert!(matches!(
            prepare_bytes(&path, truncated, 10),
            Err(BibSortError::UnreadableImage { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_truncated_small_file_is_unreadable() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("cut.png");
        noise_image(200, 200).save(&path)?;
        let bytes = fs::read(&path)?;
        let truncated = bytes[..bytes.len() / 3].to_vec();
        assert!((truncated.len() as u64) < 1500 * 1024);

        assert!(matches!(
            prepare_bytes(&path, truncated, 1500),
            Err(BibSortError::UnreadableImage { .. })
        ));
        Ok(())
    }
}
