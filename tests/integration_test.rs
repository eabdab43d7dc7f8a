use image::{Rgb, RgbImage};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use race_number_radar::client::CompletionRequest;
use race_number_radar::mocks::RecordingSleeper;
use race_number_radar::{
    BibDetector, BibSortError, CompletionTransport, Config, DetectionClient, JpegPreparer,
    ProcessedPayload, RaceSorter,
};

// テスト用のトランスポート：画像ごとの応答を返す（統合テスト内で定義）
//
// The request carries only the encoded image, so replies are keyed on the
// image's solid fill colour, which survives JPEG re-encoding.
struct ColourKeyedTransport;

#[async_trait::async_trait]
impl CompletionTransport for ColourKeyedTransport {
    async fn complete(&self, request: &CompletionRequest) -> race_number_radar::Result<String> {
        let json = serde_json::to_value(request).map_err(|e| BibSortError::FatalApi {
            status: None,
            message: e.to_string(),
        })?;
        let uri = json["messages"][0]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let encoded = uri.split_once(',').map(|(_, data)| data).unwrap_or_default();

        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BibSortError::FatalApi {
                status: None,
                message: e.to_string(),
            })?;
        let image = image::load_from_memory(&bytes)
            .map_err(|e| BibSortError::FatalApi {
                status: None,
                message: e.to_string(),
            })?
            .into_rgb8();

        let Rgb([r, g, b]) = *image.get_pixel(0, 0);
        let reply = if r > 200 && g < 60 && b < 60 {
            "123"
        } else if g > 200 && r < 60 && b < 60 {
            "Bibs: 123, 456"
        } else {
            "none"
        };
        Ok(reply.to_string())
    }
}

fn write_solid(path: &Path, colour: [u8; 3]) {
    RgbImage::from_pixel(64, 64, Rgb(colour)).save(path).unwrap();
}

#[tokio::test]
async fn test_three_images_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let input_dir = temp_dir.path().join("race");
    let output_dir = temp_dir.path().join("sorted");
    fs::create_dir_all(&input_dir).unwrap();

    let img1 = input_dir.join("img1.jpg");
    let img2 = input_dir.join("img2.png");
    let img3 = input_dir.join("img3.jpg");
    write_solid(&img1, [255, 0, 0]);
    write_solid(&img2, [0, 255, 0]);
    write_solid(&img3, [0, 0, 255]);

    let config = Config {
        workers: 3,
        output_dir: Some(output_dir.clone()),
        ..Config::default()
    };
    let detector = DetectionClient::new(ColourKeyedTransport, &config);
    let sorter = RaceSorter::new(JpegPreparer::new(config.max_size_kb), detector, config);

    let (aggregation, total) = sorter.detect_directory(&input_dir).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(aggregation.table.len(), 2);
    assert_eq!(aggregation.table["123"], vec![img1.clone(), img2.clone()]);
    assert_eq!(aggregation.table["456"], vec![img2.clone()]);
    assert_eq!(aggregation.unsorted, vec![img3.clone()]);
    assert!(aggregation.failed.is_empty());

    let summary = sorter.process_directory(&input_dir).await.unwrap();
    assert_eq!(summary.copied, 3);
    assert!(output_dir.join("123").join("img1.jpg").exists());
    assert!(output_dir.join("123").join("img2.png").exists());
    assert!(output_dir.join("456").join("img2.png").exists());
    assert!(!output_dir.join("456").join("img1.jpg").exists());
}

#[tokio::test]
async fn test_unreadable_image_does_not_stop_the_run() {
    let temp_dir = TempDir::new().unwrap();
    let input_dir = temp_dir.path().to_path_buf();
    write_solid(&input_dir.join("good.jpg"), [255, 0, 0]);
    fs::write(input_dir.join("broken.jpg"), b"not really a jpeg").unwrap();

    let config = Config {
        workers: 2,
        ..Config::default()
    };
    let detector = DetectionClient::new(ColourKeyedTransport, &config);
    let sorter =
        RaceSorter::new(JpegPreparer::new(config.max_size_kb), detector, config).with_dry_run(true);

    let (aggregation, _) = sorter.detect_directory(&input_dir).await.unwrap();
    assert_eq!(aggregation.table["123"], vec![input_dir.join("good.jpg")]);
    assert_eq!(aggregation.failed.len(), 1);
    assert_eq!(aggregation.failed[0].0, input_dir.join("broken.jpg"));
}

#[tokio::test]
async fn test_client_retries_through_public_api() {
    use race_number_radar::mocks::ScriptedTransport;

    let transport = ScriptedTransport::new(vec![
        Err(BibSortError::from_status(429, "rate limited")),
        Ok("0815".to_string()),
    ]);
    let sleeper = RecordingSleeper::default();
    let client = DetectionClient::new(transport, &Config::default()).with_sleeper(sleeper);

    let payload = ProcessedPayload::new("x.jpg", vec![1, 2, 3], "image/jpeg");
    let numbers = client.detect(&payload).await.unwrap();

    let expected: BTreeSet<String> = ["0815".to_string()].into_iter().collect();
    assert_eq!(numbers, expected);
    assert_eq!(client.transport().calls(), 2);
}

#[test]
fn test_cli_parsing() {
    use clap::Parser;
    use race_number_radar::Cli;

    let cli = Cli::try_parse_from([
        "race-number-radar",
        "photos",
        "--workers",
        "8",
        "--min-bib-len",
        "4",
        "--max-bib-len",
        "5",
        "--dry-run",
    ])
    .unwrap();

    let config = cli.apply_overrides(Config::default());
    assert_eq!(cli.directory, PathBuf::from("photos"));
    assert!(cli.dry_run);
    assert_eq!(config.workers, 8);
    assert_eq!((config.min_bib_len, config.max_bib_len), (4, 5));
    assert!(config.validate().is_ok());
}
