use anyhow::{ensure, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use race_number_radar::{Cli, DetectionClient, HttpTransport, JpegPreparer, RaceSorter};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    ensure!(
        cli.directory.is_dir(),
        "Input directory does not exist: {}",
        cli.directory.display()
    );

    let config = cli.resolve().context("Failed to load settings")?;
    if cli.save_config {
        let path = cli
            .settings_path()
            .context("No settings location available on this platform")?;
        config.save(&path)?;
        info!(path = %path.display(), "settings saved");
    }

    let api_key = cli.api_key()?;
    let transport = HttpTransport::new(&config, api_key)?;
    let detector = DetectionClient::new(transport, &config);
    let preparer = JpegPreparer::new(config.max_size_kb);

    // length is set once the sorter has scanned the directory
    let progress_bar = ProgressBar::new(0);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )?
        .progress_chars("#>-"),
    );

    let sorter = RaceSorter::new(preparer, detector, config)
        .with_dry_run(cli.dry_run)
        .with_progress(progress_bar.clone());

    let token = sorter.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight images");
            token.cancel();
        }
    });

    let summary = sorter.process_directory(&cli.directory).await?;
    progress_bar.finish();

    println!("{summary}");
    Ok(())
}
