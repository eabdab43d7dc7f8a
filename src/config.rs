use crate::errors::{BibSortError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "qwen/qwen2.5-vl-32b-instruct";
pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_PROVIDER: &str = "deepinfra/bf16";
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Immutable settings for one run.
///
/// Built once before the pipeline starts and handed to each component at
/// construction. Serialized form is the optional settings file; the API key
/// never lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: String,
    pub workers: usize,
    pub min_bib_len: usize,
    pub max_bib_len: usize,
    pub max_size_kb: u64,
    pub api_base: String,
    pub provider: Option<String>,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub grace_period_secs: u64,
    pub output_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            workers: 64,
            min_bib_len: 3,
            max_bib_len: 4,
            max_size_kb: 1500,
            api_base: DEFAULT_API_BASE.to_string(),
            provider: Some(DEFAULT_PROVIDER.to_string()),
            max_tokens: 30,
            request_timeout_secs: 60,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            grace_period_secs: 10,
            output_dir: None,
        }
    }
}

impl Config {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub const fn max_size_bytes(&self) -> u64 {
        self.max_size_kb * 1024
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, reason: &str| {
            Err(BibSortError::Validation {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.model.trim().is_empty() {
            return invalid("model", "must not be empty");
        }
        if self.workers == 0 {
            return invalid("workers", "must be at least 1");
        }
        if self.min_bib_len == 0 {
            return invalid("min_bib_len", "must be at least 1");
        }
        if self.min_bib_len > self.max_bib_len {
            return invalid("max_bib_len", "must not be smaller than min_bib_len");
        }
        if self.max_size_kb == 0 {
            return invalid("max_size_kb", "must be at least 1");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts", "must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            return invalid("request_timeout_secs", "must be at least 1");
        }
        Ok(())
    }

    /// Load a JSON settings file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| BibSortError::FileSystem {
            path: path.to_path_buf(),
            operation: "read settings".to_string(),
            source: e,
        })?;
        serde_json::from_str(&text).map_err(|e| BibSortError::Configuration {
            message: format!("invalid settings file {}: {e}", path.display()),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BibSortError::FileSystem {
                path: parent.to_path_buf(),
                operation: "create settings directory".to_string(),
                source: e,
            })?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|e| BibSortError::Configuration {
            message: format!("cannot serialize settings: {e}"),
        })?;
        fs::write(path, text).map_err(|e| BibSortError::FileSystem {
            path: path.to_path_buf(),
            operation: "write settings".to_string(),
            source: e,
        })
    }
}

/// Platform settings location, e.g. `~/.config/race-number-radar/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "race-number-radar")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory with images to process
    pub directory: PathBuf,

    /// Where the per-bib folders are created (defaults to the input directory)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    #[arg(short, long)]
    pub model: Option<String>,

    #[arg(short, long)]
    pub workers: Option<usize>,

    #[arg(long)]
    pub min_bib_len: Option<usize>,

    #[arg(long)]
    pub max_bib_len: Option<usize>,

    #[arg(long)]
    pub max_size_kb: Option<u64>,

    #[arg(long)]
    pub api_base: Option<String>,

    /// Pin requests to one upstream provider
    #[arg(long)]
    pub provider: Option<String>,

    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    #[arg(long)]
    pub max_attempts: Option<u32>,

    #[arg(long, env = API_KEY_ENV, hide_env_values = true)]
    pub api_key: Option<String>,

    /// Settings file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Write the merged settings back to the settings file
    #[arg(long)]
    pub save_config: bool,

    /// Detect and report, but do not copy any files
    #[arg(long)]
    pub dry_run: bool,
}

impl Cli {
    pub fn settings_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(default_config_path)
    }

    /// Defaults, then the settings file (if any), then command-line flags.
    ///
    /// An explicit `--config` must exist unless `--save-config` is about to
    /// create it.
    pub fn resolve(&self) -> Result<Config> {
        let base = match (&self.config, self.settings_path()) {
            (Some(explicit), _) if self.save_config && !explicit.exists() => Config::default(),
            (Some(explicit), _) => Config::load(explicit)?,
            (None, Some(path)) if path.is_file() => Config::load(&path)?,
            _ => Config::default(),
        };
        let config = self.apply_overrides(base);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&self, mut config: Config) -> Config {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(len) = self.min_bib_len {
            config.min_bib_len = len;
        }
        if let Some(len) = self.max_bib_len {
            config.max_bib_len = len;
        }
        if let Some(kb) = self.max_size_kb {
            config.max_size_kb = kb;
        }
        if let Some(base) = &self.api_base {
            config.api_base = base.clone();
        }
        if let Some(provider) = &self.provider {
            config.provider = (!provider.is_empty()).then(|| provider.clone());
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout_secs = secs;
        }
        if let Some(attempts) = self.max_attempts {
            config.max_attempts = attempts;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.clone());
        }
        config
    }

    pub fn api_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| BibSortError::Configuration {
                message: format!("API key missing: pass --api-key or set {API_KEY_ENV}"),
            })
    }
}
