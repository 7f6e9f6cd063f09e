use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::error::SetupError;

/// Upper bound for `jobs` and `check_jobs`; the worker pool's semaphore and
/// channel cannot be sized beyond it
pub const MAX_CONCURRENCY: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Configuration for a mirror run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Root of the tree being mirrored
    pub source_dir: PathBuf,
    /// Root of the mirrored tree
    pub dest_dir: PathBuf,
    /// Source extensions converted to `target_format` (lowercase, no leading dot)
    pub transcode_formats: Vec<String>,
    /// Extension of transcoded output
    pub target_format: String,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Extra encoder arguments; the per-format default is used when unset
    pub encoder_options: Option<String>,
    /// Explicit rsync binary; looked up on PATH when unset
    pub rsync_bin: Option<PathBuf>,
    /// Allow rsync at all (plain copy otherwise)
    pub use_rsync: bool,
    /// Parent for the private staging directory (system temp dir when unset)
    pub temp_dir: Option<PathBuf>,
    /// Transcode worker count; 0 runs everything in one sequential loop
    pub jobs: usize,
    /// Concurrency of the staleness prefetch pass
    pub check_jobs: usize,
    pub dry_run: bool,
    pub include_hidden: bool,
    /// Remove destination files that have no source counterpart
    pub delete_extraneous: bool,
    /// Treat every file as stale
    pub force: bool,
    /// Fingerprint-based staleness for transcoded files (mtime otherwise)
    pub checksum: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl MirrorConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            source_dir: PathBuf::new(),
            dest_dir: PathBuf::new(),
            transcode_formats: ["flac", "wv", "wav", "ape", "fla"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            target_format: "ogg".to_string(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            encoder_options: None,
            rsync_bin: None,
            use_rsync: true,
            temp_dir: None,
            jobs: num_cpus::get(),
            check_jobs: num_cpus::get(),
            dry_run: false,
            include_hidden: false,
            delete_extraneous: false,
            force: false,
            checksum: true,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.normalize_formats();
        Ok(config)
    }

    /// Lowercase and strip leading dots from every configured extension
    pub fn normalize_formats(&mut self) {
        self.transcode_formats = self
            .transcode_formats
            .iter()
            .map(|f| normalize_extension(f))
            .filter(|f| !f.is_empty())
            .collect();
        self.target_format = normalize_extension(&self.target_format);
    }

    pub fn is_transcode_format(&self, ext: &str) -> bool {
        let ext = normalize_extension(ext);
        self.transcode_formats.iter().any(|f| *f == ext)
    }

    /// Reject configurations that cannot produce a consistent mirror
    pub fn validate(&self) -> Result<(), SetupError> {
        let target = normalize_extension(&self.target_format);
        if target.is_empty() {
            return Err(SetupError::InvalidConfig("target format is empty".to_string()));
        }
        if self.is_transcode_format(&target) {
            return Err(SetupError::TargetIsTranscodeFormat(target));
        }
        if self.check_jobs == 0 {
            return Err(SetupError::InvalidConfig(
                "staleness check concurrency must be at least 1".to_string(),
            ));
        }
        for (name, value) in [("jobs", self.jobs), ("check_jobs", self.check_jobs)] {
            if value > MAX_CONCURRENCY {
                return Err(SetupError::InvalidConfig(format!(
                    "{} = {} exceeds the limit of {}",
                    name, value, MAX_CONCURRENCY
                )));
            }
        }
        Ok(())
    }
}

/// Parse a comma-delimited extension list such as `flac, .WV,ape`
pub fn parse_format_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(normalize_extension)
        .filter(|f| !f.is_empty())
        .collect()
}

/// Lowercase an extension and strip surrounding whitespace and leading dots
pub(crate) fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}
