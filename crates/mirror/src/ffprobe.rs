use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::process::Command;

use crate::fingerprint::{TagReader, FINGERPRINT_TAG};

/// The parts of ffprobe's JSON output needed to find tags
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Container-level metadata
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

impl FFProbeData {
    /// Look a tag up by key, ignoring case.
    ///
    /// Container tags win; Ogg and Opus keep their comments on the audio
    /// stream, so streams are searched after.
    pub fn find_tag(&self, key: &str) -> Option<&str> {
        let format_tags = self.format.as_ref().and_then(|f| f.tags.as_ref());
        let stream_tags = self.streams.iter().filter_map(|s| s.tags.as_ref());

        format_tags
            .into_iter()
            .chain(stream_tags)
            .find_map(|tags| {
                tags.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v.as_str())
            })
    }
}

/// Run ffprobe and parse its JSON output
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path) -> Result<FFProbeData> {
    if !file_path.exists() {
        return Err(anyhow!("File does not exist: {}", file_path.display()));
    }

    debug!("Executing FFprobe for: {}", file_path.display());

    let output = Command::new(ffprobe_bin)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(file_path)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!(
            "Failed to execute FFprobe for: {}. Ensure FFprobe is installed and accessible at: {}",
            file_path.display(),
            ffprobe_bin.display()
        ))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        return Err(anyhow!(
            "FFprobe failed (exit code {}) for {}:\nSTDERR: {}",
            exit_code,
            file_path.display(),
            stderr.trim()
        ));
    }

    let json_str = String::from_utf8(output.stdout)
        .context("FFprobe output is not valid UTF-8")?;

    serde_json::from_str(&json_str)
        .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))
}

/// Reads the fingerprint tag with ffprobe
#[derive(Debug, Clone)]
pub struct FfprobeTagReader {
    ffprobe_bin: PathBuf,
}

impl FfprobeTagReader {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self { ffprobe_bin: ffprobe_bin.into() }
    }
}

#[async_trait]
impl TagReader for FfprobeTagReader {
    async fn read_fingerprint(&self, path: &Path) -> Result<Option<String>> {
        let data = probe_file(&self.ffprobe_bin, path).await?;
        Ok(data.find_tag(FINGERPRINT_TAG).map(|v| v.trim().to_lowercase()))
    }
}
