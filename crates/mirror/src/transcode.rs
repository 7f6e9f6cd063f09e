use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use log::debug;
use tokio::process::Command;

use crate::error::{FailureKind, JobFailure};
use crate::fingerprint::FINGERPRINT_TAG;
use crate::job::{StagedJob, TransferJob};
use crate::report::{Event, Reporter};

/// Encoder options used when none were configured, keyed by target extension
pub fn default_encoder_options(target_format: &str) -> Option<&'static str> {
    match target_format {
        // LAME V2, ~190 kbps
        "mp3" => Some("-vn -codec:a libmp3lame -q:a 2"),
        // Vorbis q6, ~192 kbps
        "ogg" => Some("-vn -codec:a libvorbis -q:a 6"),
        "aac" | "m4a" | "mp4" => Some("-vn -codec:a aac -b:a 256k"),
        "opus" => Some("-vn -codec:a libopus -b:a 160k"),
        _ => None,
    }
}

fn is_mp4_family(target_format: &str) -> bool {
    matches!(target_format, "m4a" | "mp4" | "aac")
}

/// Produces one encoded file from one source file
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Encode `job.source_path` into `output`, embedding `fingerprint` when given
    async fn transcode(&self, job: &TransferJob, output: &Path, fingerprint: Option<&str>) -> Result<()>;
}

/// Transcoder backed by the ffmpeg CLI
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_bin: PathBuf,
    target_format: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, target_format: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            target_format: target_format.into().to_lowercase(),
        }
    }

    /// Build the ffmpeg argument list for one job
    pub fn build_encode_command(&self, job: &TransferJob, output: &Path, fingerprint: Option<&str>) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(job.source_path.clone().into_os_string());

        // User options go in verbatim, split on whitespace
        let options = job
            .encoder_options
            .as_deref()
            .or_else(|| default_encoder_options(&self.target_format))
            .unwrap_or("");
        args.extend(options.split_whitespace().map(OsString::from));

        if let Some(fp) = fingerprint {
            if is_mp4_family(&self.target_format) {
                args.push("-movflags".into());
                args.push("use_metadata_tags".into());
            }
            args.push("-metadata".into());
            args.push(format!("{}={}", FINGERPRINT_TAG, fp).into());
        }

        args.push(output.as_os_str().to_os_string());
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, job: &TransferJob, output: &Path, fingerprint: Option<&str>) -> Result<()> {
        let args = self.build_encode_command(job, output, fingerprint);
        debug!("Executing FFmpeg: {} {:?}", self.ffmpeg_bin.display(), args);

        // Dropping the future (cancellation) kills the encoder
        let result = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!(
                "Failed to spawn FFmpeg process at: {}. Ensure FFmpeg is installed and accessible.",
                self.ffmpeg_bin.display()
            ))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(anyhow!(
                "FFmpeg encoding failed (exit code: {})\nSTDERR:\n{}",
                result.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        Ok(())
    }
}

/// Query `ffmpeg -version`, returning its first line
pub async fn ffmpeg_version(ffmpeg_bin: &Path) -> Result<String> {
    let output = Command::new(ffmpeg_bin)
        .arg("-version")
        .output()
        .await
        .with_context(|| format!("Failed to execute FFmpeg at: {}", ffmpeg_bin.display()))?;

    if !output.status.success() {
        return Err(anyhow!("FFmpeg version check failed"));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .next()
        .map(|l| l.to_string())
        .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))
}

/// First pipeline stage: turns a job into a [`StagedJob`].
///
/// Copy-only jobs pass through untouched. Transcode jobs are encoded into the
/// staging directory; nothing here writes to the destination tree.
pub struct TranscodeStage {
    transcoder: Arc<dyn Transcoder>,
    reporter: Arc<dyn Reporter>,
    staging_root: PathBuf,
    dry_run: bool,
}

impl TranscodeStage {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        reporter: Arc<dyn Reporter>,
        staging_root: PathBuf,
        dry_run: bool,
    ) -> Self {
        Self { transcoder, reporter, staging_root, dry_run }
    }

    pub async fn run(&self, job: Arc<TransferJob>) -> Result<StagedJob, JobFailure> {
        if !job.needs_transcode {
            return Ok(StagedJob::passthrough(job));
        }

        let output = job.staging_path(&self.staging_root);
        self.reporter.report(&Event::Transcoding(job.as_ref()));
        if self.dry_run {
            return Ok(StagedJob::transcoded(job, output));
        }

        match self.encode(&job, &output).await {
            Ok(()) => Ok(StagedJob::transcoded(job, output)),
            Err(e) => {
                let _ = tokio::fs::remove_file(&output).await;
                Err(JobFailure::new(FailureKind::Transcode, &job, e))
            }
        }
    }

    /// [`run`](Self::run), with a panic turned into a failure record
    pub async fn run_guarded(&self, job: Arc<TransferJob>) -> Result<StagedJob, JobFailure> {
        let fallback = job.clone();
        std::panic::AssertUnwindSafe(self.run(job))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(JobFailure::panicked(&fallback)))
    }

    async fn encode(&self, job: &TransferJob, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create staging directory: {}", parent.display()))?;
        }

        let fingerprint = if job.checksum_mode {
            Some(job.source_fingerprint().await?)
        } else {
            None
        };

        self.transcoder
            .transcode(job, output, fingerprint)
            .await
            .with_context(|| format!("Failed to transcode {}", job.source_path.display()))?;

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(anyhow!("Encoder reported success but wrote no output: {}", output.display()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSettings;
    use crate::report::SilentReporter;
    use crate::test_support::{FakeTagReader, FakeTranscoder, PanickingTranscoder};
    use crate::fingerprint::TagReader;

    fn settings(options: Option<&str>, checksum: bool) -> JobSettings {
        JobSettings {
            transcode_formats: ["flac".to_string()].into_iter().collect(),
            target_format: "ogg".to_string(),
            encoder_options: options.map(|s| s.to_string()),
            checksum,
            force: false,
        }
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().to_string()).collect()
    }

    #[test]
    fn test_default_options_table() {
        assert_eq!(default_encoder_options("ogg"), Some("-vn -codec:a libvorbis -q:a 6"));
        assert!(default_encoder_options("mp3").unwrap().contains("libmp3lame"));
        assert_eq!(default_encoder_options("m4a"), default_encoder_options("aac"));
        assert!(default_encoder_options("opus").unwrap().contains("libopus"));
        assert_eq!(default_encoder_options("wma"), None);
    }

    #[test]
    fn test_command_uses_default_options() {
        let job = TransferJob::new(Path::new("/src"), Path::new("/dst"), Path::new("a/b.flac"), &settings(None, true));
        let args = strings(&FfmpegTranscoder::new("ffmpeg", "ogg").build_encode_command(&job, Path::new("/stage/a/b.ogg"), Some("abc")));

        assert_eq!(&args[..7], &["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i", "/src/a/b.flac"]);
        assert!(args.windows(2).any(|w| w == ["-codec:a", "libvorbis"]));
        assert!(args.windows(2).any(|w| w == ["-metadata", "mediamirror_fingerprint=abc"]));
        assert!(!args.contains(&"-movflags".to_string()));
        assert_eq!(args.last().unwrap(), "/stage/a/b.ogg");
    }

    #[test]
    fn test_command_uses_user_options_verbatim() {
        let job = TransferJob::new(
            Path::new("/src"),
            Path::new("/dst"),
            Path::new("b.flac"),
            &settings(Some("-codec:a libfdk_aac  -vbr 5"), false),
        );
        let args = strings(&FfmpegTranscoder::new("ffmpeg", "m4a").build_encode_command(&job, Path::new("/stage/b.m4a"), None));

        assert!(args.windows(4).any(|w| w == ["-codec:a", "libfdk_aac", "-vbr", "5"]));
        assert!(!args.contains(&"-metadata".to_string()));
        assert!(!args.contains(&"libvorbis".to_string()));
    }

    #[test]
    fn test_mp4_targets_keep_custom_tags() {
        let job = TransferJob::new(Path::new("/src"), Path::new("/dst"), Path::new("b.flac"), &settings(None, true));
        let args = strings(&FfmpegTranscoder::new("ffmpeg", "m4a").build_encode_command(&job, Path::new("/stage/b.m4a"), Some("ff")));
        assert!(args.windows(2).any(|w| w == ["-movflags", "use_metadata_tags"]));
    }

    #[tokio::test]
    async fn test_stage_passes_copy_only_jobs_through() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = Arc::new(FakeTranscoder::default());
        let stage = TranscodeStage::new(transcoder.clone(), Arc::new(SilentReporter), dir.path().join("stage"), false);
        let job = Arc::new(TransferJob::new(Path::new("/src"), Path::new("/dst"), Path::new("cover.jpg"), &settings(None, true)));

        let staged = stage.run(job).await.unwrap();
        assert!(!staged.transcoded);
        assert_eq!(staged.payload, PathBuf::from("/src/cover.jpg"));
        assert_eq!(transcoder.call_count(), 0);
        assert!(!dir.path().join("stage").exists());
    }

    #[tokio::test]
    async fn test_stage_writes_tagged_file_into_staging() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("album")).unwrap();
        std::fs::write(src.join("album/t.flac"), b"pcm").unwrap();
        let staging = dir.path().join("stage");

        let stage = TranscodeStage::new(Arc::new(FakeTranscoder::default()), Arc::new(SilentReporter), staging.clone(), false);
        let job = Arc::new(TransferJob::new(&src, &dir.path().join("dst"), Path::new("album/t.flac"), &settings(None, true)));

        let staged = stage.run(job.clone()).await.unwrap();
        assert!(staged.transcoded);
        assert_eq!(staged.payload, staging.join("album/t.flac.ogg"));

        let tag = FakeTagReader::default().read_fingerprint(&staged.payload).await.unwrap();
        assert_eq!(tag.as_deref(), job.cached_fingerprint());
        assert!(!dir.path().join("dst").exists());
    }

    #[tokio::test]
    async fn test_stage_failure_carries_source_and_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.flac"), b"pcm").unwrap();
        let staging = dir.path().join("stage");
        let stage = TranscodeStage::new(
            Arc::new(FakeTranscoder::failing_on(&["bad.flac"])),
            Arc::new(SilentReporter),
            staging.clone(),
            false,
        );
        let job = Arc::new(TransferJob::new(dir.path(), Path::new("/dst"), Path::new("bad.flac"), &settings(None, false)));

        let failure = stage.run(job).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Transcode);
        assert_eq!(failure.source_path, dir.path().join("bad.flac"));
        assert!(failure.detail.contains("simulated encoder failure"));
        assert!(!staging.join("bad.flac.ogg").exists());
    }

    #[tokio::test]
    async fn test_stage_converts_panic_into_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.flac"), b"pcm").unwrap();
        let stage = TranscodeStage::new(Arc::new(PanickingTranscoder), Arc::new(SilentReporter), dir.path().join("stage"), false);
        let job = Arc::new(TransferJob::new(dir.path(), Path::new("/dst"), Path::new("a.flac"), &settings(None, false)));

        let failure = stage.run_guarded(job).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Panic);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_encode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.flac"), b"pcm").unwrap();
        let transcoder = Arc::new(FakeTranscoder::default());
        let staging = dir.path().join("stage");
        let stage = TranscodeStage::new(transcoder.clone(), Arc::new(SilentReporter), staging.clone(), true);
        let job = Arc::new(TransferJob::new(dir.path(), Path::new("/dst"), Path::new("a.flac"), &settings(None, true)));

        let staged = stage.run(job).await.unwrap();
        assert!(staged.transcoded);
        assert_eq!(transcoder.call_count(), 0);
        assert!(!staging.exists());
    }
}
