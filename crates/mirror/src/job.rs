use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::OnceCell;

use crate::config::{normalize_extension, MirrorConfig};
use crate::fingerprint;

/// Settings shared by every job of a run, derived once from the config
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub transcode_formats: HashSet<String>,
    pub target_format: String,
    pub encoder_options: Option<String>,
    pub checksum: bool,
    pub force: bool,
}

impl JobSettings {
    pub fn from_config(cfg: &MirrorConfig) -> Self {
        Self {
            transcode_formats: cfg
                .transcode_formats
                .iter()
                .map(|f| normalize_extension(f))
                .filter(|f| !f.is_empty())
                .collect(),
            target_format: normalize_extension(&cfg.target_format),
            encoder_options: cfg.encoder_options.clone(),
            checksum: cfg.checksum,
            force: cfg.force,
        }
    }

    fn wants_transcode(&self, relative: &Path) -> bool {
        relative
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.transcode_formats.contains(&e.to_lowercase()))
            .unwrap_or(false)
    }
}

/// One source file's trip into the destination tree.
///
/// The paths and flags are fixed at construction. The staleness verdict and
/// the source fingerprint are computed lazily and cached, so every stage that
/// consults them sees the same answer and the hash is read at most once.
#[derive(Debug)]
pub struct TransferJob {
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    /// Source path relative to the source root
    pub relative_path: PathBuf,
    pub needs_transcode: bool,
    pub encoder_options: Option<String>,
    pub checksum_mode: bool,
    pub force: bool,
    stale: OnceCell<bool>,
    fingerprint: OnceCell<String>,
}

impl TransferJob {
    /// Build the job for `relative` (a path under the source root)
    pub fn new(source_root: &Path, dest_root: &Path, relative: &Path, settings: &JobSettings) -> Self {
        let needs_transcode = settings.wants_transcode(relative);
        let dest_relative = dest_relative_path(relative, needs_transcode, &settings.target_format);

        Self {
            source_path: source_root.join(relative),
            dest_path: dest_root.join(dest_relative),
            relative_path: relative.to_path_buf(),
            needs_transcode,
            encoder_options: settings.encoder_options.clone(),
            checksum_mode: settings.checksum,
            force: settings.force,
            stale: OnceCell::new(),
            fingerprint: OnceCell::new(),
        }
    }

    /// Cached staleness verdict, `None` until the oracle has run
    pub fn stale_verdict(&self) -> Option<bool> {
        self.stale.get().copied()
    }

    pub(crate) fn stale_cell(&self) -> &OnceCell<bool> {
        &self.stale
    }

    pub fn cached_fingerprint(&self) -> Option<&str> {
        self.fingerprint.get().map(|s| s.as_str())
    }

    /// Fingerprint of the source content, hashed on first use
    pub async fn source_fingerprint(&self) -> Result<&str> {
        let fp = self
            .fingerprint
            .get_or_try_init(|| fingerprint::source_fingerprint(&self.source_path))
            .await?;
        Ok(fp.as_str())
    }

    /// Where the transcode stage writes this job's output inside `staging_root`.
    ///
    /// The full relative source name is kept and the target extension
    /// appended, so `a.flac` and `a.wav` never share a staged file.
    pub fn staging_path(&self, staging_root: &Path) -> PathBuf {
        let mut name = self.relative_path.clone().into_os_string();
        if let Some(ext) = self.dest_path.extension() {
            name.push(".");
            name.push(ext);
        }
        staging_root.join(name)
    }
}

fn dest_relative_path(relative: &Path, needs_transcode: bool, target_format: &str) -> PathBuf {
    if needs_transcode {
        relative.with_extension(target_format)
    } else {
        relative.to_path_buf()
    }
}

/// A job plus the bytes that should land at its destination.
///
/// `payload` is the staged transcode output, or the source itself for
/// copy-only jobs.
#[derive(Debug, Clone)]
pub struct StagedJob {
    pub job: Arc<TransferJob>,
    pub payload: PathBuf,
    pub transcoded: bool,
}

impl StagedJob {
    pub fn passthrough(job: Arc<TransferJob>) -> Self {
        let payload = job.source_path.clone();
        Self { job, payload, transcoded: false }
    }

    pub fn transcoded(job: Arc<TransferJob>, payload: PathBuf) -> Self {
        Self { job, payload, transcoded: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn settings(formats: &[&str], target: &str) -> JobSettings {
        JobSettings {
            transcode_formats: formats.iter().map(|s| s.to_string()).collect(),
            target_format: target.to_string(),
            encoder_options: None,
            checksum: true,
            force: false,
        }
    }

    fn extension() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("flac".to_string()),
            Just("FLAC".to_string()),
            Just("wav".to_string()),
            Just("mp3".to_string()),
            Just("jpg".to_string()),
            Just("txt".to_string()),
        ]
    }

    fn target_format() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("ogg".to_string()),
            Just("mp3".to_string()),
            Just("opus".to_string()),
            Just("m4a".to_string()),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_dest_extension_follows_transcode_decision(
            dirs in proptest::collection::vec("[a-z]{1,6}", 0..3),
            stem in "[a-z][a-z0-9 ._-]{0,10}",
            ext in extension(),
            target in target_format(),
        ) {
            let cfg = settings(&["flac", "wav"], &target);
            let mut relative = PathBuf::new();
            for d in &dirs {
                relative.push(d);
            }
            relative.push(format!("{}.{}", stem, ext));

            let job = TransferJob::new(Path::new("/src"), Path::new("/dst"), &relative, &cfg);
            let dest_ext = job.dest_path.extension().and_then(|e| e.to_str()).unwrap().to_string();

            if job.needs_transcode {
                prop_assert_eq!(dest_ext, target);
            } else {
                prop_assert_eq!(dest_ext, ext.clone());
            }
            prop_assert_eq!(job.needs_transcode, ext.eq_ignore_ascii_case("flac") || ext == "wav");
            prop_assert_eq!(
                job.dest_path.parent().unwrap(),
                Path::new("/dst").join(relative.parent().unwrap())
            );
            prop_assert_eq!(job.source_path, Path::new("/src").join(&relative));
        }
    }

    #[test]
    fn test_file_without_extension_is_copied() {
        let job = TransferJob::new(
            Path::new("/src"),
            Path::new("/dst"),
            Path::new("artist/README"),
            &settings(&["flac"], "ogg"),
        );
        assert!(!job.needs_transcode);
        assert_eq!(job.dest_path, PathBuf::from("/dst/artist/README"));
    }

    #[test]
    fn test_staging_path_mirrors_relative_path() {
        let job = TransferJob::new(
            Path::new("/src"),
            Path::new("/dst"),
            Path::new("artist/album/01 track.flac"),
            &settings(&["flac"], "ogg"),
        );
        assert_eq!(
            job.staging_path(Path::new("/tmp/stage")),
            PathBuf::from("/tmp/stage/artist/album/01 track.flac.ogg")
        );
    }

    #[test]
    fn test_same_stem_sources_stage_apart() {
        let cfg = settings(&["flac", "wav"], "ogg");
        let flac = TransferJob::new(Path::new("/src"), Path::new("/dst"), Path::new("album/a.flac"), &cfg);
        let wav = TransferJob::new(Path::new("/src"), Path::new("/dst"), Path::new("album/a.wav"), &cfg);

        assert_eq!(flac.dest_path, wav.dest_path);
        let stage = Path::new("/tmp/stage");
        assert_eq!(flac.staging_path(stage), PathBuf::from("/tmp/stage/album/a.flac.ogg"));
        assert_ne!(flac.staging_path(stage), wav.staging_path(stage));
    }

    #[test]
    fn test_settings_normalize_unnormalized_config() {
        let cfg = MirrorConfig {
            transcode_formats: vec![".FLAC".to_string(), " wav".to_string()],
            target_format: ".MP3".to_string(),
            ..MirrorConfig::default_config()
        };
        let settings = JobSettings::from_config(&cfg);
        assert_eq!(settings.target_format, "mp3");
        assert!(settings.transcode_formats.contains("flac"));
        assert!(settings.transcode_formats.contains("wav"));

        let job = TransferJob::new(Path::new("/src"), Path::new("/dst"), Path::new("a.Flac"), &settings);
        assert_eq!(job.dest_path, PathBuf::from("/dst/a.mp3"));
    }

    #[tokio::test]
    async fn test_fingerprint_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.flac"), b"first").unwrap();
        let job = TransferJob::new(dir.path(), Path::new("/dst"), Path::new("a.flac"), &settings(&["flac"], "ogg"));

        assert!(job.cached_fingerprint().is_none());
        let first = job.source_fingerprint().await.unwrap().to_string();

        // a rewrite after the first hash is not observed
        std::fs::write(dir.path().join("a.flac"), b"second").unwrap();
        assert_eq!(job.source_fingerprint().await.unwrap(), first);
        assert_eq!(job.cached_fingerprint(), Some(first.as_str()));
    }
}
