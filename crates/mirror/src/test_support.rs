//! Fakes standing in for ffmpeg, ffprobe and rsync in unit tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::MirrorConfig;
use crate::fingerprint::TagReader;
use crate::job::TransferJob;
use crate::transcode::Transcoder;
use crate::transfer::Copier;

const TAG_PREFIX: &[u8] = b"FAKETAG:";

pub fn set_mtime(path: &Path, time: SystemTime) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}

pub fn write_file(root: &Path, rel: &str, content: &[u8]) -> PathBuf {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    path
}

/// Every file below `root` with its content
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    if !root.exists() {
        return BTreeMap::new();
    }
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let content = std::fs::read(e.path()).unwrap();
            (e.path().strip_prefix(root).unwrap().to_path_buf(), content)
        })
        .collect()
}

pub fn test_config(src: &Path, dst: &Path, temp: &Path) -> MirrorConfig {
    MirrorConfig {
        source_dir: src.to_path_buf(),
        dest_dir: dst.to_path_buf(),
        temp_dir: Some(temp.to_path_buf()),
        use_rsync: false,
        jobs: 2,
        check_jobs: 2,
        ..MirrorConfig::default_config()
    }
}

/// Reads a fingerprint from the first line of a file written by [`FakeTranscoder`]
#[derive(Debug, Default)]
pub struct FakeTagReader {
    pub reads: AtomicUsize,
}

impl FakeTagReader {
    pub fn tagged(fingerprint: &str, body: &[u8]) -> Vec<u8> {
        let mut out = TAG_PREFIX.to_vec();
        out.extend_from_slice(fingerprint.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(body);
        out
    }
}

#[async_trait]
impl TagReader for FakeTagReader {
    async fn read_fingerprint(&self, path: &Path) -> Result<Option<String>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let content = tokio::fs::read(path).await?;
        let Some(rest) = content.strip_prefix(TAG_PREFIX) else {
            return Ok(None);
        };
        let line = rest.split(|b| *b == b'\n').next().unwrap_or_default();
        Ok(Some(String::from_utf8_lossy(line).to_string()))
    }
}

/// Writes `encoded:<source bytes>`, prefixed with the fingerprint tag.
///
/// Fails for sources whose file name is listed in `fail_on`, and parks
/// forever on `block_on` after notifying `started`.
#[derive(Debug, Default)]
pub struct FakeTranscoder {
    fail_on: Vec<String>,
    block_on: Option<String>,
    pub started: Arc<Notify>,
    calls: AtomicUsize,
}

impl FakeTranscoder {
    pub fn failing_on(names: &[&str]) -> Self {
        Self {
            fail_on: names.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn blocking_on(name: &str) -> Self {
        Self {
            block_on: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(&self, job: &TransferJob, output: &Path, fingerprint: Option<&str>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = job.source_path.file_name().unwrap().to_string_lossy().to_string();

        if self.block_on.as_deref() == Some(name.as_str()) {
            tokio::fs::write(output, b"partial encode").await?;
            self.started.notify_one();
            std::future::pending::<()>().await;
        }
        if self.fail_on.contains(&name) {
            return Err(anyhow!("simulated encoder failure for {}", name));
        }

        let mut body = b"encoded:".to_vec();
        body.extend(tokio::fs::read(&job.source_path).await?);
        let content = match fingerprint {
            Some(fp) => FakeTagReader::tagged(fp, &body),
            None => body,
        };
        tokio::fs::write(output, content).await?;
        Ok(())
    }
}

pub struct PanickingTranscoder;

#[async_trait]
impl Transcoder for PanickingTranscoder {
    async fn transcode(&self, _job: &TransferJob, _output: &Path, _fingerprint: Option<&str>) -> Result<()> {
        panic!("encoder blew up");
    }
}

pub struct FailingCopier;

#[async_trait]
impl Copier for FailingCopier {
    async fn copy(&self, _from: &Path, to: &Path) -> Result<()> {
        tokio::fs::write(to, b"half").await?;
        Err(anyhow!("disk full"))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Writes a partial file, then panics
pub struct PanickingCopier;

#[async_trait]
impl Copier for PanickingCopier {
    async fn copy(&self, _from: &Path, to: &Path) -> Result<()> {
        tokio::fs::write(to, b"half").await?;
        panic!("copier blew up");
    }

    fn name(&self) -> &'static str {
        "panicking"
    }
}

/// Writes half of the payload, notifies `started`, then never finishes
#[derive(Debug, Default)]
pub struct StallingCopier {
    pub started: Arc<Notify>,
}

#[async_trait]
impl Copier for StallingCopier {
    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let content = tokio::fs::read(from).await?;
        tokio::fs::write(to, &content[..content.len() / 2]).await?;
        self.started.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stalling"
    }
}
