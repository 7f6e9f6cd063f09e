use std::ffi::OsString;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{FailureKind, JobFailure};
use crate::job::StagedJob;

const PARTIAL_SUFFIX: &str = "mediamirror-partial";

/// Copies one file's bytes to a new path
#[async_trait]
pub trait Copier: Send + Sync {
    async fn copy(&self, from: &Path, to: &Path) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Copier backed by the rsync CLI
#[derive(Debug, Clone)]
pub struct RsyncCopier {
    rsync_bin: PathBuf,
}

impl RsyncCopier {
    pub fn new(rsync_bin: impl Into<PathBuf>) -> Self {
        Self { rsync_bin: rsync_bin.into() }
    }
}

#[async_trait]
impl Copier for RsyncCopier {
    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let output = Command::new(&self.rsync_bin)
            .arg("--inplace")
            .arg("--times")
            .arg(from)
            .arg(to)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute rsync at: {}", self.rsync_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!(
                "rsync failed (exit code {}):\nSTDERR: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rsync"
    }
}

/// Streamed copy that keeps the payload's modification time
#[derive(Debug, Clone, Default)]
pub struct PlainCopier;

#[async_trait]
impl Copier for PlainCopier {
    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let mut reader = tokio::fs::File::open(from)
            .await
            .with_context(|| format!("Failed to open {}", from.display()))?;
        let modified = reader.metadata().await?.modified()?;
        let mut writer = tokio::fs::File::create(to)
            .await
            .with_context(|| format!("Failed to create {}", to.display()))?;

        tokio::io::copy(&mut reader, &mut writer)
            .await
            .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
        writer.flush().await?;

        let file = writer.into_std().await;
        tokio::task::spawn_blocking(move || file.set_modified(modified))
            .await
            .context("Failed to set modification time")??;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "copy"
    }
}

/// Pick rsync when allowed and available, plain copy otherwise
pub fn select_copier(rsync_bin: Option<&Path>, use_rsync: bool) -> Arc<dyn Copier> {
    if !use_rsync {
        return Arc::new(PlainCopier);
    }

    let found = match rsync_bin {
        Some(bin) => which::which(bin).ok(),
        None => which::which("rsync").ok(),
    };

    match found {
        Some(path) => {
            debug!("Using rsync at {}", path.display());
            Arc::new(RsyncCopier::new(path))
        }
        None => {
            if let Some(bin) = rsync_bin {
                warn!("rsync not found at {}, falling back to plain copy", bin.display());
            }
            Arc::new(PlainCopier)
        }
    }
}

/// Name under which a destination file is written before being renamed into place
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(dest.file_name().unwrap_or_default());
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}

/// The single destination file currently being written.
///
/// Anything still registered when the handle is discarded or dropped is an
/// incomplete write and gets removed.
#[derive(Debug, Default)]
pub struct InFlight {
    path: Option<PathBuf>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn begin(&mut self, path: PathBuf) {
        self.discard();
        self.path = Some(path);
    }

    fn finish(&mut self) {
        self.path = None;
    }

    /// Remove the registered partial file, if any
    pub fn discard(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed incomplete file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove incomplete file {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.discard();
    }
}

/// Second pipeline stage: places a staged payload at the job's destination
pub struct Transferer {
    copier: Arc<dyn Copier>,
    dry_run: bool,
}

impl Transferer {
    pub fn new(copier: Arc<dyn Copier>, dry_run: bool) -> Self {
        Self { copier, dry_run }
    }

    /// Copy to a hidden partial name beside the destination, then rename over
    /// it, so the final name never shows a half-written file.
    ///
    /// Returns the number of bytes placed.
    pub async fn transfer(&self, staged: &StagedJob, in_flight: &mut InFlight) -> Result<u64, JobFailure> {
        if self.dry_run {
            return Ok(0);
        }

        match self.place(staged, in_flight).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                in_flight.discard();
                Err(JobFailure::new(FailureKind::Transfer, &staged.job, e))
            }
        }
    }

    /// [`transfer`](Self::transfer), with a panicking copier turned into a
    /// failure record and its partial file removed
    pub async fn transfer_guarded(&self, staged: &StagedJob, in_flight: &mut InFlight) -> Result<u64, JobFailure> {
        let result = AssertUnwindSafe(self.transfer(staged, in_flight)).catch_unwind().await;
        match result {
            Ok(result) => result,
            Err(_) => {
                in_flight.discard();
                Err(JobFailure::panicked(&staged.job))
            }
        }
    }

    async fn place(&self, staged: &StagedJob, in_flight: &mut InFlight) -> Result<u64> {
        let dest = &staged.job.dest_path;
        let partial = partial_path(dest);
        in_flight.begin(partial.clone());

        self.copier
            .copy(&staged.payload, &partial)
            .await
            .with_context(|| format!("Failed to copy {} with {}", staged.payload.display(), self.copier.name()))?;

        let bytes = tokio::fs::metadata(&partial).await?.len();
        tokio::fs::rename(&partial, dest)
            .await
            .with_context(|| format!("Failed to move {} into place", dest.display()))?;
        in_flight.finish();

        Ok(bytes)
    }
}
