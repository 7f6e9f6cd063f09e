use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{debug, warn};

use crate::fingerprint::TagReader;
use crate::job::TransferJob;

/// Decides whether a job's destination must be (re)produced
pub struct StalenessOracle {
    tags: Arc<dyn TagReader>,
}

impl StalenessOracle {
    pub fn new(tags: Arc<dyn TagReader>) -> Self {
        Self { tags }
    }

    /// Cached verdict for `job`, computed on first call.
    ///
    /// `force` short-circuits to stale without running the check.
    pub async fn is_stale(&self, job: &TransferJob) -> bool {
        if job.force {
            return true;
        }
        *job.stale_cell().get_or_init(|| self.check(job)).await
    }

    /// Run the check over every job with at most `concurrency` in flight and
    /// return the stale ones in listing order
    pub async fn prefetch(&self, jobs: Vec<Arc<TransferJob>>, concurrency: usize) -> Vec<Arc<TransferJob>> {
        stream::iter(jobs)
            .map(|job| async move {
                let stale = self.is_stale(&job).await;
                (job, stale)
            })
            .buffered(concurrency.max(1))
            .filter_map(|(job, stale)| async move {
                if stale {
                    Some(job)
                } else {
                    debug!("Up to date: {}", job.dest_path.display());
                    None
                }
            })
            .collect()
            .await
    }

    async fn check(&self, job: &TransferJob) -> bool {
        // Only transcoded files carry an embedded fingerprint
        if job.checksum_mode && job.needs_transcode {
            self.check_fingerprint(job).await
        } else {
            check_mtime(job).await
        }
    }

    async fn check_fingerprint(&self, job: &TransferJob) -> bool {
        let dest_tag = if tokio::fs::try_exists(&job.dest_path).await.unwrap_or(false) {
            match self.tags.read_fingerprint(&job.dest_path).await {
                Ok(tag) => tag,
                Err(e) => {
                    debug!("Could not read fingerprint from {}: {:#}", job.dest_path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        // Hashed even when the tag is missing so the transcode can embed it
        let source = match job.source_fingerprint().await {
            Ok(fp) => fp,
            Err(e) => {
                warn!("Failed to fingerprint {}: {:#}", job.source_path.display(), e);
                return true;
            }
        };

        match dest_tag {
            Some(tag) => !tag.eq_ignore_ascii_case(source),
            None => true,
        }
    }
}

/// Up to date iff the destination exists and is no older than the source
async fn check_mtime(job: &TransferJob) -> bool {
    let dest_meta = match tokio::fs::metadata(&job.dest_path).await {
        Ok(m) => m,
        Err(_) => return true,
    };
    let source_meta = match tokio::fs::metadata(&job.source_path).await {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to stat {}: {}", job.source_path.display(), e);
            return true;
        }
    };

    match (dest_meta.modified(), source_meta.modified()) {
        (Ok(dest), Ok(source)) => dest < source,
        _ => true,
    }
}
