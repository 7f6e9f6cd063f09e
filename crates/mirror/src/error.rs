use std::fmt;
use std::path::PathBuf;

use crate::job::TransferJob;

/// Errors that abort a run before any per-file work starts
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("target format `{0}` is also listed as a transcode format")]
    TargetIsTranscodeFormat(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("source directory does not exist: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("source is not a directory: {}", .0.display())]
    SourceNotDirectory(PathBuf),

    #[error("source {} and destination {} overlap", source_dir.display(), dest_dir.display())]
    OverlappingRoots {
        source_dir: PathBuf,
        dest_dir: PathBuf,
    },

    #[error("failed to resolve {}: {error}", path.display())]
    Resolve {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("failed to create staging directory in {}: {error}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
}

/// Stage at which a single file failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transcode,
    Transfer,
    /// A worker panicked while handling the job
    Panic,
    /// Another source file already maps to the same destination
    Conflict,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Transcode => "transcode",
            FailureKind::Transfer => "transfer",
            FailureKind::Panic => "worker",
            FailureKind::Conflict => "mapping",
        };
        f.write_str(name)
    }
}

/// Per-file failure, carried back across the worker boundary as data.
///
/// Never escalates past the run: it is recorded in the report and the
/// pipeline moves on to the next job.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} failed for {}: {detail}", source_path.display())]
pub struct JobFailure {
    pub kind: FailureKind,
    pub source_path: PathBuf,
    pub detail: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, job: &TransferJob, error: anyhow::Error) -> Self {
        Self {
            kind,
            source_path: job.source_path.clone(),
            detail: format!("{:#}", error),
        }
    }

    /// `job` lost its destination to `owner`, an earlier file in listing order
    pub fn conflict(job: &TransferJob, owner: &TransferJob) -> Self {
        Self {
            kind: FailureKind::Conflict,
            source_path: job.source_path.clone(),
            detail: format!(
                "{} is already produced from {}",
                job.dest_path.display(),
                owner.source_path.display()
            ),
        }
    }

    pub fn panicked(job: &TransferJob) -> Self {
        Self {
            kind: FailureKind::Panic,
            source_path: job.source_path.clone(),
            detail: "worker panicked".to_string(),
        }
    }
}
