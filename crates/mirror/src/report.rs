use std::fmt;
use std::path::Path;

use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};

use crate::error::JobFailure;
use crate::job::TransferJob;

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Scanning,
    StalenessCheck,
    /// Encoding, copying and placing files. The transcode pool and the
    /// transfer consumer overlap, so one phase covers both.
    Transferring,
    Cleanup,
    Finished,
    FinishedWithErrors,
    Canceled,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Setup => "setup",
            Phase::Scanning => "scanning",
            Phase::StalenessCheck => "staleness check",
            Phase::Transferring => "transcode and transfer",
            Phase::Cleanup => "cleanup",
            Phase::Finished => "finished",
            Phase::FinishedWithErrors => "finished with errors",
            Phase::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Finished,
    FinishedWithErrors,
    Canceled,
}

impl RunStatus {
    pub fn phase(self) -> Phase {
        match self {
            RunStatus::Finished => Phase::Finished,
            RunStatus::FinishedWithErrors => Phase::FinishedWithErrors,
            RunStatus::Canceled => Phase::Canceled,
        }
    }
}

/// Totals and failures of one run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub scanned: usize,
    pub stale: usize,
    pub transcoded: usize,
    pub transferred: usize,
    pub deleted: usize,
    pub bytes_transferred: u64,
    pub failures: Vec<JobFailure>,
    pub canceled: bool,
    pub dry_run: bool,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.canceled {
            RunStatus::Canceled
        } else if !self.failures.is_empty() {
            RunStatus::FinishedWithErrors
        } else {
            RunStatus::Finished
        }
    }

    /// Process exit code: 0 clean, 1 per-file failures, 130 canceled
    pub fn exit_code(&self) -> i32 {
        match self.status() {
            RunStatus::Finished => 0,
            RunStatus::FinishedWithErrors => 1,
            RunStatus::Canceled => 130,
        }
    }

    pub fn failed_paths(&self) -> Vec<&Path> {
        self.failures.iter().map(|f| f.source_path.as_path()).collect()
    }

    pub fn summary(&self) -> String {
        let prefix = if self.dry_run { "[dry run] " } else { "" };
        format!(
            "{}{} files scanned, {} stale, {} transcoded, {} transferred ({}), {} deleted, {} failed",
            prefix,
            self.scanned,
            self.stale,
            self.transcoded,
            self.transferred,
            format_size(self.bytes_transferred, DECIMAL),
            self.deleted,
            self.failures.len()
        )
    }
}

/// Something worth telling the user about
#[derive(Debug)]
pub enum Event<'a> {
    Phase(Phase),
    Scanned { total: usize, stale: usize, transcodes: usize },
    Transcoding(&'a TransferJob),
    Transferring { job: &'a TransferJob, transcoded: bool },
    Failed(&'a JobFailure),
    Deleting(&'a Path),
    Finished(&'a RunReport),
}

/// Receives progress events from a run
pub trait Reporter: Send + Sync {
    fn report(&self, event: &Event<'_>);
}

/// Output detail of [`LogReporter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

/// Reporter that renders events through the `log` macros
#[derive(Debug, Clone)]
pub struct LogReporter {
    verbosity: Verbosity,
    dry_run: bool,
}

impl LogReporter {
    pub fn new(verbosity: Verbosity, dry_run: bool) -> Self {
        Self { verbosity, dry_run }
    }

    fn prefix(&self) -> &'static str {
        if self.dry_run {
            "[dry run] "
        } else {
            ""
        }
    }
}

impl Reporter for LogReporter {
    fn report(&self, event: &Event<'_>) {
        let chatty = self.verbosity >= Verbosity::Normal;
        match event {
            Event::Phase(phase) => debug!("Entering {}", phase),
            Event::Scanned { total, stale, transcodes } => {
                if chatty {
                    info!("Found {} files, {} need updating ({} to transcode)", total, stale, transcodes);
                }
            }
            Event::Transcoding(job) => {
                if self.verbosity >= Verbosity::Verbose {
                    info!("{}Transcoding {}", self.prefix(), job.source_path.display());
                }
            }
            Event::Transferring { job, transcoded } => {
                if chatty {
                    let verb = if *transcoded { "Transcoded" } else { "Copying" };
                    info!("{}{} {} -> {}", self.prefix(), verb, job.relative_path.display(), job.dest_path.display());
                }
            }
            Event::Failed(failure) => error!("{}", failure),
            Event::Deleting(path) => {
                if chatty {
                    info!("{}Deleting {}", self.prefix(), path.display());
                }
            }
            Event::Finished(report) => match report.status() {
                RunStatus::Finished => {
                    if chatty {
                        info!("{}", report.summary());
                    }
                }
                RunStatus::FinishedWithErrors => {
                    warn!("{}", report.summary());
                    for path in report.failed_paths() {
                        warn!("  failed: {}", path.display());
                    }
                }
                RunStatus::Canceled => {
                    warn!("Canceled. {}", report.summary());
                    for path in report.failed_paths() {
                        warn!("  failed: {}", path.display());
                    }
                }
            },
        }
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentReporter;

impl Reporter for SilentReporter {
    fn report(&self, _event: &Event<'_>) {}
}
