pub mod config;
pub mod error;
pub mod ffprobe;
pub mod fingerprint;
pub mod job;
pub mod pipeline;
pub mod report;
pub mod scan;
pub mod staleness;
pub mod transcode;
pub mod transfer;

#[cfg(test)]
mod test_support;

pub use config::MirrorConfig;
pub use error::{FailureKind, JobFailure, SetupError};
pub use job::{StagedJob, TransferJob};
pub use pipeline::Mirror;
pub use report::{Event, LogReporter, Phase, Reporter, RunReport, RunStatus, SilentReporter, Verbosity};
