use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::MirrorConfig;
use crate::error::{JobFailure, SetupError};
use crate::ffprobe::FfprobeTagReader;
use crate::fingerprint::TagReader;
use crate::job::{StagedJob, TransferJob};
use crate::report::{Event, Phase, Reporter, RunReport};
use crate::scan::JobFinder;
use crate::staleness::StalenessOracle;
use crate::transcode::{FfmpegTranscoder, TranscodeStage, Transcoder};
use crate::transfer::{select_copier, Copier, InFlight, Transferer};

type StageResult = Result<StagedJob, JobFailure>;

/// Private scratch directory for fresh transcodes, owned by one run
struct Staging {
    dir: Option<TempDir>,
    root: PathBuf,
}

impl Staging {
    fn create(config: &MirrorConfig) -> Result<Self, SetupError> {
        let base = config.temp_dir.clone().unwrap_or_else(std::env::temp_dir);

        // Dry runs only need staged names for reporting
        if config.dry_run {
            return Ok(Self { dir: None, root: base.join("mediamirror-dry-run") });
        }

        let dir = tempfile::Builder::new()
            .prefix("mediamirror-")
            .tempdir_in(&base)
            .map_err(|error| SetupError::Staging { path: base.clone(), error })?;
        debug!("Staging transcodes in {}", dir.path().display());

        Ok(Self { root: dir.path().to_path_buf(), dir: Some(dir) })
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn close(self) {
        if let Some(dir) = self.dir {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!("Removed staging directory {}", path.display()),
                Err(e) => warn!("Failed to remove staging directory {}: {}", path.display(), e),
            }
        }
    }
}

/// Mirrors a source tree into a destination tree, transcoding on the way
pub struct Mirror {
    config: MirrorConfig,
    transcoder: Arc<dyn Transcoder>,
    copier: Arc<dyn Copier>,
    oracle: StalenessOracle,
    reporter: Arc<dyn Reporter>,
}

impl Mirror {
    pub fn new(
        config: MirrorConfig,
        transcoder: Arc<dyn Transcoder>,
        copier: Arc<dyn Copier>,
        tags: Arc<dyn TagReader>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            config,
            transcoder,
            copier,
            oracle: StalenessOracle::new(tags),
            reporter,
        }
    }

    /// Wire up ffmpeg, ffprobe and rsync (or plain copy) from the config
    pub fn from_config(config: MirrorConfig, reporter: Arc<dyn Reporter>) -> Self {
        let transcoder = Arc::new(FfmpegTranscoder::new(&config.ffmpeg_bin, &config.target_format));
        let copier = select_copier(config.rsync_bin.as_deref(), config.use_rsync);
        let tags = Arc::new(FfprobeTagReader::new(&config.ffprobe_bin));
        Self::new(config, transcoder, copier, tags, reporter)
    }

    /// Run one mirror pass.
    ///
    /// Only setup problems are returned as errors. Per-file failures and
    /// cancellation end up in the [`RunReport`].
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, SetupError> {
        self.enter(Phase::Setup);
        self.config.validate()?;
        let finder = JobFinder::new(&self.config)?;
        let staging = Staging::create(&self.config)?;
        info!(
            "Mirroring {} -> {} (transfers via {})",
            finder.source_root().display(),
            finder.dest_root().display(),
            self.copier.name()
        );

        let mut report = RunReport {
            dry_run: self.config.dry_run,
            ..Default::default()
        };

        self.enter(Phase::Scanning);
        let jobs: Vec<Arc<TransferJob>> = finder.jobs().map(Arc::new).collect();
        report.scanned = jobs.len();
        let known: HashSet<PathBuf> = if self.config.delete_extraneous {
            jobs.iter().map(|j| j.dest_path.clone()).collect()
        } else {
            HashSet::new()
        };

        let (jobs, conflicts) = split_conflicts(jobs);
        for failure in conflicts {
            self.record_failure(failure, &mut report);
        }

        let mut in_flight = InFlight::new();
        if cancel.is_cancelled() {
            report.canceled = true;
        } else {
            self.process(jobs, staging.root(), &cancel, &mut in_flight, &mut report).await;
        }

        self.enter(Phase::Cleanup);
        in_flight.discard();
        staging.close();

        if self.config.delete_extraneous && !report.canceled {
            self.delete_extraneous(&finder, &known, &cancel, &mut report).await;
        }

        self.enter(report.status().phase());
        self.reporter.report(&Event::Finished(&report));
        Ok(report)
    }

    fn enter(&self, phase: Phase) {
        self.reporter.report(&Event::Phase(phase));
    }

    async fn process(
        &self,
        jobs: Vec<Arc<TransferJob>>,
        staging_root: &Path,
        cancel: &CancellationToken,
        in_flight: &mut InFlight,
        report: &mut RunReport,
    ) {
        self.enter(Phase::StalenessCheck);
        let stale = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                report.canceled = true;
                return;
            }
            stale = self.oracle.prefetch(jobs, self.config.check_jobs) => stale,
        };

        let transcodes = stale.iter().filter(|j| j.needs_transcode).count();
        report.stale = stale.len();
        self.reporter.report(&Event::Scanned {
            total: report.scanned,
            stale: report.stale,
            transcodes,
        });
        if stale.is_empty() {
            return;
        }

        self.create_dest_dirs(&stale).await;

        self.enter(Phase::Transferring);
        let stage = Arc::new(TranscodeStage::new(
            self.transcoder.clone(),
            self.reporter.clone(),
            staging_root.to_path_buf(),
            self.config.dry_run,
        ));
        let transferer = Transferer::new(self.copier.clone(), self.config.dry_run);

        let workers = if transcodes == 0 { 0 } else { self.config.jobs };
        if workers == 0 {
            debug!("Running {} jobs sequentially", stale.len());
            self.run_sequential(stale, &stage, &transferer, cancel, in_flight, report).await;
        } else {
            debug!("Running {} transcodes on {} workers", transcodes, workers);
            self.run_pooled(stale, stage, workers, &transferer, cancel, in_flight, report).await;
        }
    }

    /// Transcode and transfer one job at a time, in listing order
    async fn run_sequential(
        &self,
        stale: Vec<Arc<TransferJob>>,
        stage: &TranscodeStage,
        transferer: &Transferer,
        cancel: &CancellationToken,
        in_flight: &mut InFlight,
        report: &mut RunReport,
    ) {
        for job in stale {
            let staged = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.canceled = true;
                    return;
                }
                staged = stage.run_guarded(job) => staged,
            };
            self.deliver(staged, transferer, cancel, in_flight, report).await;
            if report.canceled {
                return;
            }
        }
    }

    /// Copy-only jobs are transferred straight away while the worker pool
    /// encodes; encoded results are then transferred in completion order.
    #[allow(clippy::too_many_arguments)]
    async fn run_pooled(
        &self,
        stale: Vec<Arc<TransferJob>>,
        stage: Arc<TranscodeStage>,
        workers: usize,
        transferer: &Transferer,
        cancel: &CancellationToken,
        in_flight: &mut InFlight,
        report: &mut RunReport,
    ) {
        let (transcodes, copies): (Vec<_>, Vec<_>) = stale.into_iter().partition(|j| j.needs_transcode);
        let (tx, mut rx) = mpsc::channel(workers);
        let feeder = spawn_feeder(stage, transcodes, workers, cancel.clone(), tx);

        for job in copies {
            self.deliver(Ok(StagedJob::passthrough(job)), transferer, cancel, in_flight, report).await;
            if report.canceled {
                break;
            }
        }

        while !report.canceled {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.canceled = true;
                    break;
                }
                next = rx.recv() => next,
            };
            match next {
                Some(staged) => self.deliver(staged, transferer, cancel, in_flight, report).await,
                None => break,
            }
        }

        drop(rx);
        if let Err(e) = feeder.await {
            error!("Transcode pool terminated abnormally: {}", e);
        }
    }

    /// Transfer one stage result, or record its failure
    async fn deliver(
        &self,
        staged: StageResult,
        transferer: &Transferer,
        cancel: &CancellationToken,
        in_flight: &mut InFlight,
        report: &mut RunReport,
    ) {
        let staged = match staged {
            Ok(staged) => staged,
            Err(failure) => return self.record_failure(failure, report),
        };
        if staged.transcoded {
            report.transcoded += 1;
        }

        self.reporter.report(&Event::Transferring {
            job: staged.job.as_ref(),
            transcoded: staged.transcoded,
        });
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                report.canceled = true;
                return;
            }
            result = transferer.transfer_guarded(&staged, in_flight) => result,
        };

        match result {
            Ok(bytes) => {
                report.transferred += 1;
                report.bytes_transferred += bytes;
            }
            Err(failure) => self.record_failure(failure, report),
        }
        self.discard_payload(&staged).await;
    }

    /// Create every destination directory the stale jobs need before any
    /// transfer starts. A directory that cannot be created surfaces later as
    /// a transfer failure of the jobs inside it.
    async fn create_dest_dirs(&self, stale: &[Arc<TransferJob>]) {
        if self.config.dry_run {
            return;
        }
        let parents: BTreeSet<&Path> = stale.iter().filter_map(|j| j.dest_path.parent()).collect();
        for dir in parents {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!("Failed to create destination directory {}: {}", dir.display(), e);
            }
        }
    }

    /// Staged encodes are removed as soon as they have been placed
    async fn discard_payload(&self, staged: &StagedJob) {
        if !staged.transcoded || self.config.dry_run {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(&staged.payload).await {
            debug!("Failed to remove staged file {}: {}", staged.payload.display(), e);
        }
    }

    fn record_failure(&self, failure: JobFailure, report: &mut RunReport) {
        self.reporter.report(&Event::Failed(&failure));
        report.failures.push(failure);
    }

    async fn delete_extraneous(
        &self,
        finder: &JobFinder,
        known: &HashSet<PathBuf>,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) {
        for path in finder.extraneous(known) {
            if cancel.is_cancelled() {
                report.canceled = true;
                return;
            }
            self.reporter.report(&Event::Deleting(&path));
            if self.config.dry_run {
                report.deleted += 1;
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.deleted += 1,
                Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
            }
        }

        if !self.config.dry_run {
            let pruned = finder.prune_empty_dirs();
            if pruned > 0 {
                debug!("Pruned {} empty directories", pruned);
            }
        }
    }
}

/// Keep the first job, in listing order, for every destination path. Later
/// jobs mapping onto the same file come back as conflicts.
fn split_conflicts(jobs: Vec<Arc<TransferJob>>) -> (Vec<Arc<TransferJob>>, Vec<JobFailure>) {
    let mut owners: HashMap<PathBuf, Arc<TransferJob>> = HashMap::new();
    let mut kept = Vec::with_capacity(jobs.len());
    let mut conflicts = Vec::new();

    for job in jobs {
        match owners.get(&job.dest_path) {
            Some(owner) => conflicts.push(JobFailure::conflict(&job, owner)),
            None => {
                owners.insert(job.dest_path.clone(), job.clone());
                kept.push(job);
            }
        }
    }
    (kept, conflicts)
}

/// Feed transcode jobs to at most `workers` concurrent encodes.
///
/// Results go out over `tx` as they complete. On cancellation every worker
/// is aborted, which kills its encoder, and the task waits for all of them
/// before returning.
fn spawn_feeder(
    stage: Arc<TranscodeStage>,
    jobs: Vec<Arc<TransferJob>>,
    workers: usize,
    cancel: CancellationToken,
    tx: mpsc::Sender<StageResult>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut pool = JoinSet::new();

        for job in jobs {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let stage = stage.clone();
            let tx = tx.clone();
            pool.spawn(async move {
                let result = stage.run_guarded(job).await;
                // Receiver gone means the run is over
                let _ = tx.send(result).await;
                drop(permit);
            });
        }
        drop(tx);

        let drained = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = async { while pool.join_next().await.is_some() {} } => true,
        };
        if !drained {
            debug!("Aborting {} transcode workers", pool.len());
            pool.abort_all();
            while pool.join_next().await.is_some() {}
        }
    })
}
