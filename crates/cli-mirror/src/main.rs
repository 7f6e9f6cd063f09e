use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{debug, error, warn, LevelFilter};
use mirror::{
    config::{parse_format_list, MirrorConfig},
    transcode, LogReporter, Mirror, Verbosity,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Exit status for configuration and setup errors
const SETUP_ERROR_EXIT: i32 = 2;

/// Mirror a music library, transcoding lossless files on the way
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to mirror
    source: Option<PathBuf>,

    /// Destination of the mirror
    dest: Option<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-delimited source extensions to transcode [default: flac,wv,wav,ape,fla]
    #[arg(short = 't', long)]
    transcode_formats: Option<String>,

    /// Extension of transcoded files [default: ogg]
    #[arg(short = 'f', long)]
    target_format: Option<String>,

    /// ffmpeg binary
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// ffprobe binary, used to read fingerprint tags
    #[arg(long)]
    ffprobe: Option<PathBuf>,

    /// Encoder arguments passed verbatim to ffmpeg
    #[arg(short = 'E', long, allow_hyphen_values = true)]
    encoder_options: Option<String>,

    /// rsync binary (looked up on PATH when omitted)
    #[arg(long, conflicts_with = "no_rsync")]
    rsync: Option<PathBuf>,

    /// Always use a plain copy instead of rsync
    #[arg(long)]
    no_rsync: bool,

    /// Parent directory for transcode staging
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Parallel transcodes; 0 runs everything sequentially [default: CPU count]
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Parallel staleness checks [default: CPU count]
    #[arg(long)]
    check_jobs: Option<usize>,

    /// Report what would be done without touching anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Include files and directories whose names start with a dot
    #[arg(long)]
    include_hidden: bool,

    /// Delete destination files with no source counterpart
    #[arg(short = 'D', long)]
    delete: bool,

    /// Re-transcode and re-copy everything
    #[arg(long)]
    force: bool,

    /// Use modification times instead of fingerprints for transcoded files
    #[arg(long)]
    no_checksum: bool,

    /// Only report warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Report every file and debug output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else if self.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    /// Command-line flags take precedence over the config file
    fn apply(&self, cfg: &mut MirrorConfig) {
        if let Some(source) = &self.source {
            cfg.source_dir = source.clone();
        }
        if let Some(dest) = &self.dest {
            cfg.dest_dir = dest.clone();
        }
        if let Some(list) = &self.transcode_formats {
            cfg.transcode_formats = parse_format_list(list);
        }
        if let Some(target) = &self.target_format {
            cfg.target_format = target.clone();
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            cfg.ffmpeg_bin = ffmpeg.clone();
        }
        if let Some(ffprobe) = &self.ffprobe {
            cfg.ffprobe_bin = ffprobe.clone();
        }
        if let Some(options) = &self.encoder_options {
            cfg.encoder_options = Some(options.clone());
        }
        if let Some(rsync) = &self.rsync {
            cfg.rsync_bin = Some(rsync.clone());
        }
        if let Some(temp_dir) = &self.temp_dir {
            cfg.temp_dir = Some(temp_dir.clone());
        }
        if let Some(jobs) = self.jobs {
            cfg.jobs = jobs;
        }
        if let Some(check_jobs) = self.check_jobs {
            cfg.check_jobs = check_jobs;
        }

        cfg.use_rsync &= !self.no_rsync;
        cfg.checksum &= !self.no_checksum;
        cfg.dry_run |= self.dry_run;
        cfg.include_hidden |= self.include_hidden;
        cfg.delete_extraneous |= self.delete;
        cfg.force |= self.force;
        cfg.normalize_formats();
    }
}

fn init_logger(verbosity: Verbosity) {
    let mut builder = env_logger::Builder::from_default_env();
    // RUST_LOG wins over -q/-v
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match verbosity {
            Verbosity::Quiet => LevelFilter::Warn,
            Verbosity::Normal => LevelFilter::Info,
            Verbosity::Verbose => LevelFilter::Debug,
        };
        builder.filter_level(level);
    }
    builder.format_timestamp_secs().init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(args.verbosity());

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            SETUP_ERROR_EXIT
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let mut cfg = MirrorConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    args.apply(&mut cfg);

    if cfg.source_dir.as_os_str().is_empty() || cfg.dest_dir.as_os_str().is_empty() {
        return Err(anyhow!("Both a source and a destination directory are required"));
    }

    debug!("Configuration: {:?}", cfg);
    if !cfg.dry_run {
        match transcode::ffmpeg_version(&cfg.ffmpeg_bin).await {
            Ok(version) => debug!("Using {}", version),
            Err(e) => warn!("{:#}", e),
        }
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cleaning up...");
            interrupt.cancel();
        }
    });

    let reporter = Arc::new(LogReporter::new(args.verbosity(), cfg.dry_run));
    let mirror = Mirror::from_config(cfg, reporter);
    let report = mirror.run(cancel).await.context("Setup failed")?;

    Ok(report.exit_code())
}
