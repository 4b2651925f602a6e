use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use media_viewer_cache::CacheConfig;
use media_viewer_core::{LoadError, MediaSession, SessionStats, SpillRecord};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub mod synthetic;

use synthetic::{DecoderCounters, SyntheticDecoder};

/// Thumbnail passes before giving up on keys still building.
const THUMBNAIL_PASSES: usize = 3;

#[derive(Debug, Parser)]
#[command(name = "media-viewer-cli")]
#[command(about = "Media viewer cache tooling")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Drive a session with a synthetic decoder and print its stats as JSON.
    Simulate(SimulateArgs),
    /// Print the effective cache configuration as JSON.
    Config {
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Number of distinct images.
    #[arg(long, default_value_t = 64)]
    images: u64,
    #[arg(long, default_value_t = 512)]
    width: u32,
    #[arg(long, default_value_t = 384)]
    height: u32,
    /// Primary cache budget in MiB. Overrides the configuration.
    #[arg(long)]
    cache_mb: Option<u64>,
    /// Concurrent requesting threads.
    #[arg(long, default_value_t = 4)]
    threads: u64,
    /// Requests issued by each thread.
    #[arg(long, default_value_t = 200)]
    requests: u64,
    /// Fail the first decode attempt of every Nth image with a memory shortage.
    #[arg(long, default_value_t = 0)]
    exhaust_every: u64,
    /// Make every Nth image undecodable.
    #[arg(long, default_value_t = 0)]
    corrupt_every: u64,
    /// Also request a thumbnail for every image.
    #[arg(long)]
    thumbnails: bool,
    /// Keep thumbnails in memory only.
    #[arg(long)]
    no_spill: bool,
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
struct LoadOutcomes {
    loaded: u64,
    unreadable: u64,
    exhausted: u64,
    cancelled: u64,
    unavailable: u64,
}

impl LoadOutcomes {
    fn record(&mut self, result: &Result<impl Sized, LoadError>) {
        match result {
            Ok(_) => self.loaded += 1,
            Err(LoadError::Unreadable) => self.unreadable += 1,
            Err(LoadError::ResourceExhausted { .. }) => self.exhausted += 1,
            Err(LoadError::Cancelled) => self.cancelled += 1,
            Err(LoadError::WorkerUnavailable) => self.unavailable += 1,
        }
    }

    fn merge(&mut self, other: LoadOutcomes) {
        self.loaded += other.loaded;
        self.unreadable += other.unreadable;
        self.exhausted += other.exhausted;
        self.cancelled += other.cancelled;
        self.unavailable += other.unavailable;
    }
}

#[derive(Debug, Serialize)]
struct ThumbnailOutcomes {
    requested: u64,
    served: u64,
    unreadable: u64,
    on_disk: u64,
    callbacks: u64,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    images: u64,
    image_bytes: u64,
    threads: u64,
    requests: u64,
    elapsed_ms: u128,
    loads: LoadOutcomes,
    thumbnails: Option<ThumbnailOutcomes>,
    decoder: DecoderCounters,
    session: SessionStats,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging();

    match cli.command {
        Commands::Simulate(args) => run_simulate(&args),
        Commands::Config { config } => run_config(config.as_deref()),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    // A subscriber may already be installed when `run` is called twice in-process.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<CacheConfig> {
    let config = match path {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => CacheConfig::default(),
    };
    config.with_env_overrides().context("invalid MEDIA_VIEWER_* environment variable")
}

fn run_config(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn run_simulate(args: &SimulateArgs) -> Result<()> {
    if args.images == 0 {
        anyhow::bail!("--images must be >= 1");
    }

    let mut config = load_config(args.config.as_deref())?;
    if let Some(mb) = args.cache_mb {
        config = config
            .try_with_image_cache_mb(mb)
            .context("--cache-mb is too large")?;
    }
    if args.no_spill {
        config = config.with_spill_enabled(false);
    }

    let decoder = SyntheticDecoder::new(args.width, args.height)
        .with_exhaust_every(args.exhaust_every)
        .with_corrupt_every(args.corrupt_every);
    let image_bytes = decoder.image_bytes();
    let session = MediaSession::new(decoder, config).context("failed to start media session")?;

    info!(
        images = args.images,
        threads = args.threads,
        requests = args.requests,
        image_bytes,
        "starting simulation"
    );
    let started = Instant::now();
    let loads = drive_loads(&session, args)?;
    let thumbnails = if args.thumbnails {
        Some(drive_thumbnails(&session, args.images)?)
    } else {
        None
    };
    let elapsed_ms = started.elapsed().as_millis();

    let report = SimulationReport {
        images: args.images,
        image_bytes,
        threads: args.threads,
        requests: args.requests,
        elapsed_ms,
        loads,
        thumbnails,
        decoder: session.images().decoder().counters(),
        session: session.stats(),
    };
    info!(elapsed_ms, loaded = loads.loaded, "simulation finished");

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn drive_loads(
    session: &MediaSession<u64, SyntheticDecoder>,
    args: &SimulateArgs,
) -> Result<LoadOutcomes> {
    let images = session.images();
    let per_thread = thread::scope(|scope| {
        let handles: Vec<_> = (0..args.threads.max(1))
            .map(|t| {
                scope.spawn(move || {
                    let mut outcomes = LoadOutcomes::default();
                    for i in 0..args.requests {
                        let key = (i * 7 + t * 13) % args.images;
                        outcomes.record(&images.ensure_loaded(&key));
                    }
                    outcomes
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Result<Vec<_>, _>>()
    })
    .map_err(|_| anyhow!("simulation thread panicked"))?;

    let mut total = LoadOutcomes::default();
    for outcomes in per_thread {
        total.merge(outcomes);
    }
    Ok(total)
}

/// Requests every thumbnail, waits for the tier's worker, and asks again
/// until each key is served or known unreadable.
fn drive_thumbnails(
    session: &MediaSession<u64, SyntheticDecoder>,
    images: u64,
) -> Result<ThumbnailOutcomes> {
    let tier = session.thumbnails();
    let callbacks = Arc::new(AtomicU64::new(0));
    let mut served = vec![false; images as usize];
    let mut requested = 0;

    for _ in 0..THUMBNAIL_PASSES {
        for key in 0..images {
            if served[key as usize] || tier.is_unreadable(&key) {
                continue;
            }
            requested += 1;
            let callbacks = Arc::clone(&callbacks);
            let ready = tier.request(&key, move |_| {
                callbacks.fetch_add(1, Ordering::Relaxed);
            });
            served[key as usize] = ready.is_some();
        }
        tier.worker()
            .submit(|_| ())
            .context("thumbnail worker is shut down")?
            .wait();
    }

    let keys = 0..images;
    Ok(ThumbnailOutcomes {
        requested,
        served: served.iter().filter(|served| **served).count() as u64,
        unreadable: keys.clone().filter(|key| tier.is_unreadable(key)).count() as u64,
        on_disk: keys
            .filter(|key| matches!(tier.record(key), Some(SpillRecord::OnDisk(_))))
            .count() as u64,
        callbacks: callbacks.load(Ordering::Relaxed),
    })
}
