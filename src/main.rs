//! lamco-encode-pipeline - encoder pipeline demo
//!
//! Feeds a synthetic test pattern through the encoder pipeline at the
//! configured framerate and logs what comes out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use lamco_encode_pipeline::backend::BackendRegistry;
use lamco_encode_pipeline::config::{LoggingConfig, PipelineConfig};
use lamco_encode_pipeline::encoder::{
    EncodeError, EncodeResult, EncodedPacket, Encoder, FrameCookie, PacketListener, VideoFrame,
};

/// Command-line arguments for lamco-encode-pipeline
#[derive(Parser, Debug)]
#[command(name = "lamco-encode-pipeline")]
#[command(version, about = "Video encoder pipeline demo", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/lamco-encode-pipeline/config.toml")]
    pub config: String,

    /// Codec to encode with (raw, rle, h264)
    #[arg(long, env = "LAMCO_CODEC")]
    pub codec: Option<String>,

    /// Target bitrate in kbps
    #[arg(short, long, env = "LAMCO_BITRATE")]
    pub bitrate: Option<u32>,

    /// Target framerate
    #[arg(short, long, env = "LAMCO_FRAMERATE")]
    pub framerate: Option<u32>,

    /// Stop after this many seconds (0 = run until ctrl-c)
    #[arg(short, long, default_value = "10")]
    pub duration: u64,

    /// List registered backends and exit
    #[arg(long)]
    pub list_backends: bool,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Write logs to file (in addition to stdout)
    #[arg(long)]
    pub log_file: Option<String>,
}

/// Listener that counts and traces every packet
#[derive(Debug, Default)]
struct PacketLogger {
    packets: AtomicU64,
    dropped: AtomicU64,
    keyframes: AtomicU64,
    bytes: AtomicU64,
}

impl PacketListener for PacketLogger {
    fn on_packet(&self, packet: &EncodedPacket) {
        let frame = packet
            .cookie()
            .and_then(|c| c.downcast_ref::<u64>())
            .copied()
            .unwrap_or_default();

        self.packets.fetch_add(1, Ordering::Relaxed);
        if packet.is_dropped() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Frame {} dropped by encoder", frame);
            return;
        }
        if packet.is_keyframe() {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes
            .fetch_add(packet.payload().len() as u64, Ordering::Relaxed);

        trace!(
            "Frame {}: {} bytes, keyframe={}, qp={}, latency={:?}, ts={:?}",
            frame,
            packet.payload().len(),
            packet.is_keyframe(),
            packet.avg_qp(),
            packet.encode_latency(),
            packet.timestamp()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = PipelineConfig::load(&args.config);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => PipelineConfig::default(),
    };
    let config = config.with_overrides(args.codec.clone(), args.bitrate, args.framerate);

    // Keeps the non-blocking file writer alive until exit
    let _log_guard = init_logging(&args, &config.logging)?;

    info!("════════════════════════════════════════════════════════");
    info!("  lamco-encode-pipeline v{}", env!("CARGO_PKG_VERSION"));
    info!("  Built: {} {}", env!("BUILD_DATE"), env!("BUILD_TIME"));
    info!("  Commit: {}", env!("GIT_HASH"));
    info!("  Profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });
    info!("════════════════════════════════════════════════════════");

    if let Err(e) = &loaded {
        warn!("Failed to load config: {:#}, using defaults", e);
    }
    config.validate()?;
    debug!("Config: {:?}", config);

    let registry = BackendRegistry::global();
    if args.list_backends {
        for name in registry.factory_names() {
            println!("{}", name);
        }
        println!("codecs: {}", registry.codecs().join(", "));
        return Ok(());
    }

    let encoder = registry
        .create_encoder(
            &config.pipeline.codec,
            config.encoder.clone(),
            config.pipeline.clone(),
        )
        .context("Failed to create encoder")?;
    let encoder = Arc::new(encoder);

    let logger = Arc::new(PacketLogger::default());
    encoder.add_listener(logger.clone())?;

    let run_for = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    tokio::select! {
        result = produce_frames(Arc::clone(&encoder), &config, run_for) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    // Flush and shutdown wait on the encode thread
    let flushed = {
        let encoder = Arc::clone(&encoder);
        tokio::task::spawn_blocking(move || encoder.flush()).await??
    };
    debug!("Flushed {} packets", flushed);
    match Arc::try_unwrap(encoder) {
        Ok(mut encoder) => tokio::task::spawn_blocking(move || encoder.shutdown()).await?,
        Err(_) => debug!("Capture still in flight, encoder stops on last drop"),
    }
    registry.shutdown();

    info!(
        "Delivered {} packets ({} dropped, {} keyframes, {} bytes)",
        logger.packets.load(Ordering::Relaxed),
        logger.dropped.load(Ordering::Relaxed),
        logger.keyframes.load(Ordering::Relaxed),
        logger.bytes.load(Ordering::Relaxed)
    );
    Ok(())
}

/// Capture and encode one frame on a blocking thread
///
/// Returns false when the pool was exhausted and the frame was skipped.
fn capture_and_encode(
    encoder: &Encoder,
    frame: VideoFrame,
    timestamp: Duration,
    frame_duration: Duration,
    frame_num: u64,
) -> EncodeResult<bool> {
    match encoder.capture(frame, timestamp, frame_duration, None) {
        Ok(slot) => {
            encoder.encode(slot, frame_num == 0, None, FrameCookie::new(frame_num))?;
            Ok(true)
        }
        Err(EncodeError::PoolExhausted { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Capture and encode one test-pattern frame per tick
async fn produce_frames(
    encoder: Arc<Encoder>,
    config: &PipelineConfig,
    run_for: Option<Duration>,
) -> Result<()> {
    let resolution = config.encoder.resolution();
    let frame_duration = Duration::from_secs_f64(1.0 / config.encoder.framerate as f64);
    let stats_interval = Duration::from_secs(config.logging.stats_interval_secs);

    let mut ticker = tokio::time::interval(frame_duration);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let started = Instant::now();
    let mut last_stats = Instant::now();
    let mut frame_num: u64 = 0;
    let mut exhausted: u64 = 0;

    info!(
        "Producing {} frames at {}fps via {}",
        resolution,
        config.encoder.framerate,
        encoder.backend_name()
    );

    loop {
        ticker.tick().await;
        if run_for.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }

        let frame = VideoFrame::test_pattern(resolution, frame_num as u32);
        let timestamp = started.elapsed();
        // capture drains through the encode thread, keep it off the runtime
        let captured = {
            let encoder = Arc::clone(&encoder);
            tokio::task::spawn_blocking(move || {
                capture_and_encode(&encoder, frame, timestamp, frame_duration, frame_num)
            })
            .await??
        };
        if !captured {
            exhausted += 1;
            trace!("Frame {} skipped, pool exhausted", frame_num);
        }
        frame_num += 1;

        if !stats_interval.is_zero() && last_stats.elapsed() >= stats_interval {
            info!("{} ({} captures skipped)", encoder.stats().summary(), exhausted);
            last_stats = Instant::now();
        }
    }

    info!(
        "Produced {} frames in {:.1}s, {} skipped on exhaustion",
        frame_num,
        started.elapsed().as_secs_f32(),
        exhausted
    );
    Ok(())
}

/// Formatting layer for `format` writing to `writer`
fn fmt_layer<S, W>(format: &str, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi);
    match format {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        "pretty" => layer.pretty().boxed(),
        _ => layer.boxed(),
    }
}

fn init_logging(args: &Args, logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let log_level = match args.verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let log_format = args.log_format.as_deref().unwrap_or(&logging.format);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "lamco_encode_pipeline={level},warn",
            level = log_level
        ))
    });

    // File output goes through a non-blocking writer so the encode thread
    // never waits on disk
    let (file_writer, guard) = match (&args.log_file, &logging.log_dir) {
        (Some(path), _) => {
            let path = std::path::Path::new(path);
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .context("Log file path has no file name")?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        (None, Some(dir)) => {
            let appender = tracing_appender::rolling::daily(dir, "lamco-encode-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        (None, None) => (None, None),
    };

    // Pretty output is for terminals; files get the plain full format
    let file_format = if log_format == "pretty" { "full" } else { log_format };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer(log_format, std::io::stdout, true))
        .with(file_writer.map(|writer| fmt_layer(file_format, writer, false)))
        .init();

    if let Some(path) = &args.log_file {
        info!("Logging to file: {}", path);
    }

    Ok(guard)
}
