use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use motion_alarm_core::{
    ensure_clips_dir, run, warm_up, AppConfig, DifferenceAnalyzer, FrameSource, MjpegClipSink,
    MjpegSource, MotionAlarmError, MotionController, ShutdownToken, StopReason, Thresholds,
    UdpTransport,
};
use tracing_subscriber::EnvFilter;

fn main() -> motion_alarm_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Watch {
            stream,
            input,
            config,
            clips_dir,
            event_target,
        } => {
            let source = match input {
                Some(path) => Source::File(path),
                None => Source::Stream(stream),
            };
            run_watch(source, config.as_deref(), clips_dir, event_target)
        }
        Commands::Thresholds {
            width,
            height,
            config,
        } => print_thresholds(width, height, config.as_deref()),
        Commands::DefaultConfig => print_default_config(),
    };

    if let Err(err) = &result {
        tracing::error!(error = %err, "fatal error, exiting");
    }
    result
}

enum Source {
    Stream(String),
    File(PathBuf),
}

fn run_watch(
    source: Source,
    config_path: Option<&Path>,
    clips_dir: Option<PathBuf>,
    event_target: Option<String>,
) -> motion_alarm_core::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = clips_dir {
        config.recording.clips_dir = dir;
    }
    if let Some(target) = event_target {
        config.events.target = target;
    }
    config.validate()?;

    ensure_clips_dir(&config.recording.clips_dir)?;

    // Before the stream opens, so Ctrl-C also interrupts a stalled warm-up.
    let token = ShutdownToken::new();
    install_signal_handler(token.clone())?;

    let mut frames: Box<dyn FrameSource> = match source {
        Source::Stream(addr) => {
            tracing::info!(%addr, "connecting to MJPEG stream");
            let source = MjpegSource::connect(addr.as_str())?.with_shutdown(token.clone());
            tracing::info!(%addr, "connected to MJPEG stream");
            Box::new(source)
        }
        Source::File(path) => {
            tracing::info!(path = %path.display(), "reading MJPEG file");
            Box::new(MjpegSource::open(&path)?.with_shutdown(token.clone()))
        }
    };

    let transport = UdpTransport::connect(&config.events.target)?;
    tracing::info!(target = %transport.target(), "motion events go to UDP listener");

    let warm = warm_up(
        frames.as_mut(),
        config.stream.warmup_attempts,
        config.stream.warmup_delay(),
    )?;
    tracing::info!(
        width = warm.width(),
        height = warm.height(),
        clip_fps = config.recording.fps,
        "stream format"
    );

    let first = frames.next_frame().ok_or_else(|| {
        MotionAlarmError::StreamUnavailable("failed to grab initial background frame".into())
    })?;

    let thresholds = Thresholds::from_resolution(first.width(), first.height(), &config.detector);
    let analyzer = DifferenceAnalyzer::from_config(&config.detector, &thresholds);
    let sink = MjpegClipSink::new(config.recording.jpeg_quality);
    let pause = config.stream.loop_pause();
    let mut controller = MotionController::new(
        config,
        &first,
        Box::new(analyzer),
        Box::new(sink),
        Box::new(transport),
    );

    let summary = run(frames.as_mut(), &mut controller, &token, pause);
    match summary.stop_reason {
        StopReason::Cancelled => tracing::info!("clean shutdown"),
        StopReason::EndOfStream => tracing::info!("stream ended, shut down"),
    }
    Ok(())
}

fn print_thresholds(
    width: u32,
    height: u32,
    config_path: Option<&Path>,
) -> motion_alarm_core::Result<()> {
    let config = load_config(config_path)?;
    let thresholds = Thresholds::from_resolution(width, height, &config.detector);
    println!("{}", serde_json::to_string_pretty(&thresholds)?);
    Ok(())
}

fn print_default_config() -> motion_alarm_core::Result<()> {
    println!("{}", serde_json::to_string_pretty(&AppConfig::default())?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> motion_alarm_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading configuration");
            AppConfig::from_json_file(path)
        }
        None => Ok(AppConfig::default()),
    }
}

/// Cancels `token` on Ctrl-C (and SIGTERM on unix). The frame loop notices on
/// its next iteration.
fn install_signal_handler(token: ShutdownToken) -> motion_alarm_core::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                wait_for_shutdown_signal().await;
                tracing::info!("shutdown signal received");
                token.cancel();
            });
        })?;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            tracing::warn!(error = %err, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera motion alarm controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch a camera stream, send motion alerts and record motion clips.
    Watch {
        /// `host:port` of the local MJPEG stream.
        #[arg(long, default_value = "127.0.0.1:8554")]
        stream: String,
        /// Read frames from a recorded MJPEG file instead of the stream.
        #[arg(short, long, conflicts_with = "stream")]
        input: Option<PathBuf>,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Directory clips are written to.
        #[arg(long)]
        clips_dir: Option<PathBuf>,
        /// `host:port` of the UDP motion event listener.
        #[arg(long)]
        event_target: Option<String>,
    },
    /// Print the thresholds derived for a resolution.
    Thresholds {
        #[arg(long)]
        width: u32,
        #[arg(long)]
        height: u32,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as JSON.
    DefaultConfig,
}
