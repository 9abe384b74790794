//! cam-relay binary: record several cameras to one video file each.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use cam_relay::config::{CaptureMode, SinkKind, StreamConfig, CONFIG_ENV};
use cam_relay::session::short_streams;
use cam_relay::{device, RelayConfig, TimeoutPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay frames from several cameras into video files")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record every configured stream until it reaches its frame target.
    Record(RecordArgs),
    /// List V4L2 capture devices.
    List,
}

#[derive(clap::Args, Debug)]
struct RecordArgs {
    /// TOML configuration file.
    #[arg(long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Device URI per stream (`/dev/videoN`, `N` or `stub://N`), in stream order.
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Output path per stream, in stream order.
    #[arg(long = "output")]
    outputs: Vec<PathBuf>,

    /// Acquisition and output frame rate.
    #[arg(long)]
    fps: Option<f64>,

    /// Recording duration in seconds.
    #[arg(long)]
    seconds: Option<f64>,

    /// Scheduling model.
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Sink implementation.
    #[arg(long, value_enum)]
    sink: Option<SinkArg>,

    /// Skip retrieve timeouts instead of aborting.
    #[arg(long)]
    skip_timeouts: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Shared,
    Threaded,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SinkArg {
    Ffmpeg,
    Y4m,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let outcome = match args.command {
        Command::Record(record) => run_record(record),
        Command::List => run_list(),
    };
    if let Err(err) = outcome {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn run_list() -> Result<()> {
    let devices = device::enumerate().context("failed to enumerate V4L2 devices")?;
    for info in devices {
        println!("{}\t{}\t{}\t{}", info.uri, info.driver, info.model, info.serial);
    }
    Ok(())
}

fn run_record(args: RecordArgs) -> Result<()> {
    let config = build_config(args)?;
    log::info!(
        "recording {} stream(s) at {} fps, {} frames each",
        config.streams.len(),
        config.frame_rate,
        config.frames_per_stream()
    );

    let report = cam_relay::record(&config).context("recording failed")?;
    for stream in &report.streams {
        println!(
            "stream {}: {}/{} frames ({} failed grabs, {} stale, {} overflow)",
            stream.context,
            stream.forwarded,
            stream.target_frames,
            stream.failed_grabs,
            stream.stale,
            stream.overflow
        );
    }
    if report.timeouts_skipped > 0 || report.unrouted > 0 {
        log::info!(
            "{} timeouts skipped, {} unrouted frames",
            report.timeouts_skipped,
            report.unrouted
        );
    }
    for stream in short_streams(&report) {
        log::warn!(
            "stream {} stopped short: {} of {} frames",
            stream.context,
            stream.forwarded,
            stream.target_frames
        );
    }
    Ok(())
}

/// Config file (if any) overlaid with command line flags.
fn build_config(args: RecordArgs) -> Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => RelayConfig::default(),
    };

    if let Some(fps) = args.fps {
        config.frame_rate = fps;
    }
    if let Some(seconds) = args.seconds {
        config.recording_secs = seconds;
    }
    if let Some(mode) = args.mode {
        config.mode = match mode {
            ModeArg::Shared => CaptureMode::Shared,
            ModeArg::Threaded => CaptureMode::Threaded,
        };
    }
    if let Some(sink) = args.sink {
        config.sink.kind = match sink {
            SinkArg::Ffmpeg => SinkKind::Ffmpeg,
            SinkArg::Y4m => SinkKind::Y4m,
        };
    }
    if args.skip_timeouts {
        config.timeout_policy = TimeoutPolicy::Skip;
    }

    if !args.devices.is_empty() || !args.outputs.is_empty() {
        config.streams = command_line_streams(&args.devices, &args.outputs, config.sink.kind)?;
    }
    if config.streams.is_empty() {
        config.streams.push(StreamConfig {
            device: None,
            output: default_output(0, config.sink.kind),
            target_frames: None,
        });
    }

    config.validate()?;
    Ok(config)
}

fn command_line_streams(
    devices: &[String],
    outputs: &[PathBuf],
    kind: SinkKind,
) -> Result<Vec<StreamConfig>> {
    if !devices.is_empty() && !outputs.is_empty() && devices.len() != outputs.len() {
        bail!(
            "{} --device flags but {} --output flags",
            devices.len(),
            outputs.len()
        );
    }
    let count = devices.len().max(outputs.len());
    Ok((0..count)
        .map(|index| StreamConfig {
            device: devices.get(index).cloned(),
            output: outputs
                .get(index)
                .cloned()
                .unwrap_or_else(|| default_output(index, kind)),
            target_frames: None,
        })
        .collect())
}

fn default_output(index: usize, kind: SinkKind) -> PathBuf {
    let extension = match kind {
        SinkKind::Ffmpeg => "mp4",
        SinkKind::Y4m => "y4m",
    };
    PathBuf::from(format!("camera_{index}.{extension}"))
}
