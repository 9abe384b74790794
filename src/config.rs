//! Capture configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file is a
//! valid single-stream configuration once at least one stream is given.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::array::DEFAULT_QUEUE_DEPTH;
use crate::error::{RelayError, Result};
use crate::relay::{RelayPolicy, TimeoutPolicy};
use crate::traits::{AcquisitionSettings, Format, FourCC, GrabStrategy};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CAM_RELAY_CONFIG";

const DEFAULT_FRAME_RATE: f64 = 20.0;
const DEFAULT_RECORDING_SECS: f64 = 10.0;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_EXPOSURE_US: u64 = 40_000;
const DEFAULT_RETRIEVE_TIMEOUT_MS: u64 = 1000;

/// How streams are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// One polling loop over a shared grab queue.
    #[default]
    Shared,
    /// One thread per stream.
    Threaded,
}

/// Which sink implementation writes the output files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Pipe raw frames into an external ffmpeg process.
    #[default]
    Ffmpeg,
    /// Write a YUV4MPEG2 file directly.
    Y4m,
}

/// Encoder options for the ffmpeg sink.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Sink implementation.
    pub kind: SinkKind,
    /// Encoder executable.
    pub program: String,
    /// Output video codec.
    pub codec: String,
    /// Encoder preset.
    pub preset: String,
    /// Constant rate factor.
    pub crf: u32,
    /// Output pixel format; defaults to the input format's tag.
    pub output_pix_fmt: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Ffmpeg,
            program: "ffmpeg".to_owned(),
            codec: "libx264".to_owned(),
            preset: "fast".to_owned(),
            crf: 11,
            output_pix_fmt: None,
        }
    }
}

/// One camera and its output file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamConfig {
    /// Device URI: `/dev/videoN`, `N`, or `stub://N`.
    pub device: Option<String>,
    /// Output video path.
    pub output: PathBuf,
    /// Overrides the derived frame count for this stream.
    pub target_frames: Option<u64>,
}

/// Full capture configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Acquisition and output frame rate.
    pub frame_rate: f64,
    /// Recording duration in seconds.
    pub recording_secs: f64,
    /// Overrides `frame_rate * recording_secs` for every stream.
    pub target_frames: Option<u64>,
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Camera pixel format.
    pub pixel_format: FourCC,
    /// Exposure time in microseconds; 0 keeps the device's exposure mode.
    pub exposure_us: u64,
    /// Retrieve timeout in milliseconds.
    pub retrieve_timeout_ms: u64,
    /// Timeout handling.
    pub timeout_policy: TimeoutPolicy,
    /// Abort after this many timeouts in a row when skipping.
    pub max_consecutive_timeouts: Option<u32>,
    /// Device buffering strategy.
    pub grab_strategy: GrabStrategy,
    /// Scheduling model.
    pub mode: CaptureMode,
    /// Capacity of the shared grab queue.
    pub queue_depth: usize,
    /// Output sink.
    pub sink: SinkConfig,
    /// Streams, in context order.
    pub streams: Vec<StreamConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            frame_rate: DEFAULT_FRAME_RATE,
            recording_secs: DEFAULT_RECORDING_SECS,
            target_frames: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            pixel_format: FourCC::GREY,
            exposure_us: DEFAULT_EXPOSURE_US,
            retrieve_timeout_ms: DEFAULT_RETRIEVE_TIMEOUT_MS,
            timeout_policy: TimeoutPolicy::Abort,
            max_consecutive_timeouts: None,
            grab_strategy: GrabStrategy::OneByOne,
            mode: CaptureMode::Shared,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            sink: SinkConfig::default(),
            streams: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            RelayError::Config(format!("read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from the file named by [`CONFIG_ENV`], if set.
    pub fn from_env() -> Result<Option<Self>> {
        std::env::var_os(CONFIG_ENV)
            .map(|path| Self::load(Path::new(&path)))
            .transpose()
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(RelayError::Config(format!(
                "frame_rate must be positive, got {}",
                self.frame_rate
            )));
        }
        if self.target_frames.is_none()
            && !(self.recording_secs.is_finite() && self.recording_secs > 0.0)
        {
            return Err(RelayError::Config(format!(
                "recording_secs must be positive, got {}",
                self.recording_secs
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(RelayError::Config("frame size must be non-zero".to_owned()));
        }
        if self.pixel_format.bytes_per_pixel().is_none() {
            return Err(RelayError::UnsupportedPixelFormat(self.pixel_format));
        }
        if Format::new(self.width, self.height, self.pixel_format).size == 0 {
            return Err(RelayError::Config(format!(
                "frame size {}x{} {} exceeds {} bytes",
                self.width,
                self.height,
                self.pixel_format,
                u32::MAX
            )));
        }
        if self.retrieve_timeout_ms == 0 {
            return Err(RelayError::Config("retrieve_timeout_ms must be non-zero".to_owned()));
        }
        for (index, stream) in self.streams.iter().enumerate() {
            let duplicate = self
                .streams
                .iter()
                .skip(index + 1)
                .any(|other| other.output == stream.output);
            if duplicate {
                return Err(RelayError::Config(format!(
                    "output {} used by more than one stream",
                    stream.output.display()
                )));
            }
        }
        Ok(())
    }

    /// Frames each stream records unless it overrides the count.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn frames_per_stream(&self) -> u64 {
        self.target_frames.unwrap_or_else(|| {
            // round before ceil so 20.0 * 10.0 doesn't become 201
            let exact = (self.frame_rate * self.recording_secs * 1e6).round() / 1e6;
            exact.ceil().max(0.0) as u64
        })
    }

    /// Target frame count for the stream at `index`.
    pub fn target_for(&self, index: usize) -> u64 {
        self.streams
            .get(index)
            .and_then(|stream| stream.target_frames)
            .unwrap_or_else(|| self.frames_per_stream())
    }

    /// Settings applied to every device before grabbing.
    pub fn acquisition(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            frame_rate: Some(self.frame_rate),
            exposure: (self.exposure_us > 0).then(|| Duration::from_micros(self.exposure_us)),
        }
    }

    /// Polling parameters for the relay.
    pub const fn relay_policy(&self) -> RelayPolicy {
        RelayPolicy {
            retrieve_timeout: Duration::from_millis(self.retrieve_timeout_ms),
            timeout_policy: self.timeout_policy,
            max_consecutive_timeouts: self.max_consecutive_timeouts,
        }
    }
}
