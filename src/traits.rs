//! Core traits and types for the frame relay.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RelayError, Result};

/// Pixel format representation (e.g., GREY, YUYV, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// 8-bit monochrome (Mono8).
    pub const GREY: Self = Self::new(b"GREY");
    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");

    /// Bytes per pixel for uncompressed formats.
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"GREY" => Some(1),
            b"YUYV" => Some(2),
            b"RGB3" => Some(3),
            _ => None,
        }
    }

    /// The ffmpeg `-pix_fmt` tag for raw buffers in this format.
    pub const fn ffmpeg_pix_fmt(self) -> Option<&'static str> {
        match &self.0 {
            b"GREY" => Some("gray"),
            b"YUYV" => Some("yuyv422"),
            b"RGB3" => Some("rgb24"),
            _ => None,
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl FromStr for FourCC {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Mono8" | "mono8" | "gray" | "GRAY" => return Ok(Self::GREY),
            "rgb24" | "RGB8" => return Ok(Self::RGB3),
            "yuyv422" | "YUV422_YUYV_Packed" => return Ok(Self::YUYV),
            _ => {}
        }
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| RelayError::Config(format!("invalid pixel format '{s}'")))?;
        Ok(Self(bytes))
    }
}

impl<'de> Deserialize<'de> for FourCC {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    ///
    /// Compressed formats, and frames too large for a `u32` byte count, get
    /// a zero stride and size.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let (stride, size) = match fourcc.bytes_per_pixel() {
            Some(bpp) => match width.checked_mul(bpp) {
                Some(stride) => match stride.checked_mul(height) {
                    Some(size) => (stride, size),
                    None => (0, 0),
                },
                None => (0, 0),
            },
            None => (0, 0),
        };
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }

    /// Size of one uncompressed frame in bytes.
    pub const fn frame_len(&self) -> usize {
        self.size as usize
    }
}

/// Metadata for a grabbed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Context of the stream that produced the frame.
    pub context: usize,
    /// Monotonically increasing per-device image number.
    pub image_number: u64,
    /// Capture timestamp.
    pub timestamp: Duration,
}

/// A grabbed video frame.
///
/// Frames are moved into a sink and never cloned by the relay.
#[derive(Debug)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Layout of `data`.
    pub format: Format,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Context of the stream that produced this frame.
    pub const fn context(&self) -> usize {
        self.metadata.context
    }

    /// Luminance of the pixel at the specified coordinates.
    ///
    /// Returns `None` for out-of-range coordinates and for formats without a
    /// directly addressable luma plane.
    #[must_use]
    pub fn luma_at(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.format.width || y >= self.format.height {
            return None;
        }
        let row = (y * self.format.stride) as usize;
        match &self.format.fourcc.0 {
            b"GREY" => self.data.get(row + x as usize).copied(),
            // YUYV: [Y0 U Y1 V], luma at every even byte
            b"YUYV" => self.data.get(row + (x as usize) * 2).copied(),
            _ => None,
        }
    }
}

/// Outcome of a single retrieve call.
#[derive(Debug)]
pub enum Grab {
    /// The grab succeeded.
    Frame(Frame),
    /// The device reported a failed grab; no buffer is available.
    Failed {
        /// Context of the stream the failed grab belongs to.
        context: usize,
        /// Image number the device assigned to the failed grab.
        image_number: u64,
        /// Device-supplied description.
        reason: String,
    },
}

impl Grab {
    /// Context of the stream this grab belongs to.
    pub const fn context(&self) -> usize {
        match self {
            Self::Frame(frame) => frame.metadata.context,
            Self::Failed { context, .. } => *context,
        }
    }
}

/// Buffering strategy used while grabbing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabStrategy {
    /// Queue every frame and deliver them in order.
    #[default]
    OneByOne,
    /// Keep only the most recent frame; older pending frames are dropped.
    LatestImageOnly,
}

/// Acquisition parameters applied to a device before grabbing.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Requested pixel format.
    pub pixel_format: FourCC,
    /// Fixed acquisition frame rate; `None` leaves frame rate control disabled.
    pub frame_rate: Option<f64>,
    /// Manual exposure time; `None` leaves the device's exposure mode alone.
    pub exposure: Option<Duration>,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            pixel_format: FourCC::GREY,
            frame_rate: Some(20.0),
            exposure: Some(Duration::from_micros(40_000)),
        }
    }
}

/// Identifying information about a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Driver name.
    pub driver: String,
    /// Model name.
    pub model: String,
    /// Serial number or bus location.
    pub serial: String,
    /// Path or URI used to open the device.
    pub uri: String,
}

/// Abstraction over a camera device handle.
pub trait CameraDevice {
    /// Identifying information.
    fn info(&self) -> &DeviceInfo;

    /// Open the device. Opening an open device is a no-op.
    fn open(&mut self) -> Result<()>;

    /// Close the device, stopping grabbing first if needed.
    fn close(&mut self) -> Result<()>;

    /// Whether the device is open.
    fn is_open(&self) -> bool;

    /// Apply acquisition settings. Returns the format the device actually uses.
    fn configure(&mut self, settings: &AcquisitionSettings) -> Result<Format>;

    /// Context stamped on every grab from this device.
    fn context(&self) -> usize;

    /// Set the context stamped on every grab from this device.
    fn set_context(&mut self, context: usize);

    /// Start grabbing. With `max_frames` set, grabbing stops on its own after
    /// that many grabs.
    fn start_grabbing(&mut self, strategy: GrabStrategy, max_frames: Option<u64>) -> Result<()>;

    /// Stop grabbing. Stopping a device that is not grabbing is a no-op.
    fn stop_grabbing(&mut self) -> Result<()>;

    /// Whether the device is grabbing.
    fn is_grabbing(&self) -> bool;

    /// Block until the next grab completes or `timeout` expires.
    fn retrieve(&mut self, timeout: Duration) -> Result<Grab>;
}

impl<D: CameraDevice + ?Sized> CameraDevice for Box<D> {
    fn info(&self) -> &DeviceInfo {
        (**self).info()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn configure(&mut self, settings: &AcquisitionSettings) -> Result<Format> {
        (**self).configure(settings)
    }

    fn context(&self) -> usize {
        (**self).context()
    }

    fn set_context(&mut self, context: usize) {
        (**self).set_context(context);
    }

    fn start_grabbing(&mut self, strategy: GrabStrategy, max_frames: Option<u64>) -> Result<()> {
        (**self).start_grabbing(strategy, max_frames)
    }

    fn stop_grabbing(&mut self) -> Result<()> {
        (**self).stop_grabbing()
    }

    fn is_grabbing(&self) -> bool {
        (**self).is_grabbing()
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<Grab> {
        (**self).retrieve(timeout)
    }
}

/// A queue of grab outcomes, possibly spanning several devices.
pub trait FrameSource {
    /// Block until the next grab outcome is available or `timeout` expires.
    ///
    /// Returns `RelayError::Timeout` on expiry and `RelayError::SourceClosed`
    /// once no further grabs will arrive.
    fn next_grab(&mut self, timeout: Duration) -> Result<Grab>;
}

impl<S: FrameSource + ?Sized> FrameSource for &mut S {
    fn next_grab(&mut self, timeout: Duration) -> Result<Grab> {
        (**self).next_grab(timeout)
    }
}

/// Adapts a single grabbing device into a [`FrameSource`].
pub struct DeviceSource<'a, D: CameraDevice + ?Sized> {
    device: &'a mut D,
}

impl<'a, D: CameraDevice + ?Sized> DeviceSource<'a, D> {
    /// Wrap a device that is already grabbing.
    pub fn new(device: &'a mut D) -> Self {
        Self { device }
    }
}

impl<D: CameraDevice + ?Sized> FrameSource for DeviceSource<'_, D> {
    fn next_grab(&mut self, timeout: Duration) -> Result<Grab> {
        if !self.device.is_grabbing() {
            return Err(RelayError::SourceClosed);
        }
        self.device.retrieve(timeout)
    }
}

/// Parameters a sink is created with.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkSpec {
    /// Output file.
    pub path: PathBuf,
    /// Layout of the frames the sink will receive.
    pub format: Format,
    /// Playback frame rate of the output.
    pub frame_rate: f64,
}

/// A scoped frame consumer that produces a video file.
///
/// Implementations finalize their output in `finish` and also on drop, so the
/// file is closed on every exit path.
pub trait FrameSink: Send {
    /// Append a frame. Frames arrive in delivery order.
    fn write_frame(&mut self, frame: Frame) -> Result<()>;

    /// Number of frames written so far.
    fn frames_written(&self) -> u64;

    /// Flush and finalize the output. Calling it again is a no-op.
    fn finish(&mut self) -> Result<()>;
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn write_frame(&mut self, frame: Frame) -> Result<()> {
        (**self).write_frame(frame)
    }

    fn frames_written(&self) -> u64 {
        (**self).frames_written()
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes_follow_pixel_format() {
        let grey = Format::new(640, 480, FourCC::GREY);
        assert_eq!(grey.stride, 640);
        assert_eq!(grey.frame_len(), 640 * 480);

        let yuyv = Format::new(640, 480, FourCC::YUYV);
        assert_eq!(yuyv.stride, 1280);

        let mjpg = Format::new(640, 480, FourCC::MJPG);
        assert_eq!(mjpg.size, 0);
    }

    #[test]
    fn test_oversized_format_has_no_size() {
        let huge = Format::new(100_000, 100_000, FourCC::GREY);
        assert_eq!((huge.stride, huge.size), (0, 0));

        let wide = Format::new(u32::MAX, 1, FourCC::YUYV);
        assert_eq!(wide.frame_len(), 0);
    }

    #[test]
    fn test_fourcc_parse_aliases() {
        assert_eq!("Mono8".parse::<FourCC>().expect("parse"), FourCC::GREY);
        assert_eq!("YUYV".parse::<FourCC>().expect("parse"), FourCC::YUYV);
        assert!("toolong".parse::<FourCC>().is_err());
        assert_eq!(FourCC::GREY.to_string(), "GREY");
    }

    #[test]
    fn test_luma_at_bounds() {
        let format = Format::new(4, 2, FourCC::GREY);
        let frame = Frame {
            data: (0..8).collect(),
            format,
            metadata: FrameMetadata {
                context: 0,
                image_number: 1,
                timestamp: Duration::ZERO,
            },
        };
        assert_eq!(frame.luma_at(3, 1), Some(7));
        assert_eq!(frame.luma_at(4, 0), None);
        assert_eq!(frame.luma_at(0, 2), None);
    }
}
