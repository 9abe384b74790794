//! V4L2 device implementation using the v4l crate.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ouroboros::self_referencing;
use v4l::buffer::{Flags, Type};
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::error::{RelayError, Result};
use crate::traits::{
    AcquisitionSettings, CameraDevice, DeviceInfo, Format, FourCC, Frame, FrameMetadata, Grab,
    GrabStrategy,
};

const V4L2_CID_CAMERA_CLASS_BASE: u32 = 0x009a_0900;
const V4L2_CID_EXPOSURE_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 2;
const V4L2_EXPOSURE_MANUAL: i64 = 1;

/// List the V4L2 capture devices present on the system.
pub fn enumerate() -> Result<Vec<DeviceInfo>> {
    let mut nodes = v4l::context::enum_devices();
    nodes.sort_by_key(v4l::context::Node::index);

    let devices: Vec<DeviceInfo> = nodes
        .iter()
        .filter_map(|node| {
            let device = Device::with_path(node.path()).ok()?;
            let caps = device.query_caps().ok()?;
            caps.capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                .then(|| DeviceInfo {
                    driver: caps.driver,
                    model: caps.card,
                    serial: caps.bus,
                    uri: node.path().display().to_string(),
                })
        })
        .collect();

    if devices.is_empty() {
        return Err(RelayError::EnumerationEmpty);
    }
    Ok(devices)
}

/// The driver's format with rows packed back to back.
///
/// Drivers may pad rows; frames leave this device without that padding.
/// Compressed formats keep the driver's size.
const fn format_from_v4l(fmt: &v4l::Format) -> Format {
    let packed = Format::new(fmt.width, fmt.height, FourCC(fmt.fourcc.repr));
    if packed.size == 0 {
        return Format {
            stride: fmt.stride,
            size: fmt.size,
            ..packed
        };
    }
    packed
}

/// Copy a driver buffer into `format`'s packed layout.
///
/// Rows in `data` are `driver_stride` bytes apart. Returns `None` if the
/// buffer is shorter than a full frame.
fn pack_rows(mut data: Vec<u8>, driver_stride: u32, format: &Format) -> Option<Vec<u8>> {
    let row_len = format.stride as usize;
    let frame_len = format.frame_len();
    if row_len == 0 {
        return Some(data);
    }
    let stride = driver_stride as usize;
    if stride <= row_len {
        if data.len() < frame_len {
            return None;
        }
        data.truncate(frame_len);
        return Some(data);
    }

    let mut packed = Vec::with_capacity(frame_len);
    for row in data.chunks(stride).take(format.height as usize) {
        packed.extend_from_slice(row.get(..row_len)?);
    }
    (packed.len() == frame_len).then_some(packed)
}

#[self_referencing]
struct GrabState {
    device: Device,
    #[borrows(device)]
    #[covariant]
    stream: Stream<'this>,
}

enum State {
    Closed,
    Open(Device),
    Grabbing(Box<GrabState>),
}

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    path: PathBuf,
    info: DeviceInfo,
    state: State,
    format: Option<Format>,
    driver_stride: u32,
    context: usize,
    remaining: Option<u64>,
    grabbed: u64,
}

impl V4L2Device {
    /// Create a handle for a device by index (e.g., 0 for /dev/video0).
    pub fn new_index(index: u32) -> Self {
        Self::new_path(format!("/dev/video{index}"))
    }

    /// Create a handle for a device node. The device is not opened yet.
    pub fn new_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            info: DeviceInfo {
                uri: path.display().to_string(),
                ..DeviceInfo::default()
            },
            path,
            state: State::Closed,
            format: None,
            driver_stride: 0,
            context: 0,
            remaining: None,
            grabbed: 0,
        }
    }

    /// Open a device by index.
    pub fn open_index(index: u32) -> Result<Self> {
        let mut device = Self::new_index(index);
        device.open()?;
        Ok(device)
    }

    /// Open a device node.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut device = Self::new_path(path);
        device.open()?;
        Ok(device)
    }

    fn device(&self) -> Result<&Device> {
        match &self.state {
            State::Open(device) => Ok(device),
            State::Grabbing(_) => Err(RelayError::DeviceFault {
                context: self.context,
                message: "device is busy grabbing".to_owned(),
            }),
            State::Closed => Err(RelayError::NotOpen),
        }
    }

    fn fault(&self, err: &io::Error) -> RelayError {
        RelayError::DeviceFault {
            context: self.context,
            message: err.to_string(),
        }
    }

    fn set_exposure(&self, device: &Device, exposure: Duration) {
        // V4L2 absolute exposure is in units of 100 µs.
        let units = i64::try_from(exposure.as_micros() / 100).unwrap_or(i64::MAX).max(1);
        let controls = [
            (V4L2_CID_EXPOSURE_AUTO, V4L2_EXPOSURE_MANUAL),
            (V4L2_CID_EXPOSURE_ABSOLUTE, units),
        ];
        for (id, value) in controls {
            let control = Control {
                id,
                value: Value::Integer(value),
            };
            if let Err(err) = device.set_control(control) {
                log::warn!(
                    "{}: failed to set exposure control {id:#x}: {err}",
                    self.info.uri
                );
            }
        }
    }
}

impl CameraDevice for V4L2Device {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn open(&mut self) -> Result<()> {
        if !matches!(self.state, State::Closed) {
            return Ok(());
        }
        let device = Device::with_path(&self.path).map_err(|err| {
            RelayError::DeviceOpenFailed(format!("{}: {err}", self.path.display()))
        })?;
        let caps = device.query_caps().map_err(|err| {
            RelayError::DeviceOpenFailed(format!("{}: {err}", self.path.display()))
        })?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(RelayError::DeviceOpenFailed(format!(
                "{} cannot capture video",
                self.path.display()
            )));
        }

        self.info = DeviceInfo {
            driver: caps.driver,
            model: caps.card,
            serial: caps.bus,
            uri: self.path.display().to_string(),
        };
        log::info!("opened {} ({})", self.info.uri, self.info.model);
        self.state = State::Open(device);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop_grabbing()?;
        if matches!(self.state, State::Open(_)) {
            log::info!("closed {}", self.info.uri);
        }
        self.state = State::Closed;
        Ok(())
    }

    fn is_open(&self) -> bool {
        !matches!(self.state, State::Closed)
    }

    fn configure(&mut self, settings: &AcquisitionSettings) -> Result<Format> {
        let device = self.device()?;

        let mut fmt = device.format().map_err(|err| self.fault(&err))?;
        fmt.width = settings.width;
        fmt.height = settings.height;
        fmt.fourcc = settings.pixel_format.into();
        let fmt = match device.set_format(&fmt) {
            Ok(fmt) => fmt,
            Err(err) => {
                log::warn!("{}: failed to set format: {err}", self.info.uri);
                device.format().map_err(|err| self.fault(&err))?
            }
        };

        let format = format_from_v4l(&fmt);
        if format.fourcc != settings.pixel_format || format.size == 0 {
            return Err(RelayError::FormatNotSupported(Format::new(
                settings.width,
                settings.height,
                settings.pixel_format,
            )));
        }

        if let Some(fps) = settings.frame_rate {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let params = Parameters::with_fps(fps.round().max(1.0) as u32);
            if let Err(err) = device.set_params(&params) {
                log::warn!("{}: failed to set {fps} fps: {err}", self.info.uri);
            }
        }
        if let Some(exposure) = settings.exposure {
            self.set_exposure(device, exposure);
        }

        if (format.width, format.height) != (settings.width, settings.height) {
            log::warn!(
                "{}: driver adjusted {}x{} to {}x{}",
                self.info.uri,
                settings.width,
                settings.height,
                format.width,
                format.height
            );
        }
        log::info!(
            "{}: {}x{} {} (driver stride {})",
            self.info.uri,
            format.width,
            format.height,
            format.fourcc,
            fmt.stride
        );
        self.format = Some(format);
        self.driver_stride = fmt.stride;
        Ok(format)
    }

    fn context(&self) -> usize {
        self.context
    }

    fn set_context(&mut self, context: usize) {
        self.context = context;
    }

    fn start_grabbing(&mut self, strategy: GrabStrategy, max_frames: Option<u64>) -> Result<()> {
        if self.is_grabbing() {
            return Ok(());
        }
        if self.format.is_none() {
            let device = self.device()?;
            let fmt = device.format().map_err(|err| self.fault(&err))?;
            self.format = Some(format_from_v4l(&fmt));
            self.driver_stride = fmt.stride;
        }
        let State::Open(device) = std::mem::replace(&mut self.state, State::Closed) else {
            return Err(RelayError::NotOpen);
        };

        let buffer_count = match strategy {
            GrabStrategy::OneByOne => 4,
            GrabStrategy::LatestImageOnly => 2,
        };
        let grab = GrabStateTryBuilder {
            device,
            stream_builder: |device| {
                Stream::with_buffers(device, Type::VideoCapture, buffer_count)
            },
        }
        .try_build_or_recover();

        match grab {
            Ok(grab) => {
                self.state = State::Grabbing(Box::new(grab));
                self.remaining = max_frames;
                self.grabbed = 0;
                log::debug!("{}: grabbing ({strategy:?})", self.info.uri);
                Ok(())
            }
            Err((err, heads)) => {
                self.state = State::Open(heads.device);
                Err(self.fault(&err))
            }
        }
    }

    fn stop_grabbing(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Grabbing(grab) => {
                // Dropping the stream turns streaming off.
                let heads = grab.into_heads();
                log::debug!("{}: stopped after {} grabs", self.info.uri, self.grabbed);
                self.state = State::Open(heads.device);
            }
            other => self.state = other,
        }
        Ok(())
    }

    fn is_grabbing(&self) -> bool {
        matches!(self.state, State::Grabbing(_))
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<Grab> {
        let format = self.format.ok_or(RelayError::NotGrabbing)?;
        let context = self.context;
        let not_grabbing = if self.is_open() {
            RelayError::NotGrabbing
        } else {
            RelayError::NotOpen
        };
        let State::Grabbing(grab) = &mut self.state else {
            return Err(not_grabbing);
        };

        let outcome = grab.with_stream_mut(|stream| {
            stream.set_timeout(timeout);
            stream.next().map(|(buf, meta)| {
                let used = (meta.bytesused as usize).min(buf.len());
                let data = buf.get(..used).unwrap_or(buf).to_vec();
                (data, meta.sequence, meta.timestamp, meta.flags)
            })
        });

        let (data, sequence, timestamp, flags) = match outcome {
            Ok(grabbed) => grabbed,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                return Err(RelayError::Timeout { timeout });
            }
            Err(err) => return Err(self.fault(&err)),
        };

        self.grabbed += 1;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.stop_grabbing()?;
            }
        }

        let image_number = u64::from(sequence);
        if flags.contains(Flags::ERROR) {
            return Ok(Grab::Failed {
                context,
                image_number,
                reason: "driver flagged buffer error".to_owned(),
            });
        }
        let received = data.len();
        let Some(data) = pack_rows(data, self.driver_stride, &format) else {
            return Ok(Grab::Failed {
                context,
                image_number,
                reason: format!("incomplete buffer ({received} bytes)"),
            });
        };

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (timestamp.usec.max(0) as u32).saturating_mul(1000);

        Ok(Grab::Frame(Frame {
            data,
            format,
            metadata: FrameMetadata {
                context,
                image_number,
                timestamp: Duration::new(secs, nanos),
            },
        }))
    }
}
