//! Synthetic devices, sources and sinks.
//!
//! `MockDevice` is also reachable at runtime through `stub://<n>` device
//! URIs, which is how the relay is exercised without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::traits::{
    AcquisitionSettings, CameraDevice, DeviceInfo, Format, FourCC, Frame, FrameMetadata,
    FrameSink, FrameSource, Grab, GrabStrategy,
};

/// One scripted outcome of a `MockDevice::retrieve` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// Produce a frame.
    Frame,
    /// Report a failed grab.
    Fail,
    /// Let the retrieve time out.
    Timeout,
    /// Report an unrecoverable device error.
    Fault,
}

/// Mock device for testing without hardware.
pub struct MockDevice {
    info: DeviceInfo,
    format: Format,
    pattern: TestPattern,
    context: usize,
    open: bool,
    grabbing: bool,
    strategy: GrabStrategy,
    remaining: Option<u64>,
    image_number: u64,
    frame_interval: Option<Duration>,
    script: VecDeque<MockEvent>,
    settings: Option<AcquisitionSettings>,
    width_alignment: u32,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            info: DeviceInfo {
                driver: "mock".to_owned(),
                model: "Mock Camera".to_owned(),
                serial: "mock:0".to_owned(),
                uri: "stub://0".to_owned(),
            },
            format: Format::new(64, 48, FourCC::GREY),
            pattern: TestPattern::Gradient,
            context: 0,
            open: false,
            grabbing: false,
            strategy: GrabStrategy::default(),
            remaining: None,
            image_number: 0,
            frame_interval: None,
            script: VecDeque::new(),
            settings: None,
            width_alignment: 1,
        }
    }

    /// Set the format for this mock device.
    #[must_use]
    pub const fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set the test pattern for frame generation.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Sleep this long before every grab, to emulate a frame rate.
    #[must_use]
    pub const fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Queue scripted outcomes consumed before default frame production.
    #[must_use]
    pub fn with_script<I: IntoIterator<Item = MockEvent>>(mut self, events: I) -> Self {
        self.script.extend(events);
        self
    }

    /// Round configured widths down to a multiple of `alignment`, the way
    /// drivers adjust sizes they cannot deliver.
    #[must_use]
    pub const fn with_width_alignment(mut self, alignment: u32) -> Self {
        self.width_alignment = if alignment == 0 { 1 } else { alignment };
        self
    }

    /// Set the identifying information for this mock device.
    #[must_use]
    pub fn with_info(mut self, info: DeviceInfo) -> Self {
        self.info = info;
        self
    }

    /// Settings passed to the last `configure` call.
    pub const fn settings(&self) -> Option<&AcquisitionSettings> {
        self.settings.as_ref()
    }

    /// Strategy passed to the last `start_grabbing` call.
    pub const fn strategy(&self) -> GrabStrategy {
        self.strategy
    }

    fn next_frame(&mut self) -> Frame {
        let image_number = self.image_number;
        self.image_number += 1;
        Frame {
            data: generate_test_frame(&self.format, self.pattern),
            format: self.format,
            metadata: FrameMetadata {
                context: self.context,
                image_number,
                timestamp: Duration::from_millis(image_number * 50), // 20fps
            },
        }
    }

    fn consume_budget(&mut self) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.grabbing = false;
            }
        }
    }
}

impl CameraDevice for MockDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.grabbing = false;
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn configure(&mut self, settings: &AcquisitionSettings) -> Result<Format> {
        if !self.open {
            return Err(RelayError::NotOpen);
        }
        let width = settings.width / self.width_alignment * self.width_alignment;
        let format = Format::new(width, settings.height, settings.pixel_format);
        if format.size == 0 {
            return Err(RelayError::FormatNotSupported(format));
        }
        self.format = format;
        self.settings = Some(settings.clone());
        if let Some(fps) = settings.frame_rate.filter(|fps| *fps > 0.0) {
            self.frame_interval = Some(Duration::from_secs_f64(1.0 / fps));
        }
        Ok(self.format)
    }

    fn context(&self) -> usize {
        self.context
    }

    fn set_context(&mut self, context: usize) {
        self.context = context;
    }

    fn start_grabbing(&mut self, strategy: GrabStrategy, max_frames: Option<u64>) -> Result<()> {
        if !self.open {
            return Err(RelayError::NotOpen);
        }
        self.strategy = strategy;
        self.remaining = max_frames;
        self.grabbing = max_frames != Some(0);
        Ok(())
    }

    fn stop_grabbing(&mut self) -> Result<()> {
        self.grabbing = false;
        Ok(())
    }

    fn is_grabbing(&self) -> bool {
        self.grabbing
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<Grab> {
        if !self.open {
            return Err(RelayError::NotOpen);
        }
        if !self.grabbing {
            return Err(RelayError::NotGrabbing);
        }

        match self.script.pop_front().unwrap_or(MockEvent::Frame) {
            MockEvent::Frame => {
                if let Some(interval) = self.frame_interval {
                    thread::sleep(interval.min(timeout));
                }
                self.consume_budget();
                Ok(Grab::Frame(self.next_frame()))
            }
            MockEvent::Fail => {
                let image_number = self.image_number;
                self.image_number += 1;
                self.consume_budget();
                Ok(Grab::Failed {
                    context: self.context,
                    image_number,
                    reason: "mock grab failure".to_owned(),
                })
            }
            MockEvent::Timeout => {
                thread::sleep(timeout);
                Err(RelayError::Timeout { timeout })
            }
            MockEvent::Fault => {
                self.grabbing = false;
                Err(RelayError::DeviceFault {
                    context: self.context,
                    message: "mock device fault".to_owned(),
                })
            }
        }
    }
}

/// Replays a fixed sequence of grab outcomes, then reports the source closed.
pub struct ScriptedSource {
    events: VecDeque<Result<Grab>>,
}

impl ScriptedSource {
    /// Create a source that yields `events` in order.
    pub fn new<I: IntoIterator<Item = Result<Grab>>>(events: I) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }

    /// Outcomes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl FrameSource for ScriptedSource {
    fn next_grab(&mut self, _timeout: Duration) -> Result<Grab> {
        self.events.pop_front().unwrap_or(Err(RelayError::SourceClosed))
    }
}

/// Build a small GREY frame tagged with `context` and `image_number`.
pub fn tagged_frame(context: usize, image_number: u64) -> Frame {
    let format = Format::new(8, 2, FourCC::GREY);
    #[allow(clippy::cast_possible_truncation)]
    let data = vec![(context as u8).wrapping_mul(100); format.frame_len()];
    Frame {
        data,
        format,
        metadata: FrameMetadata {
            context,
            image_number,
            timestamp: Duration::from_millis(image_number * 50),
        },
    }
}

#[derive(Default)]
struct MemorySinkState {
    frames: Vec<Frame>,
    finished: bool,
    finish_calls: u32,
}

/// Inspection handle for a [`MemorySink`] that has been moved into a relay.
#[derive(Clone, Default)]
pub struct MemorySinkHandle {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySinkHandle {
    fn lock(&self) -> MutexGuard<'_, MemorySinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` over the recorded frames.
    pub fn with_frames<R, F: FnOnce(&[Frame]) -> R>(&self, f: F) -> R {
        f(&self.lock().frames)
    }

    /// Image numbers of the recorded frames, in write order.
    pub fn image_numbers(&self) -> Vec<u64> {
        self.lock()
            .frames
            .iter()
            .map(|frame| frame.metadata.image_number)
            .collect()
    }

    /// Number of recorded frames.
    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    /// Whether no frames were recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the sink was finished.
    pub fn finished(&self) -> bool {
        self.lock().finished
    }

    /// How many times `finish` was called.
    pub fn finish_calls(&self) -> u32 {
        self.lock().finish_calls
    }
}

/// Sink that keeps frames in memory.
pub struct MemorySink {
    handle: MemorySinkHandle,
    fail_after: Option<usize>,
}

impl MemorySink {
    /// Create a sink and a handle to inspect it.
    pub fn new() -> (Self, MemorySinkHandle) {
        let handle = MemorySinkHandle::default();
        (
            Self {
                handle: handle.clone(),
                fail_after: None,
            },
            handle,
        )
    }

    /// Make `write_frame` fail once `count` frames have been stored.
    #[must_use]
    pub const fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let mut state = self.handle.lock();
        if state.finished {
            return Err(RelayError::Encoder("sink already finished".to_owned()));
        }
        if self.fail_after.is_some_and(|limit| state.frames.len() >= limit) {
            return Err(RelayError::Io(std::io::Error::other("memory sink full")));
        }
        state.frames.push(frame);
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.handle.lock().frames.len() as u64
    }

    fn finish(&mut self) -> Result<()> {
        let mut state = self.handle.lock();
        state.finish_calls += 1;
        state.finished = true;
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.handle.lock().finished = true;
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// Eight vertical bars (SMPTE color bars, or their luma for GREY).
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// YUV values of the eight SMPTE bars: White, Yellow, Cyan, Green, Magenta,
/// Red, Blue, Black.
pub const COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

/// Generate test frame data based on pattern.
fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let mut data = vec![0u8; format.frame_len()];
    let bar_width = (format.width / 8).max(1);

    for x in 0..format.width {
        let (y_val, u_val, v_val) = match pattern {
            TestPattern::ColorBars => {
                let bar_idx = (x / bar_width).min(7) as usize;
                COLOR_BARS.get(bar_idx).copied().unwrap_or((16, 128, 128))
            }
            #[allow(clippy::cast_possible_truncation)]
            TestPattern::Gradient => (((x * 255) / format.width.max(1)) as u8, 128, 128),
            TestPattern::Solid(y, u, v) => (y, u, v),
        };
        for y in 0..format.height {
            write_pixel(&mut data, format, x, y, (y_val, u_val, v_val));
        }
    }

    data
}

fn write_pixel(data: &mut [u8], format: &Format, x: u32, y: u32, (y_val, u, v): (u8, u8, u8)) {
    let row = (y * format.stride) as usize;
    match &format.fourcc.0 {
        b"GREY" => {
            if let Some(px) = data.get_mut(row + x as usize) {
                *px = y_val;
            }
        }
        b"YUYV" => {
            // [Y0 U Y1 V]: chroma shared by each pixel pair
            let offset = row + x as usize * 2;
            let chroma = if x % 2 == 0 { u } else { v };
            if let Some(px) = data.get_mut(offset) {
                *px = y_val;
            }
            if let Some(px) = data.get_mut(offset + 1) {
                *px = chroma;
            }
        }
        _ => {
            // RGB3 and friends: replicate luma
            let bpp = format.fourcc.bytes_per_pixel().unwrap_or(1) as usize;
            let offset = row + x as usize * bpp;
            for i in 0..bpp {
                if let Some(px) = data.get_mut(offset + i) {
                    *px = y_val;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_mock() -> MockDevice {
        let mut device = MockDevice::new();
        device.open().expect("open should succeed");
        device
    }

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new();
        assert_eq!(device.info().driver, "mock");
        assert!(!device.is_open());
        assert!(!device.is_grabbing());
    }

    #[test]
    fn test_mock_device_configure() {
        let mut device = open_mock();
        let settings = AcquisitionSettings {
            width: 320,
            height: 240,
            ..AcquisitionSettings::default()
        };
        let format = device.configure(&settings).expect("configure should succeed");
        assert_eq!(format.width, 320);
        assert_eq!(format.fourcc, FourCC::GREY);
        assert_eq!(device.settings(), Some(&settings));
    }

    #[test]
    fn test_mock_width_alignment_adjusts_format() {
        let mut device = MockDevice::new().with_width_alignment(8);
        device.open().expect("open should succeed");
        let settings = AcquisitionSettings {
            width: 642,
            height: 10,
            ..AcquisitionSettings::default()
        };
        let format = device.configure(&settings).expect("configure should succeed");
        assert_eq!((format.width, format.stride), (640, 640));

        device
            .start_grabbing(GrabStrategy::OneByOne, Some(1))
            .expect("start should succeed");
        let grab = device
            .retrieve(Duration::from_millis(10))
            .expect("retrieve should succeed");
        assert!(
            matches!(&grab, Grab::Frame(frame) if frame.data.len() == 6400),
            "unexpected grab {grab:?}"
        );
    }

    #[test]
    fn test_mock_rejects_compressed_format() {
        let mut device = open_mock();
        let settings = AcquisitionSettings {
            pixel_format: FourCC::MJPG,
            ..AcquisitionSettings::default()
        };
        assert!(matches!(
            device.configure(&settings),
            Err(RelayError::FormatNotSupported(_))
        ));
    }

    #[test]
    fn test_retrieve_requires_open_and_grabbing() {
        let mut device = MockDevice::new();
        assert!(matches!(
            device.retrieve(Duration::ZERO),
            Err(RelayError::NotOpen)
        ));
        device.open().expect("open should succeed");
        assert!(matches!(
            device.retrieve(Duration::ZERO),
            Err(RelayError::NotGrabbing)
        ));
    }

    #[test]
    fn test_mock_stream_capture() {
        let mut device = open_mock();
        device.set_context(1);
        device
            .start_grabbing(GrabStrategy::OneByOne, None)
            .expect("start should succeed");

        let Grab::Frame(frame1) = device.retrieve(Duration::ZERO).expect("retrieve") else {
            unreachable!("default event is a frame");
        };
        assert_eq!(frame1.metadata.image_number, 0);
        assert_eq!(frame1.context(), 1);
        assert_eq!(frame1.data.len(), frame1.format.frame_len());

        let grab = device.retrieve(Duration::ZERO).expect("retrieve");
        assert!(matches!(grab, Grab::Frame(ref f) if f.metadata.image_number == 1));
    }

    #[test]
    fn test_max_frames_stops_grabbing() {
        let mut device = open_mock();
        device
            .start_grabbing(GrabStrategy::LatestImageOnly, Some(2))
            .expect("start should succeed");
        assert_eq!(device.strategy(), GrabStrategy::LatestImageOnly);
        device.retrieve(Duration::ZERO).expect("first");
        assert!(device.is_grabbing());
        device.retrieve(Duration::ZERO).expect("second");
        assert!(!device.is_grabbing());
    }

    #[test]
    fn test_scripted_events() {
        let mut device = open_mock().with_script([
            MockEvent::Fail,
            MockEvent::Timeout,
            MockEvent::Fault,
        ]);
        device
            .start_grabbing(GrabStrategy::OneByOne, None)
            .expect("start should succeed");

        let grab = device.retrieve(Duration::ZERO).expect("failed grab is Ok");
        assert!(matches!(grab, Grab::Failed { image_number: 0, .. }));
        assert!(device
            .retrieve(Duration::from_millis(1))
            .is_err_and(|err| err.is_timeout()));
        assert!(matches!(
            device.retrieve(Duration::ZERO),
            Err(RelayError::DeviceFault { .. })
        ));
        assert!(!device.is_grabbing());
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars);

        assert_eq!(data.len(), 640 * 480 * 2);
        // First bar should be white (Y=235)
        assert_eq!(data.first().copied(), Some(235));
    }

    #[test]
    fn test_gradient_pattern_grey() {
        let format = Format::new(640, 480, FourCC::GREY);
        let data = generate_test_frame(&format, TestPattern::Gradient);

        assert!(data.first().is_some_and(|y| *y < 10));
        let last_row_start = 479 * 640;
        assert!(data.get(last_row_start + 638).is_some_and(|y| *y > 200));
    }

    #[test]
    fn test_solid_pattern_yuyv() {
        let format = Format::new(64, 64, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Solid(128, 64, 192));

        assert_eq!(data.get(..4), Some(&[128, 64, 128, 192][..]));
    }

    #[test]
    fn test_memory_sink_records_and_finishes() {
        let (mut sink, handle) = MemorySink::new();
        sink.write_frame(tagged_frame(0, 3)).expect("write");
        sink.finish().expect("finish");
        sink.finish().expect("finish twice");

        assert_eq!(handle.image_numbers(), vec![3]);
        assert!(handle.finished());
        assert_eq!(handle.finish_calls(), 2);
        assert!(sink.write_frame(tagged_frame(0, 4)).is_err());
    }

    #[test]
    fn test_scripted_source_closes() {
        let mut source = ScriptedSource::new([Ok(Grab::Frame(tagged_frame(1, 0)))]);
        assert_eq!(source.remaining(), 1);
        assert!(source.next_grab(Duration::ZERO).is_ok());
        assert!(matches!(
            source.next_grab(Duration::ZERO),
            Err(RelayError::SourceClosed)
        ));
    }
}
