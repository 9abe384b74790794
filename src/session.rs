//! Capture sessions: open devices, configure them, relay, close.
//!
//! Two scheduling models are offered. [`record_shared`] multiplexes every
//! device through one [`CameraArray`] and a single relay loop.
//! [`record_threaded`] gives each stream its own thread running its own
//! relay; threads share nothing and stop independently.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crate::array::CameraArray;
use crate::config::{CaptureMode, RelayConfig, SinkConfig};
use crate::device::{self, V4L2Device};
use crate::error::{RelayError, Result};
use crate::mock::MockDevice;
use crate::relay::{FrameRelay, RelayReport, StreamReport};
use crate::sink::open_sink;
use crate::traits::{
    AcquisitionSettings, CameraDevice, DeviceInfo, DeviceSource, Format, FrameSink, SinkSpec,
};

/// A device handle that can be moved to a grab thread.
pub type BoxedDevice = Box<dyn CameraDevice + Send>;

/// Prefix of synthetic device URIs.
pub const STUB_SCHEME: &str = "stub://";

/// Create a device handle from a URI.
///
/// `stub://N` yields a synthetic device; `/dev/videoN` or a bare index
/// yields a V4L2 device. The device is not opened.
pub fn open_device(uri: &str) -> Result<BoxedDevice> {
    if let Some(rest) = uri.strip_prefix(STUB_SCHEME) {
        let info = DeviceInfo {
            driver: "mock".to_owned(),
            model: "Synthetic Camera".to_owned(),
            serial: format!("stub-{rest}"),
            uri: uri.to_owned(),
        };
        return Ok(Box::new(MockDevice::new().with_info(info)));
    }
    if let Ok(index) = uri.parse::<u32>() {
        return Ok(Box::new(V4L2Device::new_index(index)));
    }
    if uri.starts_with('/') {
        return Ok(Box::new(V4L2Device::new_path(uri)));
    }
    Err(RelayError::DeviceNotFound(uri.to_owned()))
}

/// Device handles for every configured stream.
///
/// Streams without a device take the enumerated V4L2 devices in order.
pub fn resolve_devices(config: &RelayConfig) -> Result<Vec<BoxedDevice>> {
    let needs_enumeration = config.streams.iter().any(|stream| stream.device.is_none());
    let mut enumerated = if needs_enumeration {
        device::enumerate()?.into_iter()
    } else {
        Vec::new().into_iter()
    };
    let mut devices = Vec::with_capacity(config.streams.len());

    for stream in &config.streams {
        let uri = match &stream.device {
            Some(uri) => uri.clone(),
            None => enumerated.next().ok_or(RelayError::EnumerationEmpty)?.uri,
        };
        devices.push(open_device(&uri)?);
    }
    Ok(devices)
}

/// A stream's sink, opened now or once its device has been configured.
///
/// Drivers may adjust the requested size, so file sinks are deferred until
/// the negotiated [`Format`] is known.
pub enum SinkSlot {
    /// An already open sink, used as is.
    Ready(Box<dyn FrameSink>),
    /// A sink opened from the device's negotiated format.
    Deferred {
        /// Sink implementation and encoder options.
        config: SinkConfig,
        /// Output file.
        path: PathBuf,
        /// Playback frame rate of the output.
        frame_rate: f64,
    },
}

impl SinkSlot {
    /// Turn the slot into a sink for frames of `format`.
    pub fn open(self, format: Format) -> Result<Box<dyn FrameSink>> {
        match self {
            Self::Ready(sink) => Ok(sink),
            Self::Deferred {
                config,
                path,
                frame_rate,
            } => open_sink(
                &config,
                SinkSpec {
                    path,
                    format,
                    frame_rate,
                },
            ),
        }
    }
}

impl From<Box<dyn FrameSink>> for SinkSlot {
    fn from(sink: Box<dyn FrameSink>) -> Self {
        Self::Ready(sink)
    }
}

/// One deferred sink per configured stream.
pub fn sink_slots(config: &RelayConfig) -> Vec<SinkSlot> {
    config
        .streams
        .iter()
        .map(|stream| SinkSlot::Deferred {
            config: config.sink.clone(),
            path: stream.output.clone(),
            frame_rate: config.frame_rate,
        })
        .collect()
}

fn open_device_and_configure<D: CameraDevice>(
    device: &mut D,
    settings: &AcquisitionSettings,
) -> Result<Format> {
    device.open()?;
    let format = device.configure(settings)?;
    log::info!(
        "stream {}: {} configured {}x{} {}",
        device.context(),
        device.info().uri,
        format.width,
        format.height,
        format.fourcc
    );
    Ok(format)
}

/// Open and configure every device, closing them all if any step fails.
///
/// Returns the format each device settled on.
fn prepare<D: CameraDevice>(devices: &mut [D], config: &RelayConfig) -> Result<Vec<Format>> {
    let settings = config.acquisition();
    let prepared: Result<Vec<Format>> = devices
        .iter_mut()
        .map(|device| open_device_and_configure(device, &settings))
        .collect();
    if prepared.is_err() {
        close_all(devices);
    }
    prepared
}

fn open_slots<S: Into<SinkSlot>>(
    slots: Vec<S>,
    formats: &[Format],
) -> Result<Vec<Box<dyn FrameSink>>> {
    slots
        .into_iter()
        .zip(formats)
        .map(|(slot, format)| slot.into().open(*format))
        .collect()
}

fn close_all<D: CameraDevice>(devices: &mut [D]) {
    for device in devices {
        if let Err(err) = device.close() {
            log::warn!("failed to close {}: {err}", device.info().uri);
        }
    }
}

fn check_counts(devices: usize, sinks: usize, config: &RelayConfig) -> Result<()> {
    if devices == 0 {
        return Err(RelayError::EnumerationEmpty);
    }
    if devices != sinks {
        return Err(RelayError::Config(format!("{devices} devices but {sinks} sinks")));
    }
    if !config.streams.is_empty() && config.streams.len() != devices {
        return Err(RelayError::Config(format!(
            "{} streams configured for {devices} devices",
            config.streams.len()
        )));
    }
    Ok(())
}

/// Record every stream through one shared grab queue.
///
/// Device `i` gets context `i` and feeds `sinks[i]`. Deferred sinks are
/// opened once every device is configured.
pub fn record_shared<D, S>(
    devices: Vec<D>,
    config: &RelayConfig,
    sinks: Vec<S>,
) -> Result<RelayReport>
where
    D: CameraDevice + Send + 'static,
    S: Into<SinkSlot>,
{
    check_counts(devices.len(), sinks.len(), config)?;
    let mut array = CameraArray::new(devices);
    let formats = prepare(array.devices_mut(), config)?;
    let sinks = match open_slots(sinks, &formats) {
        Ok(sinks) => sinks,
        Err(err) => {
            close_all(array.devices_mut());
            return Err(err);
        }
    };

    // On failure the array is consumed; dropping the sinks finishes them.
    let mut grabbing = array.start_grabbing(config.grab_strategy, None, config.queue_depth)?;

    let mut relay = FrameRelay::new(&mut grabbing, config.relay_policy());
    for (context, sink) in sinks.into_iter().enumerate() {
        relay.add_stream(context, config.target_for(context), sink)?;
    }
    log::info!("recording {} streams (shared loop)", relay.stream_count());
    let outcome = relay.run();

    let mut devices = match grabbing.stop() {
        Ok(devices) => devices,
        Err(err) => {
            log::error!("failed to stop grabbing: {err}");
            return outcome.and(Err(err));
        }
    };
    close_all(&mut devices);
    outcome
}

type StreamHandle = (usize, JoinHandle<Result<RelayReport>>);

/// Record every stream on its own thread.
///
/// Each thread opens, configures and drains its device up to its own target,
/// then closes it. Threads do not wait for or signal each other; the first
/// stream error is returned once all threads have finished.
pub fn record_threaded<D, S>(
    devices: Vec<D>,
    config: &RelayConfig,
    sinks: Vec<S>,
) -> Result<RelayReport>
where
    D: CameraDevice + Send + 'static,
    S: Into<SinkSlot>,
{
    check_counts(devices.len(), sinks.len(), config)?;

    let mut handles = Vec::with_capacity(devices.len());
    let mut spawn_err = None;
    for (context, (mut device, sink)) in devices.into_iter().zip(sinks).enumerate() {
        device.set_context(context);
        let target = config.target_for(context);
        let stream_config = config.clone();
        let slot = sink.into();
        let spawned = thread::Builder::new()
            .name(format!("stream-{context}"))
            .spawn(move || record_stream(device, &stream_config, target, slot));
        match spawned {
            Ok(handle) => handles.push((context, handle)),
            Err(err) => {
                log::error!("stream {context}: failed to spawn thread: {err}");
                spawn_err = Some(RelayError::from(err));
                break;
            }
        }
    }
    log::info!("recording {} streams (thread per stream)", handles.len());
    join_streams(handles, spawn_err)
}

/// Wait for every stream thread and merge their reports.
///
/// `first_err`, if set, wins over any stream error.
fn join_streams(
    handles: Vec<StreamHandle>,
    mut first_err: Option<RelayError>,
) -> Result<RelayReport> {
    let mut report = RelayReport::default();
    for (context, handle) in handles {
        match handle.join() {
            Ok(Ok(mut stream_report)) => {
                report.timeouts_skipped += stream_report.timeouts_skipped;
                report.unrouted += stream_report.unrouted;
                report.streams.append(&mut stream_report.streams);
            }
            Ok(Err(err)) => {
                log::error!("stream {context} failed: {err}");
                first_err.get_or_insert(err);
            }
            Err(_) => {
                first_err.get_or_insert(RelayError::DeviceFault {
                    context,
                    message: "stream thread panicked".to_owned(),
                });
            }
        }
    }
    first_err.map_or(Ok(report), Err)
}

/// One stream end to end: open, configure, grab `target` frames, close.
fn record_stream<D: CameraDevice>(
    mut device: D,
    config: &RelayConfig,
    target: u64,
    slot: SinkSlot,
) -> Result<RelayReport> {
    let context = device.context();
    let sink = open_device_and_configure(&mut device, &config.acquisition())
        .and_then(|format| slot.open(format))
        .and_then(|sink| {
            device.start_grabbing(config.grab_strategy, None)?;
            Ok(sink)
        });
    let sink = match sink {
        Ok(sink) => sink,
        Err(err) => {
            close_all(std::slice::from_mut(&mut device));
            return Err(err);
        }
    };

    let outcome = FrameRelay::new(DeviceSource::new(&mut device), config.relay_policy())
        .with_stream(context, target, sink)
        .and_then(FrameRelay::run);
    if let Err(err) = device.close() {
        log::warn!("stream {context}: failed to close {}: {err}", device.info().uri);
    }
    outcome
}

/// Record according to `config`: resolve devices, configure them, open
/// sinks at the negotiated formats, relay.
pub fn record(config: &RelayConfig) -> Result<RelayReport> {
    config.validate()?;
    if config.streams.is_empty() {
        return Err(RelayError::Config("no streams configured".to_owned()));
    }
    let devices = resolve_devices(config)?;
    let sinks = sink_slots(config);

    match config.mode {
        CaptureMode::Shared => record_shared(devices, config, sinks),
        CaptureMode::Threaded => record_threaded(devices, config, sinks),
    }
}

/// Streams that stopped short of their target.
pub fn short_streams(report: &RelayReport) -> impl Iterator<Item = &StreamReport> {
    report.streams.iter().filter(|stream| !stream.is_complete())
}
