//! Integration tests using vivid virtual cameras.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded with at least two capture devices
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! Expected vivid configuration:
//! - Device 1: Gray Ramp pattern (gradient) - `test_pattern=20`
//! - Device 2: 100% Colorbar pattern - `test_pattern=1`
//! - Format: 640x480 YUYV
//!
//! Tests will fail if vivid is not available or not configured correctly.

#![cfg(feature = "integration")]

use cam_relay::config::{CaptureMode, RelayConfig, SinkKind, StreamConfig};
use cam_relay::device::V4L2Device;
use cam_relay::mock::{MemorySink, MemorySinkHandle};
use cam_relay::traits::{
    AcquisitionSettings, CameraDevice, FourCC, Frame, FrameSink, Grab, GrabStrategy,
};
use cam_relay::validation::{
    validate_color_bars, validate_frame_order, validate_frame_sequence, validate_gradient,
    validate_partition,
};
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Find all vivid capture devices.
///
/// Uses sysfs to check the driver name before opening, so real cameras are
/// left alone.
fn find_vivid_devices() -> Vec<PathBuf> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    let mut devices = Vec::new();
    for index in 0..10 {
        let name_path = video4linux.join(format!("video{index}")).join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };
        if !name.to_lowercase().contains("vivid") {
            continue;
        }

        // vivid also registers output and metadata nodes
        let path = PathBuf::from(format!("/dev/video{index}"));
        if V4L2Device::open_path(&path).is_ok() {
            devices.push(path);
        }
    }
    devices
}

/// Fail the test if vivid is not available; returns the first device.
macro_rules! require_vivid {
    () => {
        match find_vivid_devices().into_iter().next() {
            Some(path) => path,
            None => {
                panic!(
                    "vivid virtual camera not available.\n\
                     Load vivid with: sudo modprobe vivid n_devs=2\n\
                     Or run unit tests only: cargo test --lib"
                );
            }
        }
    };
}

/// Returns (gradient device, colorbar device).
macro_rules! require_vivid_pair {
    () => {{
        let devices = find_vivid_devices();
        match devices.as_slice() {
            [gradient, colorbar, ..] => (gradient.clone(), colorbar.clone()),
            _ => panic!(
                "Two vivid devices required but found {}.\n\
                 Load vivid with: sudo modprobe vivid n_devs=2\n\
                 Or run unit tests only: cargo test --lib",
                devices.len()
            ),
        }
    }};
}

fn vivid_settings() -> AcquisitionSettings {
    AcquisitionSettings {
        width: 640,
        height: 480,
        pixel_format: FourCC::YUYV,
        frame_rate: Some(30.0),
        exposure: None,
    }
}

fn grab_frames(path: &Path, count: usize) -> Vec<Frame> {
    let mut device = V4L2Device::open_path(path).expect("Failed to open vivid device");
    device
        .configure(&vivid_settings())
        .expect("Failed to configure");
    device
        .start_grabbing(GrabStrategy::OneByOne, None)
        .expect("Failed to start grabbing");

    let mut frames = Vec::with_capacity(count);
    while frames.len() < count {
        match device.retrieve(RETRIEVE_TIMEOUT).expect("Failed to retrieve") {
            Grab::Frame(frame) => frames.push(frame),
            Grab::Failed { reason, .. } => println!("skipping failed grab: {reason}"),
        }
    }
    device.close().expect("Failed to close");
    frames
}

fn vivid_config(devices: &[PathBuf], target: u64, output_dir: &Path) -> RelayConfig {
    RelayConfig {
        frame_rate: 30.0,
        target_frames: Some(target),
        width: 640,
        height: 480,
        pixel_format: FourCC::YUYV,
        exposure_us: 0,
        retrieve_timeout_ms: 2000,
        streams: devices
            .iter()
            .enumerate()
            .map(|(i, path)| StreamConfig {
                device: Some(path.display().to_string()),
                output: output_dir.join(format!("vivid{i}.y4m")),
                target_frames: None,
            })
            .collect(),
        ..RelayConfig::default()
    }
}

fn memory_sinks(count: usize) -> (Vec<Box<dyn FrameSink>>, Vec<MemorySinkHandle>) {
    (0..count)
        .map(|_| {
            let (sink, handle) = MemorySink::new();
            (Box::new(sink) as Box<dyn FrameSink>, handle)
        })
        .unzip()
}

#[test]
#[serial]
fn test_vivid_device_open() {
    let path = require_vivid!();

    let device = V4L2Device::open_path(&path).expect("Failed to open vivid device");
    let info = device.info();
    assert!(info.driver.contains("vivid"), "Expected vivid driver");
    assert!(device.is_open());

    println!("Opened vivid device:");
    println!("  Driver: {}", info.driver);
    println!("  Model: {}", info.model);
    println!("  Bus: {}", info.serial);
}

#[test]
#[serial]
fn test_vivid_configure() {
    let path = require_vivid!();

    let mut device = V4L2Device::open_path(&path).expect("Failed to open vivid device");
    let format = device
        .configure(&vivid_settings())
        .expect("Failed to configure");

    println!("Configured: {}x{} {}", format.width, format.height, format.fourcc);
    assert_eq!(format.width, 640, "Width mismatch");
    assert_eq!(format.height, 480, "Height mismatch");
    assert_eq!(format.fourcc, FourCC::YUYV);
}

#[test]
#[serial]
fn test_vivid_grab_budget_stops_grabbing() {
    let path = require_vivid!();

    let mut device = V4L2Device::open_path(&path).expect("Failed to open vivid device");
    device
        .configure(&vivid_settings())
        .expect("Failed to configure");
    device
        .start_grabbing(GrabStrategy::LatestImageOnly, Some(3))
        .expect("Failed to start grabbing");

    for _ in 0..3 {
        device.retrieve(RETRIEVE_TIMEOUT).expect("Failed to retrieve");
    }
    assert!(!device.is_grabbing(), "grabbing should stop after 3 frames");
    assert!(device.is_open());
}

#[test]
#[serial]
fn test_vivid_capture_multiple_frames() {
    let path = require_vivid!();

    let frames = grab_frames(&path, 10);
    for frame in &frames {
        println!(
            "Frame {}: {} bytes, ts={:?}",
            frame.metadata.image_number,
            frame.data.len(),
            frame.metadata.timestamp
        );
        assert!(frame.data.len() >= frame.format.frame_len());
    }

    let result = validate_frame_order(&frames);
    assert!(result.is_ok(), "Frame order validation failed: {result:?}");
    let result = validate_frame_sequence(&frames);
    assert!(result.is_ok(), "Frame sequence validation failed: {result:?}");
}

#[test]
#[serial]
fn test_vivid_gradient_pattern() {
    let (gradient, _) = require_vivid_pair!();

    let frames = grab_frames(&gradient, 1);
    let frame = frames.first().expect("no frame captured");
    let result = validate_gradient(frame);
    assert!(
        result.is_ok(),
        "Gradient validation failed on first vivid device.\n\
         Expected Gray Ramp pattern (test_pattern=20).\n\
         Error: {result:?}"
    );
}

#[test]
#[serial]
fn test_vivid_colorbar_pattern() {
    let (_, colorbar) = require_vivid_pair!();

    let frames = grab_frames(&colorbar, 1);
    let frame = frames.first().expect("no frame captured");
    let result = validate_color_bars(frame);
    assert!(
        result.is_ok(),
        "Color bars validation failed on second vivid device.\n\
         Expected 100% Colorbar pattern (test_pattern=1).\n\
         Error: {result:?}"
    );
}

#[test]
#[serial]
fn test_vivid_shared_relay_partitions_streams() {
    let (gradient, colorbar) = require_vivid_pair!();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = vivid_config(&[gradient.clone(), colorbar.clone()], 20, dir.path());
    let (sinks, handles) = memory_sinks(2);

    let devices = vec![
        V4L2Device::new_path(&gradient),
        V4L2Device::new_path(&colorbar),
    ];
    let report = cam_relay::record_shared(devices, &config, sinks).expect("relay failed");
    assert!(report.is_complete(), "short streams: {report:?}");

    for (context, handle) in handles.iter().enumerate() {
        assert_eq!(handle.len(), 20);
        assert!(handle.finished());
        handle.with_frames(|frames| {
            assert!(validate_partition(frames, context).is_ok());
            assert!(validate_frame_order(frames).is_ok());
        });
    }
    handles
        .first()
        .expect("gradient sink")
        .with_frames(|frames| assert!(frames.iter().all(|f| validate_gradient(f).is_ok())));
    handles
        .get(1)
        .expect("colorbar sink")
        .with_frames(|frames| assert!(frames.iter().all(|f| validate_color_bars(f).is_ok())));
}

#[test]
#[serial]
fn test_vivid_threaded_record_to_y4m() {
    let (gradient, colorbar) = require_vivid_pair!();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = vivid_config(&[gradient, colorbar], 15, dir.path());
    config.mode = CaptureMode::Threaded;
    config.sink.kind = SinkKind::Y4m;

    let report = cam_relay::record(&config).expect("record failed");
    assert!(report.is_complete(), "short streams: {report:?}");

    // YUYV is repacked to planar 4:2:2: 640*480*2 bytes plus "FRAME\n"
    let per_frame = 640 * 480 * 2 + 6;
    for stream in &config.streams {
        let len = fs::metadata(&stream.output).expect("output missing").len();
        let header = len - 15 * per_frame;
        assert!(header > 0 && header < 128, "unexpected size {len}");
    }
}
