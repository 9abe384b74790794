//! Frame validation utilities for recorded streams.
//!
//! These check what a sink received: per-stream ordering, partitioning by
//! context, and test-pattern content. Useful for integration testing with
//! virtual cameras.

use crate::error::{RelayError, Result};
use crate::traits::Frame;

/// Expected luma of the eight color bars: White, Yellow, Cyan, Green,
/// Magenta, Red, Blue, Black.
const COLOR_BAR_LUMA: [u8; 8] = [235, 210, 170, 145, 106, 81, 41, 16];

/// Tolerance for luma matching (accounts for driver rounding).
const LUMA_TOLERANCE: u8 = 15;

const fn mismatch(message: String) -> RelayError {
    RelayError::Validation(message)
}

/// Validates that image numbers never decrease.
///
/// Gaps are allowed; failed grabs leave holes in the numbering.
pub fn validate_frame_order(frames: &[Frame]) -> Result<()> {
    for (i, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if curr.metadata.image_number < prev.metadata.image_number {
                return Err(mismatch(format!(
                    "image number went backwards at index {}: {} after {}",
                    i + 1,
                    curr.metadata.image_number,
                    prev.metadata.image_number
                )));
            }
        }
    }
    Ok(())
}

/// Validates that a sequence of frames has incrementing image numbers.
///
/// # Errors
///
/// Fails if the slice is empty or any image number doesn't increment by
/// exactly 1 from the previous.
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<()> {
    if frames.is_empty() {
        return Err(mismatch("cannot validate empty frame sequence".to_owned()));
    }

    for (i, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.metadata.image_number + 1;
            if curr.metadata.image_number != expected {
                return Err(mismatch(format!(
                    "frame sequence gap at index {}: expected {expected}, got {}",
                    i + 1,
                    curr.metadata.image_number
                )));
            }
        }
    }

    Ok(())
}

/// Validates that every frame carries the given context.
pub fn validate_partition(frames: &[Frame], context: usize) -> Result<()> {
    match frames.iter().position(|frame| frame.context() != context) {
        Some(index) => Err(mismatch(format!(
            "frame {index} belongs to stream {}, expected stream {context}",
            frames.get(index).map_or(context, Frame::context)
        ))),
        None => Ok(()),
    }
}

/// Validates that a frame contains the color bar pattern.
///
/// Samples the center of each of the 8 vertical bars and compares its luma.
pub fn validate_color_bars(frame: &Frame) -> Result<()> {
    let bar_width = frame.format.width / 8;
    let center_y = frame.format.height / 2;

    for (bar_idx, expected) in COLOR_BAR_LUMA.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let sample_x = (bar_idx as u32 * bar_width) + (bar_width / 2);

        let actual = frame.luma_at(sample_x, center_y).ok_or_else(|| {
            mismatch(format!("failed to get pixel at ({sample_x}, {center_y})"))
        })?;

        if actual.abs_diff(*expected) > LUMA_TOLERANCE {
            return Err(mismatch(format!(
                "color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected Y={expected}, got Y={actual}"
            )));
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Luma along the center row must not decrease (beyond rounding) and must
/// change by at least 50 across the frame.
pub fn validate_gradient(frame: &Frame) -> Result<()> {
    let center_y = frame.format.height / 2;

    // Sample every 10 pixels to check for monotonic increase
    let mut first: Option<u8> = None;
    let mut prev: Option<u8> = None;

    for x in (0..frame.format.width).step_by(10) {
        let luma = frame
            .luma_at(x, center_y)
            .ok_or_else(|| mismatch(format!("failed to get pixel at ({x}, {center_y})")))?;

        first.get_or_insert(luma);
        if let Some(prev) = prev {
            if luma.saturating_add(1) < prev {
                return Err(mismatch(format!(
                    "gradient not monotonically increasing at x={x}: {luma} < previous {prev}"
                )));
            }
        }
        prev = Some(luma);
    }

    if let (Some(first), Some(last)) = (first, prev) {
        let change = last.saturating_sub(first);
        if change < 50 {
            return Err(mismatch(format!(
                "insufficient luminance change for gradient: {change} (expected at least 50)"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{tagged_frame, MockDevice, TestPattern};
    use crate::traits::{AcquisitionSettings, CameraDevice, FourCC, Grab, GrabStrategy};
    use std::time::Duration;

    fn grab_pattern(pattern: TestPattern, pixel_format: FourCC) -> Frame {
        let mut device = MockDevice::new().with_pattern(pattern);
        device.open().expect("open failed");
        device
            .configure(&AcquisitionSettings {
                pixel_format,
                frame_rate: None,
                ..AcquisitionSettings::default()
            })
            .expect("configure failed");
        device
            .start_grabbing(GrabStrategy::OneByOne, Some(1))
            .expect("start failed");
        match device.retrieve(Duration::ZERO).expect("retrieve failed") {
            Grab::Frame(frame) => frame,
            Grab::Failed { reason, .. } => unreachable!("mock grab failed: {reason}"),
        }
    }

    #[test]
    fn test_validate_color_bars_success() {
        for fourcc in [FourCC::GREY, FourCC::YUYV] {
            let frame = grab_pattern(TestPattern::ColorBars, fourcc);
            let result = validate_color_bars(&frame);
            assert!(result.is_ok(), "color bars should validate: {result:?}");
        }
    }

    #[test]
    fn test_validate_color_bars_wrong_pattern() {
        let frame = grab_pattern(TestPattern::Gradient, FourCC::GREY);
        assert!(validate_color_bars(&frame).is_err());
    }

    #[test]
    fn test_validate_gradient_success() {
        let frame = grab_pattern(TestPattern::Gradient, FourCC::YUYV);
        let result = validate_gradient(&frame);
        assert!(result.is_ok(), "gradient should validate: {result:?}");
    }

    #[test]
    fn test_validate_gradient_wrong_pattern() {
        let frame = grab_pattern(TestPattern::Solid(128, 128, 128), FourCC::GREY);
        assert!(validate_gradient(&frame).is_err());
    }

    #[test]
    fn test_validate_frame_sequence() {
        let frames: Vec<Frame> = (0..5).map(|n| tagged_frame(0, n)).collect();
        assert!(validate_frame_sequence(&frames).is_ok());
        assert!(validate_frame_sequence(&[]).is_err());

        let gapped = vec![tagged_frame(0, 0), tagged_frame(0, 1), tagged_frame(0, 3)];
        assert!(validate_frame_sequence(&gapped).is_err());
        assert!(validate_frame_order(&gapped).is_ok());
    }

    #[test]
    fn test_validate_frame_order_rejects_backwards() {
        let frames = vec![tagged_frame(0, 2), tagged_frame(0, 2), tagged_frame(0, 1)];
        assert!(validate_frame_order(&frames).is_err());
    }

    #[test]
    fn test_validate_partition() {
        let frames = vec![tagged_frame(1, 0), tagged_frame(1, 1)];
        assert!(validate_partition(&frames, 1).is_ok());
        assert!(validate_partition(&frames, 0).is_err());
    }
}
