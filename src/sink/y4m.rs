//! YUV4MPEG2 writer.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::error::{RelayError, Result};
use crate::traits::{FourCC, Frame, FrameSink, SinkSpec};

use super::check_frame_len;

/// Writes frames into a `.y4m` container.
///
/// GREY frames are stored as `Cmono`; YUYV frames are repacked to planar
/// 4:2:2 (`C422`).
pub struct Y4mSink {
    spec: SinkSpec,
    writer: Option<BufWriter<File>>,
    planar: Vec<u8>,
    frames: u64,
}

impl Y4mSink {
    /// Create the output file and write the stream header.
    pub fn create(spec: SinkSpec) -> Result<Self> {
        let colorspace = match spec.format.fourcc {
            FourCC::GREY => "mono",
            FourCC::YUYV if spec.format.width % 2 == 0 => "422",
            FourCC::YUYV => {
                return Err(RelayError::Config(
                    "YUYV output needs an even frame width".to_owned(),
                ))
            }
            other => return Err(RelayError::UnsupportedPixelFormat(other)),
        };
        let (num, den) = frame_rate_ratio(spec.frame_rate)?;

        let mut writer = BufWriter::new(File::create(&spec.path)?);
        writeln!(
            writer,
            "YUV4MPEG2 W{} H{} F{num}:{den} Ip A1:1 C{colorspace}",
            spec.format.width, spec.format.height
        )?;
        log::info!(
            "y4m sink {} ({}x{} {colorspace} @ {num}:{den})",
            spec.path.display(),
            spec.format.width,
            spec.format.height
        );

        Ok(Self {
            spec,
            writer: Some(writer),
            planar: Vec::new(),
            frames: 0,
        })
    }
}

impl FrameSink for Y4mSink {
    fn write_frame(&mut self, frame: Frame) -> Result<()> {
        check_frame_len(&self.spec, &frame)?;
        let writer = self.writer.as_mut().ok_or_else(|| {
            RelayError::Encoder(format!("{} already finished", self.spec.path.display()))
        })?;

        writer.write_all(b"FRAME\n")?;
        if frame.format.fourcc == FourCC::YUYV {
            yuyv_to_planar(&frame.data, &mut self.planar);
            writer.write_all(&self.planar)?;
        } else {
            writer.write_all(&frame.data)?;
        }
        self.frames += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            log::info!("{}: {} frames", self.spec.path.display(), self.frames);
        }
        Ok(())
    }
}

impl Drop for Y4mSink {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            log::error!("failed to finish {}: {err}", self.spec.path.display());
        }
    }
}

/// Express a frame rate as a reduced `num:den` pair.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn frame_rate_ratio(fps: f64) -> Result<(u64, u64)> {
    if !(fps.is_finite() && fps > 0.0) {
        return Err(RelayError::Config(format!("invalid frame rate {fps}")));
    }
    let num = (fps * 1000.0).round() as u64;
    if num == 0 {
        return Err(RelayError::Config(format!(
            "frame rate {fps} is below the 1/1000 fps y4m resolution"
        )));
    }
    let den = 1000;
    let divisor = gcd(num, den);
    Ok((num / divisor, den / divisor))
}

const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    if a == 0 {
        1
    } else {
        a
    }
}

/// Split packed `[Y0 U Y1 V]` into Y, U and V planes.
fn yuyv_to_planar(packed: &[u8], out: &mut Vec<u8>) {
    let pixels = packed.len() / 2;
    out.clear();
    out.resize(pixels * 2, 0);
    let (luma, chroma) = out.split_at_mut(pixels);
    let (u_plane, v_plane) = chroma.split_at_mut(pixels / 2);

    for (i, quad) in packed.chunks_exact(4).enumerate() {
        if let [y0, u, y1, v] = *quad {
            if let Some(dst) = luma.get_mut(i * 2..i * 2 + 2) {
                dst.copy_from_slice(&[y0, y1]);
            }
            if let Some(dst) = u_plane.get_mut(i) {
                *dst = u;
            }
            if let Some(dst) = v_plane.get_mut(i) {
                *dst = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::tagged_frame;
    use crate::traits::{Format, FrameMetadata};
    use std::time::Duration;

    fn spec(dir: &tempfile::TempDir, format: Format) -> SinkSpec {
        SinkSpec {
            path: dir.path().join("out.y4m"),
            format,
            frame_rate: 20.0,
        }
    }

    #[test]
    fn test_writes_header_and_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let frame = tagged_frame(1, 0);
        let spec = spec(&dir, frame.format);
        let path = spec.path.clone();

        let mut sink = Y4mSink::create(spec).expect("create");
        sink.write_frame(frame).expect("write");
        sink.write_frame(tagged_frame(1, 1)).expect("write");
        sink.finish().expect("finish");
        assert_eq!(sink.frames_written(), 2);

        let bytes = std::fs::read(path).expect("read output");
        let header = b"YUV4MPEG2 W8 H2 F20:1 Ip A1:1 Cmono\n";
        assert!(bytes.starts_with(header));
        assert_eq!(bytes.len(), header.len() + 2 * (6 + 16));
    }

    #[test]
    fn test_rejects_wrong_frame_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink =
            Y4mSink::create(spec(&dir, Format::new(16, 16, FourCC::GREY))).expect("create");
        assert!(matches!(
            sink.write_frame(tagged_frame(0, 0)),
            Err(RelayError::FrameSizeMismatch { expected: 256, actual: 16 })
        ));
    }

    #[test]
    fn test_write_after_finish_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let frame = tagged_frame(0, 0);
        let mut sink = Y4mSink::create(spec(&dir, frame.format)).expect("create");
        sink.finish().expect("finish");
        sink.finish().expect("finish is idempotent");
        assert!(sink.write_frame(frame).is_err());
    }

    #[test]
    fn test_rejects_rgb() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            Y4mSink::create(spec(&dir, Format::new(8, 8, FourCC::RGB3))),
            Err(RelayError::UnsupportedPixelFormat(FourCC::RGB3))
        ));
    }

    #[test]
    fn test_yuyv_is_repacked_planar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let format = Format::new(4, 1, FourCC::YUYV);
        let spec = spec(&dir, format);
        let path = spec.path.clone();

        let mut sink = Y4mSink::create(spec).expect("create");
        sink.write_frame(Frame {
            data: vec![10, 1, 11, 2, 12, 3, 13, 4],
            format,
            metadata: FrameMetadata {
                context: 0,
                image_number: 0,
                timestamp: Duration::ZERO,
            },
        })
        .expect("write");
        drop(sink);

        let bytes = std::fs::read(path).expect("read output");
        assert!(bytes.ends_with(b"FRAME\n\x0a\x0b\x0c\x0d\x01\x03\x02\x04"));
    }

    #[test]
    fn test_frame_rate_ratio() {
        assert_eq!(frame_rate_ratio(20.0).expect("ratio"), (20, 1));
        assert_eq!(frame_rate_ratio(29.97).expect("ratio"), (2997, 100));
        assert!(frame_rate_ratio(0.0).is_err());
        assert_eq!(frame_rate_ratio(0.001).expect("ratio"), (1, 1000));
    }

    #[test]
    fn test_rejects_rate_that_rounds_to_zero() {
        assert!(matches!(
            frame_rate_ratio(0.0001),
            Err(RelayError::Config(_))
        ));
        let dir = tempfile::tempdir().expect("tempdir");
        let mut spec = spec(&dir, Format::new(8, 2, FourCC::GREY));
        spec.frame_rate = 0.0004;
        assert!(Y4mSink::create(spec).is_err());
        assert!(!dir.path().join("out.y4m").exists());
    }
}
