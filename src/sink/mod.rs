//! Video sinks.
//!
//! Both sinks accept raw frames one at a time and write them out as they
//! arrive; nothing is buffered beyond the writer's own I/O buffer.

mod ffmpeg;
mod y4m;

pub use ffmpeg::{FfmpegOptions, FfmpegPipeSink};
pub use y4m::Y4mSink;

use crate::config::{SinkConfig, SinkKind};
use crate::error::{RelayError, Result};
use crate::traits::{Frame, FrameSink, SinkSpec};

/// Open the sink selected by `config`.
pub fn open_sink(config: &SinkConfig, spec: SinkSpec) -> Result<Box<dyn FrameSink>> {
    let sink: Box<dyn FrameSink> = match config.kind {
        SinkKind::Ffmpeg => Box::new(FfmpegPipeSink::create(spec, &FfmpegOptions::from(config))?),
        SinkKind::Y4m => Box::new(Y4mSink::create(spec)?),
    };
    Ok(sink)
}

/// Reject frames whose buffer doesn't match the sink's format.
fn check_frame_len(spec: &SinkSpec, frame: &Frame) -> Result<()> {
    let expected = spec.format.frame_len();
    if frame.data.len() != expected {
        return Err(RelayError::FrameSizeMismatch {
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(())
}
