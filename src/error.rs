//! Error type shared by devices, sinks and the relay.

use std::time::Duration;

use thiserror::Error;

use crate::traits::{Format, FourCC};

/// Error type for capture and relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Device enumeration found no cameras.
    #[error("no camera devices found")]
    EnumerationEmpty,

    /// Device with the given identifier does not exist.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to open device.
    #[error("failed to open device: {0}")]
    DeviceOpenFailed(String),

    /// The device reported an unrecoverable error while grabbing.
    #[error("device fault on stream {context}: {message}")]
    DeviceFault {
        /// Context of the stream the device serves.
        context: usize,
        /// Driver or backend message.
        message: String,
    },

    /// No frame arrived within the retrieve timeout.
    #[error("no frame within {timeout:?}")]
    Timeout {
        /// The timeout that expired.
        timeout: Duration,
    },

    /// Operation requires an open device.
    #[error("device is not open")]
    NotOpen,

    /// Operation requires a device that is grabbing.
    #[error("device is not grabbing")]
    NotGrabbing,

    /// The frame source has no more frames to deliver.
    #[error("frame source closed")]
    SourceClosed,

    /// Requested format is not supported.
    #[error("format not supported: {0:?}")]
    FormatNotSupported(Format),

    /// Pixel format cannot be handled by a sink.
    #[error("unsupported pixel format: {0}")]
    UnsupportedPixelFormat(FourCC),

    /// Two streams were registered with the same context.
    #[error("stream context {0} registered twice")]
    DuplicateContext(usize),

    /// A frame buffer does not match the size the sink was created for.
    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSizeMismatch {
        /// Bytes expected per frame.
        expected: usize,
        /// Bytes received.
        actual: usize,
    },

    /// The external encoder failed.
    #[error("encoder failed: {0}")]
    Encoder(String),

    /// Recorded frames don't match what was expected.
    #[error("frame validation failed: {0}")]
    Validation(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RelayError {
    /// Whether this error is a retrieve timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type for capture and relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
