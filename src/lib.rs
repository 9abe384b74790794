//! Cam-Relay: multi-camera frame relay for V4L2 cameras
//!
//! Frames are pulled from several cameras and routed, by the context tag each
//! device stamps on its frames, to one video sink per camera. Devices sit
//! behind the [`CameraDevice`] trait so sessions run the same against real
//! hardware and the synthetic devices in [`mock`].

pub mod array;
pub mod config;
pub mod device;
pub mod error;
pub mod mock;
pub mod relay;
pub mod session;
pub mod sink;
pub mod traits;
pub mod validation;

pub use array::{CameraArray, GrabbingArray};
pub use config::RelayConfig;
pub use device::V4L2Device;
pub use error::{RelayError, Result};
pub use relay::{FrameRelay, RelayPolicy, RelayReport, StreamReport, TimeoutPolicy};
pub use session::{record, record_shared, record_threaded, SinkSlot};
pub use traits::{
    AcquisitionSettings, CameraDevice, DeviceInfo, Format, FourCC, Frame, FrameMetadata,
    FrameSink, FrameSource, Grab, GrabStrategy, SinkSpec,
};
