//! Shared grab queue over several devices.
//!
//! Each device is drained by its own reader thread into one bounded channel,
//! so a single relay loop can wait on all devices at once. Frames from one
//! device keep their delivery order; ordering across devices is whatever the
//! channel sees first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::traits::{CameraDevice, FrameSource, Grab, GrabStrategy};

/// How long a reader waits on its device before re-checking the stop flag.
const READER_POLL: Duration = Duration::from_millis(100);

/// Default capacity of the shared queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// A set of devices whose grabs are multiplexed into one queue.
pub struct CameraArray<D> {
    devices: Vec<D>,
}

impl<D> CameraArray<D>
where
    D: CameraDevice + Send + 'static,
{
    /// Build an array, assigning contexts `0..n` in the given order.
    pub fn new(mut devices: Vec<D>) -> Self {
        for (context, device) in devices.iter_mut().enumerate() {
            device.set_context(context);
        }
        Self { devices }
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the array has no devices.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices in context order.
    pub fn devices(&self) -> &[D] {
        &self.devices
    }

    /// Mutable access to the devices, for opening and configuring.
    pub fn devices_mut(&mut self) -> &mut [D] {
        &mut self.devices
    }

    /// Give the devices back.
    pub fn into_devices(self) -> Vec<D> {
        self.devices
    }

    /// Start grabbing on every device and spawn one reader per device.
    ///
    /// Devices that fail to start are stopped again before the error is
    /// returned.
    pub fn start_grabbing(
        mut self,
        strategy: GrabStrategy,
        max_frames: Option<u64>,
        queue_depth: usize,
    ) -> Result<GrabbingArray<D>> {
        for index in 0..self.devices.len() {
            let started = self
                .devices
                .get_mut(index)
                .map_or(Ok(()), |device| device.start_grabbing(strategy, max_frames));
            if let Err(err) = started {
                for device in self.devices.iter_mut().take(index) {
                    if let Err(stop_err) = device.stop_grabbing() {
                        log::warn!("failed to stop {}: {stop_err}", device.info().uri);
                    }
                }
                return Err(err);
            }
        }

        let (tx, rx) = mpsc::sync_channel(queue_depth.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::with_capacity(self.devices.len());
        for device in self.devices {
            let context = device.context();
            let reader = Reader {
                device,
                tx: tx.clone(),
                stop: Arc::clone(&stop),
                strategy,
            };
            let spawned = thread::Builder::new()
                .name(format!("grab-{context}"))
                .spawn(move || reader.run());
            match spawned {
                Ok(handle) => readers.push((context, handle)),
                Err(err) => {
                    log::error!("failed to spawn reader {context}: {err}");
                    let started = GrabbingArray { rx, stop, readers };
                    if let Err(stop_err) = started.stop() {
                        log::warn!("stopping started readers: {stop_err}");
                    }
                    return Err(err.into());
                }
            }
        }
        log::info!("grabbing on {} devices ({strategy:?})", readers.len());

        Ok(GrabbingArray { rx, stop, readers })
    }
}

struct Reader<D> {
    device: D,
    tx: SyncSender<Result<Grab>>,
    stop: Arc<AtomicBool>,
    strategy: GrabStrategy,
}

impl<D: CameraDevice> Reader<D> {
    fn run(mut self) -> D {
        let context = self.device.context();
        while !self.stop.load(Ordering::Relaxed) && self.device.is_grabbing() {
            let outcome = match self.device.retrieve(READER_POLL) {
                Err(err) if err.is_timeout() => continue,
                other => other,
            };
            let fatal = outcome.is_err();
            if !self.push(outcome) || fatal {
                break;
            }
        }
        log::debug!("reader {context} exiting");
        self.device
    }

    /// Hand an outcome to the consumer. Returns `false` once the consumer is gone.
    fn push(&self, outcome: Result<Grab>) -> bool {
        match self.strategy {
            GrabStrategy::OneByOne => self.tx.send(outcome).is_ok(),
            GrabStrategy::LatestImageOnly => match self.tx.try_send(outcome) {
                Ok(()) => true,
                Err(TrySendError::Full(Ok(grab))) => {
                    log::debug!("stream {}: queue full, dropping grab", grab.context());
                    true
                }
                // errors are never dropped
                Err(TrySendError::Full(err)) => self.tx.send(err).is_ok(),
                Err(TrySendError::Disconnected(_)) => false,
            },
        }
    }
}

/// A [`CameraArray`] whose readers are running.
pub struct GrabbingArray<D> {
    rx: Receiver<Result<Grab>>,
    stop: Arc<AtomicBool>,
    readers: Vec<(usize, JoinHandle<D>)>,
}

impl<D: CameraDevice> GrabbingArray<D> {
    /// Stop the readers, stop grabbing and return the devices in context order.
    pub fn stop(self) -> Result<Vec<D>> {
        self.stop.store(true, Ordering::Relaxed);
        // Unblock readers waiting on a full queue.
        drop(self.rx);

        let mut devices = Vec::with_capacity(self.readers.len());
        let mut first_err = None;
        for (context, handle) in self.readers {
            match handle.join() {
                Ok(mut device) => {
                    if let Err(err) = device.stop_grabbing() {
                        first_err.get_or_insert(err);
                    }
                    devices.push(device);
                }
                Err(_) => {
                    log::error!("reader {context} panicked");
                    first_err.get_or_insert(RelayError::DeviceFault {
                        context,
                        message: "grab thread panicked".to_owned(),
                    });
                }
            }
        }
        log::info!("grabbing stopped on {} devices", devices.len());
        first_err.map_or(Ok(devices), Err)
    }
}

impl<D> FrameSource for GrabbingArray<D> {
    fn next_grab(&mut self, timeout: Duration) -> Result<Grab> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(RelayError::Timeout { timeout }),
            Err(RecvTimeoutError::Disconnected) => Err(RelayError::SourceClosed),
        }
    }
}
