//! Bounded multi-stream frame relay.
//!
//! A [`FrameRelay`] pulls grab outcomes from a [`FrameSource`] and routes every
//! frame to the sink of the stream named by the frame's context, until every
//! stream has forwarded its target number of frames.
//!
//! Failed grabs are logged and dropped. Retrieve timeouts follow the relay's
//! [`TimeoutPolicy`], which is the same for every stream of a run. Any other
//! error ends the run. All sinks are finished on every exit path.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{RelayError, Result};
use crate::traits::{Frame, FrameSink, FrameSource, Grab};

/// What to do when no frame arrives within the retrieve timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// End the run with `RelayError::Timeout`.
    #[default]
    Abort,
    /// Log the timeout and keep polling.
    Skip,
}

/// Polling parameters for a relay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPolicy {
    /// How long a single retrieve may block.
    pub retrieve_timeout: Duration,
    /// Timeout handling, applied uniformly.
    pub timeout_policy: TimeoutPolicy,
    /// With [`TimeoutPolicy::Skip`], abort after this many timeouts in a row.
    pub max_consecutive_timeouts: Option<u32>,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            retrieve_timeout: Duration::from_millis(1000),
            timeout_policy: TimeoutPolicy::Abort,
            max_consecutive_timeouts: None,
        }
    }
}

/// Per-stream outcome of a relay run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamReport {
    /// Stream context.
    pub context: usize,
    /// Frames the stream was asked for.
    pub target_frames: u64,
    /// Frames written to the stream's sink.
    pub forwarded: u64,
    /// Grabs the device reported as failed.
    pub failed_grabs: u64,
    /// Frames dropped because their image number went backwards.
    pub stale: u64,
    /// Frames dropped because the stream had already reached its target.
    pub overflow: u64,
}

impl StreamReport {
    /// Whether the stream reached its target.
    pub const fn is_complete(&self) -> bool {
        self.forwarded >= self.target_frames
    }
}

/// Outcome of a relay run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// One entry per stream, in registration order.
    pub streams: Vec<StreamReport>,
    /// Timeouts skipped under [`TimeoutPolicy::Skip`].
    pub timeouts_skipped: u64,
    /// Frames whose context matched no stream.
    pub unrouted: u64,
}

impl RelayReport {
    /// Report for the stream with the given context.
    pub fn stream(&self, context: usize) -> Option<&StreamReport> {
        self.streams.iter().find(|stream| stream.context == context)
    }

    /// Whether every stream reached its target.
    pub fn is_complete(&self) -> bool {
        self.streams.iter().all(StreamReport::is_complete)
    }
}

struct Stream {
    report: StreamReport,
    last_image_number: Option<u64>,
    sink: Box<dyn FrameSink>,
}

impl Stream {
    fn forward(&mut self, frame: Frame) -> Result<()> {
        let image_number = frame.metadata.image_number;
        if self.report.is_complete() {
            self.report.overflow += 1;
            return Ok(());
        }
        if self.last_image_number.is_some_and(|last| image_number < last) {
            log::warn!(
                "stream {}: dropping out-of-order image {image_number}",
                self.report.context
            );
            self.report.stale += 1;
            return Ok(());
        }

        self.sink.write_frame(frame)?;
        self.last_image_number = Some(image_number);
        self.report.forwarded += 1;
        log::debug!(
            "stream {}: image {image_number} forwarded ({}/{})",
            self.report.context,
            self.report.forwarded,
            self.report.target_frames
        );
        if self.report.is_complete() {
            log::info!(
                "stream {}: reached {} frames",
                self.report.context,
                self.report.target_frames
            );
        }
        Ok(())
    }
}

/// Routes frames from one source to per-stream sinks until every stream is done.
pub struct FrameRelay<S: FrameSource> {
    source: S,
    policy: RelayPolicy,
    streams: Vec<Stream>,
    timeouts_skipped: u64,
    unrouted: u64,
}

impl<S: FrameSource> FrameRelay<S> {
    /// Create a relay with no streams.
    pub const fn new(source: S, policy: RelayPolicy) -> Self {
        Self {
            source,
            policy,
            streams: Vec::new(),
            timeouts_skipped: 0,
            unrouted: 0,
        }
    }

    /// Register a stream. Each context may be registered once.
    pub fn add_stream(
        &mut self,
        context: usize,
        target_frames: u64,
        sink: Box<dyn FrameSink>,
    ) -> Result<()> {
        if self.streams.iter().any(|s| s.report.context == context) {
            return Err(RelayError::DuplicateContext(context));
        }
        self.streams.push(Stream {
            report: StreamReport {
                context,
                target_frames,
                ..StreamReport::default()
            },
            last_image_number: None,
            sink,
        });
        Ok(())
    }

    /// Builder-style [`add_stream`](Self::add_stream).
    pub fn with_stream(
        mut self,
        context: usize,
        target_frames: u64,
        sink: Box<dyn FrameSink>,
    ) -> Result<Self> {
        self.add_stream(context, target_frames, sink)?;
        Ok(self)
    }

    /// Number of registered streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Relay frames until every stream reaches its target.
    ///
    /// Every sink is finished before this returns, whether the run succeeded
    /// or not. On failure the first error is returned.
    pub fn run(mut self) -> Result<RelayReport> {
        let outcome = self.pump();
        let finished = self.finish_sinks();
        outcome.and(finished)?;

        Ok(RelayReport {
            streams: self.streams.into_iter().map(|s| s.report).collect(),
            timeouts_skipped: self.timeouts_skipped,
            unrouted: self.unrouted,
        })
    }

    fn all_done(&self) -> bool {
        self.streams.iter().all(|s| s.report.is_complete())
    }

    fn pump(&mut self) -> Result<()> {
        let mut consecutive_timeouts = 0u32;

        while !self.all_done() {
            match self.source.next_grab(self.policy.retrieve_timeout) {
                Ok(grab) => {
                    consecutive_timeouts = 0;
                    self.dispatch(grab)?;
                }
                Err(err) if err.is_timeout() => {
                    consecutive_timeouts += 1;
                    self.on_timeout(err, consecutive_timeouts)?;
                }
                Err(err) => {
                    log::error!("relay stopped: {err}");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn on_timeout(&mut self, err: RelayError, consecutive: u32) -> Result<()> {
        match self.policy.timeout_policy {
            TimeoutPolicy::Abort => {
                log::error!("relay aborted: {err}");
                Err(err)
            }
            TimeoutPolicy::Skip => {
                if self
                    .policy
                    .max_consecutive_timeouts
                    .is_some_and(|limit| consecutive >= limit)
                {
                    log::error!("relay aborted after {consecutive} consecutive timeouts");
                    return Err(err);
                }
                log::warn!("{err}, skipping");
                self.timeouts_skipped += 1;
                Ok(())
            }
        }
    }

    fn dispatch(&mut self, grab: Grab) -> Result<()> {
        let context = grab.context();
        let Some(stream) = self.streams.iter_mut().find(|s| s.report.context == context) else {
            log::warn!("dropping grab from unknown stream {context}");
            self.unrouted += 1;
            return Ok(());
        };

        match grab {
            Grab::Frame(frame) => stream.forward(frame),
            Grab::Failed {
                image_number,
                reason,
                ..
            } => {
                log::warn!("stream {context}: grab {image_number} failed: {reason}");
                stream.report.failed_grabs += 1;
                Ok(())
            }
        }
    }

    fn finish_sinks(&mut self) -> Result<()> {
        let mut first_err = None;
        for stream in &mut self.streams {
            if let Err(err) = stream.sink.finish() {
                log::error!("stream {}: failed to finish sink: {err}", stream.report.context);
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
