//! Raw pipe into an external encoder process.

use std::io::{BufWriter, Write};
use std::process::{Child, ChildStdin, Command, Stdio};

use crate::config::SinkConfig;
use crate::error::{RelayError, Result};
use crate::traits::{Frame, FrameSink, SinkSpec};

use super::check_frame_len;

/// Encoder command-line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegOptions {
    /// Encoder executable.
    pub program: String,
    /// Output video codec.
    pub codec: String,
    /// Encoder preset.
    pub preset: String,
    /// Constant rate factor.
    pub crf: u32,
    /// Output pixel format; `None` keeps the input tag.
    pub output_pix_fmt: Option<String>,
}

impl Default for FfmpegOptions {
    fn default() -> Self {
        Self::from(&SinkConfig::default())
    }
}

impl From<&SinkConfig> for FfmpegOptions {
    fn from(config: &SinkConfig) -> Self {
        Self {
            program: config.program.clone(),
            codec: config.codec.clone(),
            preset: config.preset.clone(),
            crf: config.crf,
            output_pix_fmt: config.output_pix_fmt.clone(),
        }
    }
}

impl FfmpegOptions {
    /// Arguments for encoding rawvideo from stdin according to `spec`.
    pub fn args(&self, spec: &SinkSpec) -> Result<Vec<String>> {
        let input_pix_fmt = spec
            .format
            .fourcc
            .ffmpeg_pix_fmt()
            .ok_or(RelayError::UnsupportedPixelFormat(spec.format.fourcc))?;
        let output_pix_fmt = self.output_pix_fmt.as_deref().unwrap_or(input_pix_fmt);

        let mut args: Vec<String> = [
            "-y",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-vcodec",
            "rawvideo",
            "-pix_fmt",
            input_pix_fmt,
        ]
        .iter()
        .map(|arg| (*arg).to_owned())
        .collect();
        args.extend([
            "-s".to_owned(),
            format!("{}x{}", spec.format.width, spec.format.height),
            "-r".to_owned(),
            spec.frame_rate.to_string(),
            "-i".to_owned(),
            "-".to_owned(),
            "-an".to_owned(),
            "-vcodec".to_owned(),
            self.codec.clone(),
            "-preset".to_owned(),
            self.preset.clone(),
            "-crf".to_owned(),
            self.crf.to_string(),
            "-pix_fmt".to_owned(),
            output_pix_fmt.to_owned(),
            spec.path.to_string_lossy().into_owned(),
        ]);
        Ok(args)
    }
}

/// Streams raw frames into an encoder process's stdin.
///
/// `finish` closes the pipe and waits for the encoder to write the container.
pub struct FfmpegPipeSink {
    spec: SinkSpec,
    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    frames: u64,
}

impl FfmpegPipeSink {
    /// Spawn the encoder for `spec`.
    pub fn create(spec: SinkSpec, options: &FfmpegOptions) -> Result<Self> {
        let args = options.args(&spec)?;
        log::debug!("spawning {} {}", options.program, args.join(" "));

        let mut child = Command::new(&options.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| RelayError::Encoder(format!("spawn {}: {err}", options.program)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::Encoder("encoder stdin unavailable".to_owned()))?;
        log::info!(
            "ffmpeg sink {} ({}x{} {} -> {})",
            spec.path.display(),
            spec.format.width,
            spec.format.height,
            spec.format.fourcc,
            options.codec
        );

        Ok(Self {
            spec,
            child: Some(child),
            stdin: Some(BufWriter::new(stdin)),
            frames: 0,
        })
    }
}

impl FrameSink for FfmpegPipeSink {
    fn write_frame(&mut self, frame: Frame) -> Result<()> {
        check_frame_len(&self.spec, &frame)?;
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            RelayError::Encoder(format!("{} already finished", self.spec.path.display()))
        })?;
        stdin.write_all(&frame.data)?;
        self.frames += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn finish(&mut self) -> Result<()> {
        // Closing stdin lets the encoder finalize the container.
        let flushed = match self.stdin.take() {
            Some(mut stdin) => stdin.flush(),
            None => Ok(()),
        };
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        flushed?;
        if !status.success() {
            return Err(RelayError::Encoder(format!(
                "encoder for {} exited with {status}",
                self.spec.path.display()
            )));
        }
        log::info!("{}: {} frames", self.spec.path.display(), self.frames);
        Ok(())
    }
}

impl Drop for FfmpegPipeSink {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            log::error!("failed to finish {}: {err}", self.spec.path.display());
        }
    }
}
