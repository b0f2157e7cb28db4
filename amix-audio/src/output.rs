//! Output stream contract and the null output

use amix_dsp::RenderingDelay;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors from an output stream
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("output device unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported output format: {channels} channels at {sample_rate} Hz")]
    UnsupportedFormat { sample_rate: u32, channels: usize },
    #[error("output stream is not started")]
    NotStarted,
    #[error("output stream failed: {0}")]
    Failed(String),
}

/// Result of one write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOutcome {
    /// Playback was interrupted (underrun) before this write
    pub interrupted: bool,
}

/// Device-facing sink the mixer writes interleaved PCM to.
///
/// Owned and driven by the mixer thread only. `write` is expected to block
/// until the device can take the data; it paces the playback loop.
pub trait MixerOutputStream: Send {
    fn start(&mut self, sample_rate: u32, channels: usize) -> Result<(), OutputError>;

    fn stop(&mut self);

    fn write(&mut self, data: &[f32]) -> Result<WriteOutcome, OutputError>;

    /// Delay until audio written next is heard
    fn rendering_delay(&self) -> RenderingDelay;

    /// Channel count actually opened
    fn num_channels(&self) -> usize;

    /// Sample rate actually opened
    fn sample_rate(&self) -> u32;

    /// Frames per write the device prefers
    fn optimal_write_frames_count(&self) -> usize;
}

/// Creates the output stream when the mixer first starts
pub type OutputFactory = Box<dyn Fn() -> Box<dyn MixerOutputStream> + Send>;

/// Microseconds on the process-wide monotonic clock
pub fn monotonic_now_us() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as i64
}

const DEFAULT_WRITE_FRAMES: usize = 256;
/// Writes the null output lets the writer run ahead of the clock
const MAX_BUFFERED_WRITES: u32 = 2;

/// Output that plays into nothing at wall-clock speed
#[derive(Debug)]
pub struct NullOutputStream {
    write_frames: usize,
    sample_rate: u32,
    channels: usize,
    /// Wall-clock time at which frame 0 plays; `None` while stopped
    started_at: Option<Instant>,
    frames_written: u64,
}

impl NullOutputStream {
    pub fn new() -> Self {
        Self::with_write_frames(DEFAULT_WRITE_FRAMES)
    }

    pub fn with_write_frames(write_frames: usize) -> Self {
        Self {
            write_frames,
            sample_rate: 0,
            channels: 0,
            started_at: None,
            frames_written: 0,
        }
    }

    fn frames_to_duration(&self, frames: u64) -> Duration {
        Duration::from_micros(frames * 1_000_000 / self.sample_rate.max(1) as u64)
    }

    /// Audio written but not yet played
    fn queued(&self, now: Instant) -> Duration {
        match self.started_at {
            Some(started_at) => {
                let played_until = started_at + self.frames_to_duration(self.frames_written);
                played_until.saturating_duration_since(now)
            }
            None => Duration::ZERO,
        }
    }
}

impl Default for NullOutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MixerOutputStream for NullOutputStream {
    fn start(&mut self, sample_rate: u32, channels: usize) -> Result<(), OutputError> {
        if sample_rate == 0 || channels == 0 {
            return Err(OutputError::UnsupportedFormat { sample_rate, channels });
        }
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.started_at = Some(Instant::now());
        self.frames_written = 0;
        Ok(())
    }

    fn stop(&mut self) {
        self.started_at = None;
        self.frames_written = 0;
    }

    fn write(&mut self, data: &[f32]) -> Result<WriteOutcome, OutputError> {
        let Some(started_at) = self.started_at else {
            return Err(OutputError::NotStarted);
        };
        let frames = (data.len() / self.channels) as u64;
        let now = Instant::now();

        let played_until = started_at + self.frames_to_duration(self.frames_written);
        let interrupted = self.frames_written > 0 && now > played_until;
        if interrupted {
            // Restart the clock at the write that came late
            self.started_at = Some(now);
            self.frames_written = 0;
        }

        self.frames_written += frames;
        let limit = self.frames_to_duration(self.write_frames as u64) * MAX_BUFFERED_WRITES;
        let queued = self.queued(Instant::now());
        if queued > limit {
            thread::sleep(queued - limit);
        }
        Ok(WriteOutcome { interrupted })
    }

    fn rendering_delay(&self) -> RenderingDelay {
        if self.started_at.is_none() {
            return RenderingDelay::default();
        }
        let now = monotonic_now_us();
        let queued = self.queued(Instant::now());
        RenderingDelay::new(queued.as_micros() as i64, now)
    }

    fn num_channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn optimal_write_frames_count(&self) -> usize {
        self.write_frames
    }
}
