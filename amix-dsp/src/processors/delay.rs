//! Feedback delay (echo) over any channel count.
//!
//! Features:
//! - Per-channel circular delay line sized for the longest delay time
//! - Soft saturation on the feedback path
//! - Ringing time derived from how long the feedback tail takes to reach -60 dB

use super::{parse_config_str, parse_config_value, PostProcessor};
use crate::error::ProcessorError;
use serde::{Deserialize, Serialize};

pub(super) const KIND: &str = "delay";

/// Maximum delay time in milliseconds
const MAX_DELAY_MS: f32 = 2000.0;

/// Tail level treated as silent (-60 dB)
const SILENCE_LEVEL: f32 = 0.001;

/// Sample rate assumed until `initialize` is called
const DEFAULT_SAMPLE_RATE: u32 = 48000;

pub(super) fn create(
    config: &serde_json::Value,
    channels: usize,
) -> Result<Box<dyn PostProcessor>, ProcessorError> {
    Ok(Box::new(Delay::from_json(config, channels)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    /// Delay time (1 - 2000 ms)
    pub delay_ms: f32,
    /// Feedback amount (0.0 - 0.98)
    pub feedback: f32,
    /// Wet/dry mix (0.0 = dry, 1.0 = wet)
    pub mix: f32,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            delay_ms: 250.0,
            feedback: 0.3,
            mix: 0.5,
        }
    }
}

impl DelayConfig {
    fn clamped(self) -> Self {
        Self {
            delay_ms: self.delay_ms.clamp(1.0, MAX_DELAY_MS),
            feedback: self.feedback.clamp(0.0, 0.98),
            mix: self.mix.clamp(0.0, 1.0),
        }
    }
}

/// Multi-channel feedback delay
pub struct Delay {
    config: DelayConfig,
    channels: usize,
    sample_rate: u32,
    /// Delay line (interleaved, `buffer_frames` frames)
    buffer: Vec<f32>,
    buffer_frames: usize,
    /// Write position in frames
    write_pos: usize,
    /// Current delay in whole frames
    delay_frames: usize,
}

impl Delay {
    pub fn new(config: DelayConfig, channels: usize) -> Self {
        let mut delay = Self {
            config: config.clamped(),
            channels,
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer: Vec::new(),
            buffer_frames: 0,
            write_pos: 0,
            delay_frames: 0,
        };
        delay.allocate();
        delay
    }

    pub fn from_json(config: &serde_json::Value, channels: usize) -> Result<Self, ProcessorError> {
        Ok(Self::new(parse_config_value(KIND, config)?, channels))
    }

    pub fn config(&self) -> DelayConfig {
        self.config
    }

    /// Delay time in milliseconds
    pub fn delay_ms(&self) -> f32 {
        self.delay_frames as f32 * 1000.0 / self.sample_rate as f32
    }

    /// Size the delay line for the current sample rate
    fn allocate(&mut self) {
        self.buffer_frames = (self.sample_rate as f32 * MAX_DELAY_MS / 1000.0) as usize + 1;
        self.buffer = vec![0.0; self.buffer_frames * self.channels];
        self.write_pos = 0;
        self.update_delay();
    }

    fn update_delay(&mut self) {
        let frames = (self.config.delay_ms / 1000.0 * self.sample_rate as f32).round() as usize;
        self.delay_frames = frames.clamp(1, self.buffer_frames - 1);
    }

    /// Soft saturation for feedback path
    #[inline(always)]
    fn soft_saturate(x: f32) -> f32 {
        // Fast tanh approximation
        x / (1.0 + x.abs())
    }
}

impl PostProcessor for Delay {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn output_channels(&self) -> usize {
        self.channels
    }

    fn initialize(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
        self.allocate();
    }

    fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize) {
        let channels = self.channels;
        let mix = self.config.mix;
        let feedback = self.config.feedback;

        for frame in 0..frames {
            let read_pos = (self.write_pos + self.buffer_frames - self.delay_frames) % self.buffer_frames;
            for ch in 0..channels {
                let x = input[frame * channels + ch];
                let delayed = self.buffer[read_pos * channels + ch];

                self.buffer[self.write_pos * channels + ch] = Self::soft_saturate(x + delayed * feedback);
                output[frame * channels + ch] = x * (1.0 - mix) + delayed * mix;
            }
            self.write_pos = (self.write_pos + 1) % self.buffer_frames;
        }
    }

    fn set_config(&mut self, config: &str) -> Result<(), ProcessorError> {
        let config: DelayConfig = parse_config_str(KIND, config)?;
        self.config = config.clamped();
        self.update_delay();
        Ok(())
    }

    fn ringing_time_frames(&self) -> usize {
        if self.config.mix <= 0.0 {
            return 0;
        }
        let feedback = self.config.feedback;
        // Echoes heard before the tail drops below -60 dB
        let repeats = if feedback <= 0.0 {
            1
        } else {
            (SILENCE_LEVEL.ln() / feedback.ln()).ceil() as usize + 1
        };
        self.delay_frames * repeats
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
    }
}
