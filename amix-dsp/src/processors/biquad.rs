//! Biquad filter (low-pass, high-pass, band-pass) over any channel count

use super::{parse_config_str, parse_config_value, PostProcessor};
use crate::error::ProcessorError;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

pub(super) const KIND: &str = "biquad";

/// Sample rate assumed until `initialize` is called
const DEFAULT_SAMPLE_RATE: u32 = 48000;

pub(super) fn create(
    config: &serde_json::Value,
    channels: usize,
) -> Result<Box<dyn PostProcessor>, ProcessorError> {
    Ok(Box::new(Biquad::from_json(config, channels)?))
}

/// Filter type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    #[default]
    LowPass,
    HighPass,
    BandPass,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiquadConfig {
    pub filter: FilterType,
    /// Cutoff or center frequency in Hz
    pub frequency: f32,
    pub q: f32,
}

impl Default for BiquadConfig {
    fn default() -> Self {
        Self {
            filter: FilterType::LowPass,
            frequency: 1000.0,
            q: 0.707, // Butterworth
        }
    }
}

/// Per-channel filter memory
#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

/// Biquad filter implementation
pub struct Biquad {
    config: BiquadConfig,
    sample_rate: u32,
    channels: usize,

    // Normalized coefficients
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,

    state: Vec<ChannelState>,
}

impl Biquad {
    pub fn new(config: BiquadConfig, channels: usize) -> Self {
        let mut filter = Self {
            config,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            state: vec![ChannelState::default(); channels],
        };
        filter.calculate_coefficients();
        filter
    }

    pub fn from_json(config: &serde_json::Value, channels: usize) -> Result<Self, ProcessorError> {
        Ok(Self::new(parse_config_value(KIND, config)?, channels))
    }

    pub fn config(&self) -> BiquadConfig {
        self.config
    }

    /// Calculate biquad coefficients from the config and sample rate
    fn calculate_coefficients(&mut self) {
        let sample_rate = self.sample_rate as f32;
        // Stay clear of Nyquist or the filter goes unstable
        let frequency = self.config.frequency.clamp(20.0, sample_rate * 0.45);
        let q = self.config.q.clamp(0.1, 20.0);

        let omega = 2.0 * PI * frequency / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let (b0, b1, b2) = match self.config.filter {
            FilterType::LowPass => (
                (1.0 - cos_omega) / 2.0,
                1.0 - cos_omega,
                (1.0 - cos_omega) / 2.0,
            ),
            FilterType::HighPass => (
                (1.0 + cos_omega) / 2.0,
                -(1.0 + cos_omega),
                (1.0 + cos_omega) / 2.0,
            ),
            FilterType::BandPass => (alpha, 0.0, -alpha),
        };
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
    }
}

impl PostProcessor for Biquad {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn output_channels(&self) -> usize {
        self.channels
    }

    fn initialize(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
        self.calculate_coefficients();
        self.reset();
    }

    fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize) {
        let n = frames * self.channels;
        for (in_frame, out_frame) in input[..n]
            .chunks_exact(self.channels)
            .zip(output[..n].chunks_exact_mut(self.channels))
        {
            for ((x, y), s) in in_frame.iter().zip(out_frame.iter_mut()).zip(&mut self.state) {
                let out = self.b0 * x + self.b1 * s.x1 + self.b2 * s.x2 - self.a1 * s.y1 - self.a2 * s.y2;
                s.x2 = s.x1;
                s.x1 = *x;
                s.y2 = s.y1;
                s.y1 = out;
                *y = out;
            }
        }
    }

    fn set_config(&mut self, config: &str) -> Result<(), ProcessorError> {
        self.config = parse_config_str(KIND, config)?;
        // Keep filter memory so a retune does not click
        self.calculate_coefficients();
        Ok(())
    }

    fn ringing_time_frames(&self) -> usize {
        // A handful of periods of the cutoff is plenty for Q <= 20
        let frequency = self.config.frequency.max(20.0);
        (4.0 * self.config.q.max(1.0) * self.sample_rate as f32 / frequency) as usize
    }

    fn reset(&mut self) {
        self.state.fill(ChannelState::default());
    }
}
