//! Fixed gain

use super::{db_to_linear, parse_config_str, parse_config_value, PostProcessor};
use crate::error::ProcessorError;
use serde::{Deserialize, Serialize};

pub(super) const KIND: &str = "gain";

pub(super) fn create(
    config: &serde_json::Value,
    channels: usize,
) -> Result<Box<dyn PostProcessor>, ProcessorError> {
    Ok(Box::new(Gain::from_json(config, channels)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GainConfig {
    pub gain_db: f32,
}

/// Scales every sample by a constant gain
pub struct Gain {
    channels: usize,
    gain: f32,
}

impl Gain {
    pub fn new(config: GainConfig, channels: usize) -> Self {
        Self {
            channels,
            gain: db_to_linear(config.gain_db),
        }
    }

    pub fn from_json(config: &serde_json::Value, channels: usize) -> Result<Self, ProcessorError> {
        Ok(Self::new(parse_config_value(KIND, config)?, channels))
    }

    /// Linear gain
    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl PostProcessor for Gain {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn output_channels(&self) -> usize {
        self.channels
    }

    fn initialize(&mut self, _sample_rate: u32) {}

    fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize) {
        let n = frames * self.channels;
        for (out, x) in output[..n].iter_mut().zip(&input[..n]) {
            *out = x * self.gain;
        }
    }

    fn set_config(&mut self, config: &str) -> Result<(), ProcessorError> {
        let config: GainConfig = parse_config_str(KIND, config)?;
        self.gain = db_to_linear(config.gain_db);
        Ok(())
    }

    fn reset(&mut self) {}
}
