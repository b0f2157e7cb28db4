//! Channel count conversion, honoring the playout channel

use super::{parse_config_str, parse_config_value, PostProcessor};
use crate::channel_mixer::InterleavedChannelMixer;
use crate::error::ProcessorError;
use crate::layout::{guess_channel_layout, PlayoutChannel};
use serde::{Deserialize, Serialize};

pub(super) const KIND: &str = "mixdown";

/// Initial block size of the internal mixer; grows on demand
const INITIAL_FRAMES: usize = 1024;

pub(super) fn create(
    config: &serde_json::Value,
    channels: usize,
) -> Result<Box<dyn PostProcessor>, ProcessorError> {
    Ok(Box::new(Mixdown::from_json(config, channels)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixdownConfig {
    pub output_channels: usize,
}

impl Default for MixdownConfig {
    fn default() -> Self {
        Self { output_channels: 2 }
    }
}

/// Remixes to a fixed channel count.
///
/// With a playout channel selected, that input channel is copied to every
/// output channel instead.
pub struct Mixdown {
    mixer: InterleavedChannelMixer,
    playout_channel: PlayoutChannel,
}

impl Mixdown {
    pub fn new(config: MixdownConfig, input_channels: usize) -> Result<Self, ProcessorError> {
        if config.output_channels == 0 || input_channels == 0 {
            return Err(ProcessorError::UnsupportedChannels {
                kind: KIND,
                channels: config.output_channels.min(input_channels),
            });
        }
        Ok(Self {
            mixer: InterleavedChannelMixer::new(
                guess_channel_layout(input_channels),
                input_channels,
                guess_channel_layout(config.output_channels),
                config.output_channels,
                INITIAL_FRAMES,
            ),
            playout_channel: PlayoutChannel::All,
        })
    }

    pub fn from_json(config: &serde_json::Value, input_channels: usize) -> Result<Self, ProcessorError> {
        Self::new(parse_config_value(KIND, config)?, input_channels)
    }

    /// Input channel to play everywhere, if one is selected and exists
    fn selected_channel(&self) -> Option<usize> {
        match self.playout_channel {
            PlayoutChannel::Channel(ch) if ch < self.mixer.input_channels() => Some(ch),
            _ => None,
        }
    }
}

impl PostProcessor for Mixdown {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn output_channels(&self) -> usize {
        self.mixer.output_channels()
    }

    fn initialize(&mut self, _sample_rate: u32) {}

    fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize) {
        let in_ch = self.mixer.input_channels();
        let out_ch = self.mixer.output_channels();

        if let Some(selected) = self.selected_channel() {
            for (in_frame, out_frame) in input[..frames * in_ch]
                .chunks_exact(in_ch)
                .zip(output[..frames * out_ch].chunks_exact_mut(out_ch))
            {
                out_frame.fill(in_frame[selected]);
            }
            return;
        }

        let mixed = self.mixer.transform(input, frames);
        output[..frames * out_ch].copy_from_slice(mixed);
    }

    fn set_config(&mut self, config: &str) -> Result<(), ProcessorError> {
        let config: MixdownConfig = parse_config_str(KIND, config)?;
        // The tree was sized for the current count
        if config.output_channels != self.mixer.output_channels() {
            return Err(ProcessorError::UnsupportedChannels {
                kind: KIND,
                channels: config.output_channels,
            });
        }
        Ok(())
    }

    fn set_playout_channel(&mut self, channel: PlayoutChannel) {
        self.playout_channel = channel;
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stereo_to_mono() {
        let mut mixdown = Mixdown::from_json(&json!({ "output_channels": 1 }), 2).unwrap();
        assert_eq!(mixdown.output_channels(), 1);
        let mut out = [0.0; 2];
        mixdown.process(&[1.0, 1.0, 0.2, 0.4], &mut out, 2);
        assert_eq!(out[0], 1.0);
        assert!((out[1] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_playout_channel_copies_everywhere() {
        let mut mixdown = Mixdown::from_json(&json!({ "output_channels": 2 }), 2).unwrap();
        mixdown.set_playout_channel(PlayoutChannel::Channel(1));
        let mut out = [0.0; 4];
        mixdown.process(&[0.1, 0.9, 0.2, 0.8], &mut out, 2);
        assert_eq!(out, [0.9, 0.9, 0.8, 0.8]);

        mixdown.set_playout_channel(PlayoutChannel::All);
        mixdown.process(&[0.1, 0.9, 0.2, 0.8], &mut out, 2);
        assert_eq!(out, [0.1, 0.9, 0.2, 0.8]);
    }

    #[test]
    fn test_out_of_range_playout_channel_ignored() {
        let mut mixdown = Mixdown::from_json(&json!({ "output_channels": 2 }), 2).unwrap();
        mixdown.set_playout_channel(PlayoutChannel::Channel(5));
        let mut out = [0.0; 2];
        mixdown.process(&[0.1, 0.9], &mut out, 1);
        assert_eq!(out, [0.1, 0.9]);
    }

    #[test]
    fn test_zero_channels_rejected() {
        assert!(matches!(
            Mixdown::from_json(&json!({ "output_channels": 0 }), 2),
            Err(ProcessorError::UnsupportedChannels { kind: "mixdown", .. })
        ));
    }

    #[test]
    fn test_set_config_cannot_change_channel_count() {
        let mut mixdown = Mixdown::from_json(&json!({ "output_channels": 2 }), 6).unwrap();
        assert!(mixdown.set_config(r#"{ "output_channels": 2 }"#).is_ok());
        assert!(mixdown.set_config(r#"{ "output_channels": 4 }"#).is_err());
    }
}
