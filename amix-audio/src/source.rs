//! Audio sources - the producers the mixer pulls PCM from

use amix_dsp::{PlayoutChannel, RenderingDelay};
use std::fmt;
use thiserror::Error;

/// Identity of an input, assigned by `StreamMixer::add_input`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputId(pub u64);

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input#{}", self.0)
    }
}

/// Content type, used for volume control and ducking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioContentType {
    Media,
    Alarm,
    Communications,
    /// Not volume controlled
    Other,
}

impl AudioContentType {
    pub const ALL: [AudioContentType; 4] = [
        AudioContentType::Media,
        AudioContentType::Alarm,
        AudioContentType::Communications,
        AudioContentType::Other,
    ];

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            AudioContentType::Media => 0,
            AudioContentType::Alarm => 1,
            AudioContentType::Communications => 2,
            AudioContentType::Other => 3,
        }
    }
}

impl fmt::Display for AudioContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioContentType::Media => "media",
            AudioContentType::Alarm => "alarm",
            AudioContentType::Communications => "communications",
            AudioContentType::Other => "other",
        };
        f.write_str(name)
    }
}

/// Errors reported to a source through `Source::on_error`
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerError {
    /// Another stream renegotiated the output; this input no longer plays
    #[error("input ignored after output renegotiation")]
    InputIgnored,
    /// The mixer could not start its output
    #[error("mixer internal error")]
    InternalError,
}

/// A PCM producer.
///
/// The mixer owns the source once added and calls it only from the mixer
/// thread. Audio is interleaved `f32` at `num_channels()`/`sample_rate()`.
pub trait Source: Send {
    /// Routing key into the pipeline's stream groups
    fn device_id(&self) -> &str;

    /// Primary streams may renegotiate the output format
    fn primary(&self) -> bool;

    fn content_type(&self) -> AudioContentType;

    /// Content type whose output limit (ducking) applies
    fn focus_type(&self) -> AudioContentType {
        self.content_type()
    }

    fn num_channels(&self) -> usize;

    fn sample_rate(&self) -> u32;

    fn playout_channel(&self) -> PlayoutChannel {
        PlayoutChannel::All
    }

    /// Whether the source is currently playing
    fn active(&self) -> bool {
        true
    }

    /// Called once, when the input is first attached to a filter group
    fn initialize_audio_playback(&mut self, _read_size: usize, _initial_delay: RenderingDelay) {}

    /// Fill up to `frames` frames into `dest`; returns the frames written.
    ///
    /// `delay` is how far in the future the returned audio will be heard.
    fn fill_audio_playback_frames(&mut self, frames: usize, delay: RenderingDelay, dest: &mut [f32]) -> usize;

    /// The output could not keep up; audio already handed out was dropped
    fn on_output_underrun(&mut self) {}

    fn on_error(&mut self, error: MixerError);

    /// Called when the mixer drops the input
    fn finalize_audio_playback(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_indices_unique() {
        let mut seen = [false; 4];
        for content_type in AudioContentType::ALL {
            assert!(!seen[content_type.index()]);
            seen[content_type.index()] = true;
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(InputId(7).to_string(), "input#7");
        assert_eq!(AudioContentType::Communications.to_string(), "communications");
        assert_eq!(MixerError::InputIgnored.to_string(), "input ignored after output renegotiation");
    }
}
