//! Sine tone source

use amix_audio::{AudioContentType, MixerError, RenderingDelay, Source};
use std::f32::consts::TAU;
use tracing::warn;

/// Sine generator. A tone with a length goes inactive once it has played.
pub struct ToneSource {
    device_id: String,
    primary: bool,
    content_type: AudioContentType,
    channels: usize,
    sample_rate: u32,
    frequency: f32,
    amplitude: f32,
    phase: f32,
    remaining_frames: Option<usize>,
}

impl ToneSource {
    /// Endless primary media tone on the default device
    pub fn media(frequency: f32, amplitude: f32) -> Self {
        Self {
            device_id: "default".to_string(),
            primary: true,
            content_type: AudioContentType::Media,
            channels: 2,
            sample_rate: 48000,
            frequency,
            amplitude,
            phase: 0.0,
            remaining_frames: None,
        }
    }

    /// Short mono sound effect on `device_id`
    pub fn chime(device_id: &str, frequency: f32, amplitude: f32, length_ms: u32) -> Self {
        let sample_rate = 44100;
        Self {
            device_id: device_id.to_string(),
            primary: false,
            content_type: AudioContentType::Alarm,
            channels: 1,
            sample_rate,
            frequency,
            amplitude,
            phase: 0.0,
            remaining_frames: Some((sample_rate as u64 * length_ms as u64 / 1000) as usize),
        }
    }
}

impl Source for ToneSource {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn primary(&self) -> bool {
        self.primary
    }

    fn content_type(&self) -> AudioContentType {
        self.content_type
    }

    fn num_channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn active(&self) -> bool {
        self.remaining_frames != Some(0)
    }

    fn fill_audio_playback_frames(&mut self, frames: usize, _delay: RenderingDelay, dest: &mut [f32]) -> usize {
        let frames = match self.remaining_frames {
            Some(remaining) => frames.min(remaining),
            None => frames,
        };
        let step = TAU * self.frequency / self.sample_rate as f32;
        for frame in dest[..frames * self.channels].chunks_exact_mut(self.channels) {
            frame.fill(self.phase.sin() * self.amplitude);
            self.phase = (self.phase + step) % TAU;
        }
        if let Some(remaining) = self.remaining_frames.as_mut() {
            *remaining -= frames;
        }
        frames
    }

    fn on_error(&mut self, error: MixerError) {
        warn!(device_id = %self.device_id, %error, "tone dropped by mixer");
    }
}
