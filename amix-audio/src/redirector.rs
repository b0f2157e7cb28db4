//! Output redirectors - per-input audio taps taken before the mix

use crate::input::MixerInput;
use crate::source::InputId;
use amix_dsp::{guess_channel_layout, InterleavedChannelMixer};
use crossbeam_channel::Sender;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Identity of a registered redirector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RedirectorId(pub u64);

impl fmt::Display for RedirectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "redirector#{}", self.0)
    }
}

/// Receives the audio of individual inputs once per playback round.
///
/// Called on the mixer thread in this order each round:
/// `prepare_next_buffer`, `on_input_audio` per contributing input,
/// `finish_buffer`.
pub trait AudioOutputRedirector: Send {
    fn set_sample_rate(&mut self, sample_rate: u32);

    /// Offered every current input on registration and every new input after
    fn add_input(&mut self, input: &MixerInput);

    fn remove_input(&mut self, id: InputId);

    fn prepare_next_buffer(&mut self, frames: usize);

    /// `data` is interleaved at `channels` channels
    fn on_input_audio(&mut self, id: InputId, data: &[f32], channels: usize);

    fn finish_buffer(&mut self);
}

/// One round of redirected audio
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectedBuffer {
    pub sample_rate: u32,
    pub channels: usize,
    pub frames: usize,
    pub samples: Vec<f32>,
}

/// Mixes the inputs whose device id is in its list and sends one buffer
/// per round on a channel. Rounds without a matching input send nothing.
pub struct ChannelRedirector {
    device_ids: Vec<String>,
    channels: usize,
    sample_rate: u32,
    inputs: HashSet<InputId>,
    mixers: HashMap<usize, InterleavedChannelMixer>,
    buffer: Vec<f32>,
    frames: usize,
    has_audio: bool,
    tx: Sender<RedirectedBuffer>,
}

impl ChannelRedirector {
    pub fn new(device_ids: &[&str], channels: usize, tx: Sender<RedirectedBuffer>) -> Self {
        Self {
            device_ids: device_ids.iter().map(|id| id.to_string()).collect(),
            channels: channels.max(1),
            sample_rate: 0,
            inputs: HashSet::new(),
            mixers: HashMap::new(),
            buffer: Vec::new(),
            frames: 0,
            has_audio: false,
            tx,
        }
    }

    pub fn is_redirecting(&self, id: InputId) -> bool {
        self.inputs.contains(&id)
    }
}

impl AudioOutputRedirector for ChannelRedirector {
    fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    fn add_input(&mut self, input: &MixerInput) {
        if self.device_ids.iter().any(|id| id == input.device_id()) {
            self.inputs.insert(input.id());
        }
    }

    fn remove_input(&mut self, id: InputId) {
        self.inputs.remove(&id);
    }

    fn prepare_next_buffer(&mut self, frames: usize) {
        self.frames = frames;
        self.has_audio = false;
        self.buffer.clear();
        self.buffer.resize(frames * self.channels, 0.0);
    }

    fn on_input_audio(&mut self, id: InputId, data: &[f32], channels: usize) {
        if !self.inputs.contains(&id) || channels == 0 {
            return;
        }
        let frames = (data.len() / channels).min(self.frames);
        let out_ch = self.channels;
        let converted: &[f32] = if channels == out_ch {
            data
        } else {
            let mixer = self.mixers.entry(channels).or_insert_with(|| {
                InterleavedChannelMixer::new(
                    guess_channel_layout(channels),
                    channels,
                    guess_channel_layout(out_ch),
                    out_ch,
                    frames,
                )
            });
            &*mixer.transform(data, frames)
        };
        for (acc, sample) in self.buffer.iter_mut().zip(&converted[..frames * out_ch]) {
            *acc += sample;
        }
        self.has_audio = true;
    }

    fn finish_buffer(&mut self) {
        if !self.has_audio {
            return;
        }
        let _ = self.tx.try_send(RedirectedBuffer {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frames: self.frames,
            samples: self.buffer.clone(),
        });
    }
}
