//! MixerInput - one source as seen by the pipeline
//!
//! Pulls PCM from its `Source`, resamples to the filter group rate, remixes
//! to the group's channel count and applies volume with ramps.

use crate::source::{AudioContentType, InputId, MixerError, Source};
use amix_dsp::{
    guess_channel_layout, FilterGroup, GroupId, GroupInput, InterleavedChannelMixer, PlayoutChannel, RenderingDelay,
};
use rubato::{FftFixedOut, Resampler};
use std::time::Duration;
use tracing::{debug, warn};

/// Fade used when no explicit fade time is given
pub(crate) const DEFAULT_FADE: Duration = Duration::from_millis(15);

/// Linear gain ramp, advanced once per frame
#[derive(Debug, Clone, Copy, PartialEq)]
struct VolumeRamp {
    current: f32,
    target: f32,
    step: f32,
    remaining: usize,
}

impl VolumeRamp {
    fn new(volume: f32) -> Self {
        Self {
            current: volume,
            target: volume,
            step: 0.0,
            remaining: 0,
        }
    }

    fn set_target(&mut self, target: f32, fade_frames: usize) {
        self.target = target;
        if fade_frames == 0 || self.current == target {
            self.current = target;
            self.step = 0.0;
            self.remaining = 0;
        } else {
            self.step = (target - self.current) / fade_frames as f32;
            self.remaining = fade_frames;
        }
    }

    #[inline]
    fn next(&mut self) -> f32 {
        let gain = self.current;
        if self.remaining > 0 {
            self.remaining -= 1;
            self.current = if self.remaining == 0 {
                self.target
            } else {
                self.current + self.step
            };
        }
        gain
    }
}

/// FFT resampler between the source rate and the group rate, with fixed
/// output blocks of one write
struct InputResampler {
    inner: FftFixedOut<f32>,
    channels: usize,
    /// Interleaved source audio for one process call
    pulled: Vec<f32>,
    planar_in: Vec<Vec<f32>>,
    planar_out: Vec<Vec<f32>>,
}

impl InputResampler {
    fn new(source_rate: u32, group_rate: u32, frames: usize, channels: usize) -> Result<Self, String> {
        let inner = FftFixedOut::<f32>::new(source_rate as usize, group_rate as usize, frames, 1, channels)
            .map_err(|e| e.to_string())?;
        let planar_in = inner.input_buffer_allocate(true);
        let planar_out = inner.output_buffer_allocate(true);
        Ok(Self {
            inner,
            channels,
            pulled: Vec::new(),
            planar_in,
            planar_out,
        })
    }

    /// Pull from `source` and write `frames` resampled frames to `dest`.
    ///
    /// Returns whether `dest` carries audio. The resampler keeps output
    /// between calls, so some rounds need no new input at all and still
    /// produce a full block.
    fn render(&mut self, source: &mut dyn Source, frames: usize, delay: RenderingDelay, dest: &mut [f32]) -> bool {
        let needed = self.inner.input_frames_next();
        let ch = self.channels;
        let filled = if needed > 0 {
            self.pulled.clear();
            self.pulled.resize(needed * ch, 0.0);
            let filled = source.fill_audio_playback_frames(needed, delay, &mut self.pulled).min(needed);
            for (i, frame) in self.pulled.chunks_exact(ch).enumerate() {
                for (c, sample) in frame.iter().enumerate() {
                    self.planar_in[c][i] = *sample;
                }
            }
            filled
        } else {
            0
        };

        let produced = match self.inner.process_into_buffer(&self.planar_in, &mut self.planar_out, None) {
            Ok((_, produced)) => produced.min(frames),
            Err(err) => {
                warn!(error = %err, "resampling failed");
                0
            }
        };

        dest[..frames * ch].fill(0.0);
        for i in 0..produced {
            for c in 0..ch {
                dest[i * ch + c] = self.planar_out[c][i];
            }
        }
        produced > 0 && (filled > 0 || source.active())
    }
}

/// A source plus its mixing state. Exactly one per live `InputId`.
pub struct MixerInput {
    id: InputId,
    source: Box<dyn Source>,
    device_id: String,
    primary: bool,
    content_type: AudioContentType,
    focus_type: AudioContentType,
    num_channels: usize,
    sample_rate: u32,

    group: Option<GroupId>,
    group_channels: usize,
    group_rate: u32,
    initialized: bool,
    errored: bool,

    resampler: Option<InputResampler>,
    channel_mixer: Option<InterleavedChannelMixer>,
    source_buffer: Vec<f32>,

    content_type_volume: f32,
    multiplier: f32,
    output_limit: f32,
    muted: bool,
    ramp: VolumeRamp,
}

impl MixerInput {
    pub fn new(id: InputId, source: Box<dyn Source>) -> Self {
        let device_id = source.device_id().to_string();
        Self {
            id,
            device_id,
            primary: source.primary(),
            content_type: source.content_type(),
            focus_type: source.focus_type(),
            num_channels: source.num_channels(),
            sample_rate: source.sample_rate(),
            source,
            group: None,
            group_channels: 0,
            group_rate: 0,
            initialized: false,
            errored: false,
            resampler: None,
            channel_mixer: None,
            source_buffer: Vec::new(),
            content_type_volume: 1.0,
            multiplier: 1.0,
            output_limit: 1.0,
            muted: false,
            ramp: VolumeRamp::new(1.0),
        }
    }

    pub fn id(&self) -> InputId {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn primary(&self) -> bool {
        self.primary
    }

    pub fn content_type(&self) -> AudioContentType {
        self.content_type
    }

    pub fn focus_type(&self) -> AudioContentType {
        self.focus_type
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn playout_channel(&self) -> PlayoutChannel {
        self.source.playout_channel()
    }

    pub fn active(&self) -> bool {
        !self.errored && self.source.active()
    }

    pub fn source(&self) -> &dyn Source {
        self.source.as_ref()
    }

    pub(crate) fn source_mut(&mut self) -> &mut dyn Source {
        self.source.as_mut()
    }

    /// Volume the ramp is heading to
    pub fn target_volume(&self) -> f32 {
        if self.muted {
            return 0.0;
        }
        (self.multiplier * self.content_type_volume).min(self.output_limit)
    }

    /// Volume applied to the next frame
    pub fn instantaneous_volume(&self) -> f32 {
        self.ramp.current
    }

    /// Attach to `group`, rendering `frames_per_write` frames per round
    pub(crate) fn attach(&mut self, group: &FilterGroup, frames_per_write: usize) {
        self.group = Some(group.id());
        self.group_channels = group.input_channels();
        self.group_rate = group.sample_rate();
        self.errored = false;

        self.resampler = None;
        if self.sample_rate != self.group_rate && self.group_rate > 0 {
            match InputResampler::new(self.sample_rate, self.group_rate, frames_per_write, self.num_channels) {
                Ok(resampler) => self.resampler = Some(resampler),
                Err(err) => {
                    warn!(input = %self.id, source_rate = self.sample_rate, group_rate = self.group_rate,
                        error = %err, "unable to create resampler, playing unresampled");
                }
            }
        }

        self.channel_mixer = (self.num_channels != self.group_channels).then(|| {
            InterleavedChannelMixer::new(
                guess_channel_layout(self.num_channels),
                self.num_channels,
                guess_channel_layout(self.group_channels),
                self.group_channels,
                frames_per_write,
            )
        });
        self.source_buffer = vec![0.0; frames_per_write * self.num_channels];

        debug!(input = %self.id, group = group.name(), resampled = self.resampler.is_some(),
            remixed = self.channel_mixer.is_some(), "input attached");

        if !self.initialized {
            self.initialized = true;
            self.source.initialize_audio_playback(frames_per_write, RenderingDelay::default());
        }
    }

    pub(crate) fn detach(&mut self) {
        self.group = None;
        self.resampler = None;
        self.channel_mixer = None;
    }

    /// Report `error` to the source and stop rendering
    pub(crate) fn signal_error(&mut self, error: MixerError) {
        self.errored = true;
        self.detach();
        self.source.on_error(error);
    }

    fn fade_frames(&self, fade: Duration) -> usize {
        let rate = if self.group_rate > 0 {
            self.group_rate
        } else {
            self.sample_rate
        };
        (fade.as_secs_f64() * rate as f64).round() as usize
    }

    fn update_target(&mut self, fade: Option<Duration>) {
        let frames = self.fade_frames(fade.unwrap_or(DEFAULT_FADE));
        self.ramp.set_target(self.target_volume(), frames);
    }

    /// Type volume, 0.0 to 1.0
    pub(crate) fn set_content_type_volume(&mut self, volume: f32) {
        self.content_type_volume = volume.clamp(0.0, 1.0);
        self.update_target(None);
    }

    pub(crate) fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.update_target(None);
    }

    /// Ducking limit; `fade` of `None` uses the default fade
    pub(crate) fn set_output_limit(&mut self, limit: f32, fade: Option<Duration>) {
        self.output_limit = limit.clamp(0.0, 1.0);
        self.update_target(fade);
    }

    pub(crate) fn set_volume_multiplier(&mut self, multiplier: f32) {
        self.multiplier = multiplier.max(0.0);
        self.update_target(None);
    }

    /// Type volume, limit and mute without a fade; used before first render
    pub(crate) fn apply_initial_volume(&mut self, volume: f32, muted: bool) {
        self.content_type_volume = volume.clamp(0.0, 1.0);
        self.muted = muted;
        self.ramp = VolumeRamp::new(self.target_volume());
    }

    /// Frames left until the ramp reaches its target
    pub fn fade_frames_remaining(&self) -> usize {
        self.ramp.remaining
    }
}

impl GroupInput for MixerInput {
    fn filter_group(&self) -> Option<GroupId> {
        self.group
    }

    fn render(&mut self, frames: usize, delay: RenderingDelay, dest: &mut [f32]) -> bool {
        if self.group.is_none() || self.errored {
            return false;
        }
        let in_ch = self.num_channels;
        let needed = frames * in_ch;
        if self.source_buffer.len() < needed {
            self.source_buffer.resize(needed, 0.0);
        }

        let has_audio = match self.resampler.as_mut() {
            Some(resampler) => resampler.render(self.source.as_mut(), frames, delay, &mut self.source_buffer),
            None => {
                let buffer = &mut self.source_buffer[..needed];
                buffer.fill(0.0);
                self.source.fill_audio_playback_frames(frames, delay, buffer) > 0
            }
        };
        if !has_audio {
            return false;
        }

        let out_ch = self.group_channels;
        let data: &[f32] = match self.channel_mixer.as_mut() {
            Some(mixer) => &*mixer.transform(&self.source_buffer[..needed], frames),
            None => &self.source_buffer[..needed],
        };

        let ramp = &mut self.ramp;
        for (in_frame, out_frame) in data.chunks_exact(out_ch).zip(dest.chunks_exact_mut(out_ch)).take(frames) {
            let gain = ramp.next();
            for (out, sample) in out_frame.iter_mut().zip(in_frame) {
                *out = sample * gain;
            }
        }
        true
    }
}

impl Drop for MixerInput {
    fn drop(&mut self) {
        self.source.finalize_audio_playback();
    }
}

impl std::fmt::Debug for MixerInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixerInput")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("primary", &self.primary)
            .field("content_type", &self.content_type)
            .field("group", &self.group)
            .field("target_volume", &self.target_volume())
            .finish()
    }
}
