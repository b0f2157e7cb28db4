//! Test doubles shared by the unit tests

use crate::output::{MixerOutputStream, OutputError, WriteOutcome};
use crate::source::{AudioContentType, MixerError, Source};
use amix_dsp::{PlayoutChannel, RenderingDelay, DEFAULT_DEVICE_ID};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug)]
struct SourceState {
    active: bool,
    initialized: usize,
    errors: Vec<MixerError>,
    underruns: usize,
    finalized: bool,
    pulls: usize,
    last_delay: Option<RenderingDelay>,
}

/// Shared view into a `FakeSource` after the mixer took ownership of it
#[derive(Debug, Clone)]
pub(crate) struct SourceProbe {
    state: Arc<Mutex<SourceState>>,
}

impl Default for SourceProbe {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState {
                active: true,
                initialized: 0,
                errors: Vec::new(),
                underruns: 0,
                finalized: false,
                pulls: 0,
                last_delay: None,
            })),
        }
    }
}

impl SourceProbe {
    pub(crate) fn set_active(&self, active: bool) {
        self.state.lock().active = active;
    }

    pub(crate) fn initialized(&self) -> usize {
        self.state.lock().initialized
    }

    pub(crate) fn errors(&self) -> Vec<MixerError> {
        self.state.lock().errors.clone()
    }

    pub(crate) fn underruns(&self) -> usize {
        self.state.lock().underruns
    }

    pub(crate) fn finalized(&self) -> bool {
        self.state.lock().finalized
    }

    pub(crate) fn pulls(&self) -> usize {
        self.state.lock().pulls
    }

    pub(crate) fn last_delay(&self) -> Option<RenderingDelay> {
        self.state.lock().last_delay
    }
}

/// Source producing a constant value on every channel
pub(crate) struct FakeSource {
    device_id: String,
    primary: bool,
    content_type: AudioContentType,
    channels: usize,
    sample_rate: u32,
    playout_channel: PlayoutChannel,
    value: f32,
    probe: SourceProbe,
}

impl FakeSource {
    /// Primary media stream on the default device
    pub(crate) fn media(channels: usize, sample_rate: u32) -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID.to_string(),
            primary: true,
            content_type: AudioContentType::Media,
            channels,
            sample_rate,
            playout_channel: PlayoutChannel::All,
            value: 0.5,
            probe: SourceProbe::default(),
        }
    }

    /// Non-primary stream on `device_id`
    pub(crate) fn effects(device_id: &str, channels: usize, sample_rate: u32) -> Self {
        Self {
            device_id: device_id.to_string(),
            primary: false,
            ..Self::media(channels, sample_rate)
        }
    }

    pub(crate) fn with_value(mut self, value: f32) -> Self {
        self.value = value;
        self
    }

    pub(crate) fn with_probe(mut self, probe: &SourceProbe) -> Self {
        self.probe = probe.clone();
        self
    }

    pub(crate) fn with_content_type(mut self, content_type: AudioContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub(crate) fn with_playout_channel(mut self, channel: PlayoutChannel) -> Self {
        self.playout_channel = channel;
        self
    }
}

impl Source for FakeSource {
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

    fn playout_channel(&self) -> PlayoutChannel {
        self.playout_channel
    }

    fn active(&self) -> bool {
        self.probe.state.lock().active
    }

    fn initialize_audio_playback(&mut self, _read_size: usize, _initial_delay: RenderingDelay) {
        self.probe.state.lock().initialized += 1;
    }

    fn fill_audio_playback_frames(&mut self, frames: usize, delay: RenderingDelay, dest: &mut [f32]) -> usize {
        let mut state = self.probe.state.lock();
        state.pulls += 1;
        state.last_delay = Some(delay);
        if !state.active {
            return 0;
        }
        dest[..frames * self.channels].fill(self.value);
        frames
    }

    fn on_output_underrun(&mut self) {
        self.probe.state.lock().underruns += 1;
    }

    fn on_error(&mut self, error: MixerError) {
        self.probe.state.lock().errors.push(error);
    }

    fn finalize_audio_playback(&mut self) {
        self.probe.state.lock().finalized = true;
    }
}

#[derive(Debug, Default)]
struct OutputState {
    starts: Vec<(u32, usize)>,
    stops: usize,
    writes: Vec<Vec<f32>>,
    fail_start: bool,
    interrupt_next: bool,
}

/// Shared view into a `FakeOutput`
#[derive(Debug, Clone, Default)]
pub(crate) struct OutputProbe {
    state: Arc<Mutex<OutputState>>,
}

impl OutputProbe {
    /// `(sample_rate, channels)` of every successful start
    pub(crate) fn starts(&self) -> Vec<(u32, usize)> {
        self.state.lock().starts.clone()
    }

    pub(crate) fn stops(&self) -> usize {
        self.state.lock().stops
    }

    pub(crate) fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub(crate) fn last_write(&self) -> Option<Vec<f32>> {
        self.state.lock().writes.last().cloned()
    }

    pub(crate) fn writes(&self) -> Vec<Vec<f32>> {
        self.state.lock().writes.clone()
    }

    pub(crate) fn set_fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    /// Report an interruption on the next write
    pub(crate) fn interrupt_next_write(&self) {
        self.state.lock().interrupt_next = true;
    }
}

/// Output that records everything and never blocks
pub(crate) struct FakeOutput {
    probe: OutputProbe,
    write_frames: usize,
    /// Rate the device insists on, if any
    forced_rate: Option<u32>,
    sample_rate: u32,
    channels: usize,
    started: bool,
}

impl FakeOutput {
    pub(crate) fn new(probe: &OutputProbe, write_frames: usize) -> Self {
        Self {
            probe: probe.clone(),
            write_frames,
            forced_rate: None,
            sample_rate: 0,
            channels: 0,
            started: false,
        }
    }

    pub(crate) fn with_forced_rate(mut self, rate: u32) -> Self {
        self.forced_rate = Some(rate);
        self
    }
}

impl MixerOutputStream for FakeOutput {
    fn start(&mut self, sample_rate: u32, channels: usize) -> Result<(), OutputError> {
        let mut state = self.probe.state.lock();
        if state.fail_start {
            return Err(OutputError::Unavailable("fake device unplugged".to_string()));
        }
        self.sample_rate = self.forced_rate.unwrap_or(sample_rate);
        self.channels = channels;
        self.started = true;
        state.starts.push((self.sample_rate, channels));
        Ok(())
    }

    fn stop(&mut self) {
        self.started = false;
        self.probe.state.lock().stops += 1;
    }

    fn write(&mut self, data: &[f32]) -> Result<WriteOutcome, OutputError> {
        if !self.started {
            return Err(OutputError::NotStarted);
        }
        let mut state = self.probe.state.lock();
        state.writes.push(data.to_vec());
        let interrupted = std::mem::take(&mut state.interrupt_next);
        Ok(WriteOutcome { interrupted })
    }

    fn rendering_delay(&self) -> RenderingDelay {
        if !self.started {
            return RenderingDelay::default();
        }
        let writes = self.probe.state.lock().writes.len() as i64;
        RenderingDelay::new(2000, 1000 * (writes + 1))
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
