//! Mixer core - everything that runs on the mixer thread
//!
//! `MixerCore` owns the inputs, the pipeline, the output stream and the
//! playback loop. It is driven entirely by `MixerTask`s taken off the
//! mailbox; the playback loop reposts itself as a task after every buffer
//! so control tasks interleave with audio rounds in FIFO order.

use crate::config::{MixerConfig, FALLBACK_SAMPLE_RATE};
use crate::engine::ResultCallback;
use crate::input::MixerInput;
use crate::loopback::{LoopbackInterruptReason, LoopbackSink};
use crate::output::{MixerOutputStream, OutputFactory};
use crate::receiver::{StreamCountObserver, StreamCounts};
use crate::redirector::{AudioOutputRedirector, RedirectorId};
use crate::source::{AudioContentType, InputId, MixerError, Source};
use crate::volume::{VolumeMap, VolumeTable};
use amix_dsp::{
    guess_channel_layout, InterleavedChannelMixer, MixerPipeline, PipelineDescription, PipelineError, PlayoutChannel,
    ProcessorRegistry, DEFAULT_DEVICE_ID, REDIRECTABLE_DEVICE_IDS,
};
use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Channel count the pipeline is built for until a stream asks otherwise
const DEFAULT_INPUT_CHANNELS: usize = 2;
const MEDIA_DUCK_FADE: Duration = Duration::from_millis(150);
const MEDIA_UNDUCK_FADE: Duration = Duration::from_millis(700);

/// Output state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MixerState {
    Stopped,
    Running,
}

/// Work for the mixer thread
pub(crate) enum MixerTask {
    AddInput(InputId, Box<dyn Source>),
    RemoveInput(InputId),
    SetVolume(AudioContentType, f32),
    SetMuted(AudioContentType, bool),
    SetOutputLimit(AudioContentType, f32),
    SetVolumeMultiplier(InputId, f32),
    SetPostProcessorConfig { name: String, config: String },
    SetNumOutputChannels(usize),
    ResetPostProcessors(ResultCallback),
    AddRedirector(RedirectorId, Box<dyn AudioOutputRedirector>),
    RemoveRedirector(RedirectorId),
    /// One playback round; stale generations are dropped
    PlaybackLoop { generation: u64 },
    HealthCheck(Sender<()>),
    Shutdown,
}

/// Where the primary pipeline description comes from
#[derive(Debug, Clone)]
pub(crate) enum PipelineSource {
    Json(String),
    File(PathBuf),
}

impl PipelineSource {
    fn load(&self) -> Result<PipelineDescription, PipelineError> {
        match self {
            PipelineSource::Json(json) => PipelineDescription::from_json(json),
            PipelineSource::File(path) if !path.exists() => {
                debug!(path = %path.display(), "no pipeline description, using an empty one");
                Ok(PipelineDescription::default())
            }
            PipelineSource::File(path) => PipelineDescription::load(path),
        }
    }

    /// Volume map of the description; the default map if it is unusable
    pub(crate) fn volume_map(&self) -> VolumeMap {
        match self {
            PipelineSource::File(path) => VolumeMap::load(path),
            PipelineSource::Json(json) => match PipelineDescription::from_json(json) {
                Ok(description) => VolumeMap::from_points(description.volume_map),
                Err(err) => {
                    warn!(error = %err, "unable to parse volume map, using default");
                    VolumeMap::default()
                }
            },
        }
    }
}

/// Everything the core is built from
pub(crate) struct MixerParts {
    pub(crate) config: MixerConfig,
    pub(crate) pipeline_source: PipelineSource,
    pub(crate) registry: ProcessorRegistry,
    pub(crate) output: Option<Box<dyn MixerOutputStream>>,
    pub(crate) output_factory: OutputFactory,
    pub(crate) loopback: Box<dyn LoopbackSink>,
    pub(crate) observer: Option<Box<dyn StreamCountObserver>>,
}

/// Build the pipeline from `source`, falling back to the read-only
/// description. Panics if even that fails.
fn build_pipeline(
    source: &PipelineSource,
    registry: &ProcessorRegistry,
    callback: Option<ResultCallback>,
    expected_input_channels: usize,
) -> MixerPipeline {
    let primary = source
        .load()
        .and_then(|description| MixerPipeline::new(&description, registry, expected_input_channels));
    match primary {
        Ok(pipeline) => {
            if let Some(callback) = callback {
                callback(true, String::new());
            }
            pipeline
        }
        Err(err) => {
            warn!(error = %err, "invalid pipeline description, using read-only description");
            if let Some(callback) = callback {
                callback(false, format!("unable to build pipeline: {err}"));
            }
            match PipelineDescription::read_only()
                .and_then(|description| MixerPipeline::new(&description, registry, expected_input_channels))
            {
                Ok(pipeline) => pipeline,
                Err(err) => {
                    error!(error = %err, "read-only pipeline description failed");
                    panic!("unable to build read-only pipeline: {err}");
                }
            }
        }
    }
}

/// Clip samples to [-1, 1] in place
#[inline]
fn clip(data: &mut [f32]) {
    for sample in data {
        *sample = sample.clamp(-1.0, 1.0);
    }
}

pub(crate) struct MixerCore {
    // Configuration
    enable_dynamic_channel_count: bool,
    low_sample_rate_cutoff: Option<u32>,
    fixed_output_channels: Option<usize>,
    fixed_output_sample_rate: Option<u32>,
    close_timeout: Option<Duration>,
    filter_frame_alignment: usize,
    pipeline_source: PipelineSource,
    registry: ProcessorRegistry,

    pipeline: MixerPipeline,
    post_processor_input_channels: usize,
    requested_input_channels: usize,
    requested_output_sample_rate: u32,

    output: Option<Box<dyn MixerOutputStream>>,
    output_factory: OutputFactory,
    output_sample_rate: Option<u32>,
    num_output_channels: usize,
    frames_per_write: usize,
    output_channel_mixer: Option<InterleavedChannelMixer>,
    loopback_channel_mixer: Option<InterleavedChannelMixer>,
    loopback: Box<dyn LoopbackSink>,
    observer: Option<Box<dyn StreamCountObserver>>,

    inputs: BTreeMap<InputId, MixerInput>,
    ignored_inputs: BTreeMap<InputId, MixerInput>,
    redirectors: Vec<(RedirectorId, Box<dyn AudioOutputRedirector>)>,
    redirector_sample_rate: u32,
    redirector_frames_per_write: usize,

    volume_info: VolumeTable,
    playout_channel: PlayoutChannel,
    state: MixerState,
    generation: u64,
    /// `None` never closes
    close_deadline: Option<Instant>,
    last_stream_counts: Option<StreamCounts>,
    tasks: Sender<MixerTask>,
}

impl MixerCore {
    /// Build the core. `tasks` is the core's own mailbox, used to repost
    /// the playback loop.
    pub(crate) fn new(parts: MixerParts, tasks: Sender<MixerTask>) -> Self {
        let MixerParts {
            config,
            pipeline_source,
            registry,
            output,
            output_factory,
            loopback,
            observer,
        } = parts;
        assert!(
            config.filter_frame_alignment.is_power_of_two(),
            "filter frame alignment {} is not a power of two",
            config.filter_frame_alignment
        );

        let pipeline = build_pipeline(&pipeline_source, &registry, None, DEFAULT_INPUT_CHANNELS);
        let mut core = Self {
            enable_dynamic_channel_count: config.enable_dynamic_channel_count,
            low_sample_rate_cutoff: config.low_sample_rate_cutoff(),
            fixed_output_channels: config.output_channels,
            fixed_output_sample_rate: config.output_sample_rate,
            close_timeout: config.close_timeout(),
            filter_frame_alignment: config.filter_frame_alignment,
            pipeline_source,
            registry,
            pipeline,
            post_processor_input_channels: DEFAULT_INPUT_CHANNELS,
            requested_input_channels: DEFAULT_INPUT_CHANNELS,
            requested_output_sample_rate: FALLBACK_SAMPLE_RATE,
            output,
            output_factory,
            output_sample_rate: None,
            num_output_channels: 0,
            frames_per_write: 0,
            output_channel_mixer: None,
            loopback_channel_mixer: None,
            loopback,
            observer,
            inputs: BTreeMap::new(),
            ignored_inputs: BTreeMap::new(),
            redirectors: Vec::new(),
            redirector_sample_rate: 0,
            redirector_frames_per_write: 0,
            volume_info: VolumeTable::default(),
            playout_channel: PlayoutChannel::All,
            state: MixerState::Stopped,
            generation: 0,
            close_deadline: None,
            last_stream_counts: None,
            tasks,
        };
        core.check_fixed_output_channels();
        core.pipeline.set_playout_channel(PlayoutChannel::All);
        core.set_close_timeout();
        core.update_stream_counts();
        core
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> MixerState {
        self.state
    }

    /// Run one task; returns `false` once the core has shut down
    pub(crate) fn handle_task(&mut self, task: MixerTask) -> bool {
        match task {
            MixerTask::AddInput(id, source) => self.add_input(id, source),
            MixerTask::RemoveInput(id) => self.remove_input(id),
            MixerTask::SetVolume(content_type, level) => self.set_volume(content_type, level),
            MixerTask::SetMuted(content_type, muted) => self.set_muted(content_type, muted),
            MixerTask::SetOutputLimit(content_type, limit) => self.set_output_limit(content_type, limit),
            MixerTask::SetVolumeMultiplier(id, multiplier) => self.set_volume_multiplier(id, multiplier),
            MixerTask::SetPostProcessorConfig { name, config } => self.set_post_processor_config(&name, &config),
            MixerTask::SetNumOutputChannels(channels) => self.set_num_output_channels(channels),
            MixerTask::ResetPostProcessors(callback) => self.reset_post_processors(callback),
            MixerTask::AddRedirector(id, redirector) => self.add_redirector(id, redirector),
            MixerTask::RemoveRedirector(id) => self.remove_redirector(id),
            MixerTask::PlaybackLoop { generation } => self.playback_loop(generation),
            MixerTask::HealthCheck(reply) => {
                let _ = reply.send(());
            }
            MixerTask::Shutdown => {
                self.stop(LoopbackInterruptReason::OutputStopped);
                self.inputs.clear();
                self.ignored_inputs.clear();
                info!("mixer shut down");
                return false;
            }
        }
        true
    }

    fn below_cutoff(&self, sample_rate: u32) -> bool {
        self.low_sample_rate_cutoff.is_some_and(|cutoff| sample_rate < cutoff)
    }

    /// Channel count the pipeline should be built for to play `source`
    fn effective_channel_count(&self, source: &dyn Source) -> usize {
        if !self.enable_dynamic_channel_count {
            return DEFAULT_INPUT_CHANNELS;
        }
        source.num_channels().max(DEFAULT_INPUT_CHANNELS)
    }

    fn check_fixed_output_channels(&self) {
        if let Some(fixed) = self.fixed_output_channels {
            let pipeline_channels = self.pipeline.output_channel_count();
            if fixed != pipeline_channels {
                warn!(
                    fixed_channels = fixed,
                    pipeline_channels, "fixed output channel count differs from pipeline output; remixing"
                );
            }
        }
    }

    fn create_post_processors(&mut self, callback: Option<ResultCallback>, expected_input_channels: usize) {
        debug!(channels = expected_input_channels, "building pipeline");
        self.pipeline = build_pipeline(&self.pipeline_source, &self.registry, callback, expected_input_channels);
        self.check_fixed_output_channels();
        if self.state == MixerState::Running {
            if let Some(rate) = self.output_sample_rate {
                self.pipeline.initialize(rate, self.frames_per_write);
            }
        }
        self.post_processor_input_channels = expected_input_channels;
    }

    fn attach_inputs(&mut self) {
        let frames = self.frames_per_write;
        for input in self.inputs.values_mut() {
            let group_id = self.pipeline.input_group(input.device_id());
            if let Some(group) = self.pipeline.group(group_id) {
                input.attach(group, frames);
            }
        }
    }

    fn detach_inputs(&mut self) {
        for input in self.inputs.values_mut() {
            input.detach();
        }
    }

    fn post_playback_loop(&self) {
        let _ = self.tasks.send(MixerTask::PlaybackLoop {
            generation: self.generation,
        });
    }

    pub(crate) fn start(&mut self) {
        self.detach_inputs();
        if self.post_processor_input_channels != self.requested_input_channels {
            self.create_post_processors(None, self.requested_input_channels);
        }

        let channels = self
            .fixed_output_channels
            .unwrap_or_else(|| self.pipeline.output_channel_count());
        let sample_rate = match self.fixed_output_sample_rate {
            Some(rate) => rate,
            None if self.below_cutoff(self.requested_output_sample_rate) => FALLBACK_SAMPLE_RATE,
            None => self.requested_output_sample_rate,
        };

        let output = self.output.get_or_insert_with(|| (self.output_factory)());
        if let Err(err) = output.start(sample_rate, channels) {
            error!(sample_rate, channels, error = %err, "unable to start output");
            self.stop(LoopbackInterruptReason::OutputStopped);
            return;
        }
        let device_channels = output.num_channels();
        let device_rate = output.sample_rate();
        let optimal_frames = output.optimal_write_frames_count();

        self.num_output_channels = device_channels;
        self.output_sample_rate = Some(device_rate);
        let alignment = self.filter_frame_alignment;
        let frames = optimal_frames & !(alignment - 1);
        assert!(
            frames > 0,
            "frames per write is zero (device wants {optimal_frames}, alignment {alignment})"
        );
        self.frames_per_write = frames;
        self.build_channel_mixers();

        self.pipeline.initialize(device_rate, frames);

        self.redirector_sample_rate = self.pipeline.input_sample_rate(DEFAULT_DEVICE_ID);
        for device_id in REDIRECTABLE_DEVICE_IDS {
            assert_eq!(
                self.pipeline.input_sample_rate(device_id),
                self.redirector_sample_rate,
                "redirectable stream '{device_id}' runs at a different sample rate"
            );
        }
        self.redirector_frames_per_write =
            (self.redirector_sample_rate as u64 * frames as u64 / device_rate as u64) as usize;
        for (_, redirector) in &mut self.redirectors {
            redirector.set_sample_rate(self.redirector_sample_rate);
        }

        self.state = MixerState::Running;
        info!(
            sample_rate = device_rate,
            channels = device_channels,
            frames_per_write = frames,
            "mixer output started"
        );

        // Prime the device with silence before any input renders
        self.write_one_buffer();
        self.attach_inputs();
        self.post_playback_loop();
    }

    /// Remixers from the pipeline's output and loopback tap to the device
    /// and loopback channel counts
    fn build_channel_mixers(&mut self) {
        let frames = self.frames_per_write;
        let device_channels = self.num_output_channels;
        let pipeline_channels = self.pipeline.output_channel_count();
        self.output_channel_mixer = Some(InterleavedChannelMixer::new(
            guess_channel_layout(pipeline_channels),
            pipeline_channels,
            guess_channel_layout(device_channels),
            device_channels,
            frames,
        ));
        let loopback_in = self.pipeline.loopback_channel_count();
        let loopback_out = if !self.enable_dynamic_channel_count && device_channels == 1 {
            1
        } else {
            loopback_in
        };
        self.loopback_channel_mixer = Some(InterleavedChannelMixer::new(
            guess_channel_layout(loopback_in),
            loopback_in,
            guess_channel_layout(loopback_out),
            loopback_out,
            frames,
        ));
        self.loopback.set_data_size(frames * loopback_out * std::mem::size_of::<f32>());
        debug!(pipeline_channels, device_channels, loopback_in, loopback_out, "channel mixers built");
    }

    pub(crate) fn stop(&mut self, reason: LoopbackInterruptReason) {
        self.generation += 1;
        if self.state == MixerState::Running {
            info!(%reason, "stopping mixer output");
            self.loopback.send_interrupt(reason);
            if let Some(output) = self.output.as_mut() {
                output.stop();
            }
        }
        self.state = MixerState::Stopped;
        self.output_sample_rate = None;
    }

    fn check_change_output_params(&mut self, channels: usize, sample_rate: u32) {
        if self.state != MixerState::Running {
            return;
        }
        let rate_acceptable = self.fixed_output_sample_rate.is_some()
            || sample_rate == self.requested_output_sample_rate
            || Some(sample_rate) == self.output_sample_rate
            || self.below_cutoff(sample_rate);
        if channels == self.post_processor_input_channels && rate_acceptable {
            return;
        }
        if self.inputs.values().any(MixerInput::primary) {
            debug!(channels, sample_rate, "primary stream playing, keeping output parameters");
            return;
        }

        info!(
            from_channels = self.post_processor_input_channels,
            to_channels = channels,
            from_rate = self.requested_output_sample_rate,
            to_rate = sample_rate,
            "renegotiating output"
        );
        self.signal_error(MixerError::InputIgnored);
        self.requested_input_channels = channels;
        self.requested_output_sample_rate = sample_rate;
        self.stop(LoopbackInterruptReason::ConfigChange);
        self.start();
    }

    fn add_input(&mut self, id: InputId, source: Box<dyn Source>) {
        if source.num_channels() == 0 || source.sample_rate() == 0 {
            warn!(
                input = %id,
                channels = source.num_channels(),
                sample_rate = source.sample_rate(),
                "rejecting input with empty format"
            );
            let mut input = MixerInput::new(id, source);
            input.signal_error(MixerError::InternalError);
            self.ignored_inputs.insert(id, input);
            return;
        }

        let channels = self.effective_channel_count(source.as_ref());
        let sample_rate = source.sample_rate();
        if source.primary() || self.inputs.is_empty() {
            self.check_change_output_params(channels, sample_rate);
        }
        if self.state == MixerState::Stopped {
            self.requested_input_channels = channels;
            self.requested_output_sample_rate = sample_rate;
            self.start();
        }

        let mut input = MixerInput::new(id, source);
        if self.state != MixerState::Running {
            warn!(input = %id, "output not running, ignoring input");
            input.signal_error(MixerError::InternalError);
            self.ignored_inputs.insert(id, input);
            return;
        }

        let group_id = self.pipeline.input_group(input.device_id());
        if let Some(group) = self.pipeline.group(group_id) {
            input.attach(group, self.frames_per_write);
        }

        let content_type = input.content_type();
        if content_type != AudioContentType::Other {
            let info = *self.volume_info.get(content_type);
            input.apply_initial_volume(info.volume, info.muted);
        }
        let focus_type = input.focus_type();
        if input.primary() && focus_type != AudioContentType::Other {
            input.set_output_limit(self.volume_info.get(focus_type).limit, None);
        }

        for (_, redirector) in &mut self.redirectors {
            redirector.add_input(&input);
        }
        info!(
            input = %id,
            device_id = input.device_id(),
            primary = input.primary(),
            %content_type,
            sample_rate,
            channels = input.num_channels(),
            "input added"
        );
        self.inputs.insert(id, input);
        self.update_playout_channel();
        self.update_stream_counts();
    }

    fn remove_input(&mut self, id: InputId) {
        if self.inputs.remove(&id).is_some() {
            for (_, redirector) in &mut self.redirectors {
                redirector.remove_input(id);
            }
            info!(input = %id, "input removed");
        }
        self.ignored_inputs.remove(&id);
        self.update_playout_channel();
        self.update_stream_counts();
        if self.inputs.is_empty() {
            self.set_close_timeout();
        }
    }

    /// Move every input to the ignored set, reporting `error`
    fn signal_error(&mut self, error: MixerError) {
        for (id, mut input) in std::mem::take(&mut self.inputs) {
            for (_, redirector) in &mut self.redirectors {
                redirector.remove_input(id);
            }
            input.signal_error(error);
            self.ignored_inputs.insert(id, input);
        }
        self.set_close_timeout();
        self.update_stream_counts();
    }

    fn set_close_timeout(&mut self) {
        self.close_deadline = self.close_timeout.map(|timeout| Instant::now() + timeout);
    }

    fn playback_loop(&mut self, generation: u64) {
        if generation != self.generation || self.state != MixerState::Running {
            return;
        }
        let idle_expired = self.close_deadline.is_some_and(|deadline| Instant::now() >= deadline);
        if self.inputs.is_empty() && idle_expired && !self.pipeline.is_ringing() {
            info!("no inputs, closing output");
            self.stop(LoopbackInterruptReason::OutputStopped);
            return;
        }

        self.write_one_buffer();
        self.update_stream_counts();
        self.post_playback_loop();
    }

    fn write_one_buffer(&mut self) {
        let frames = self.frames_per_write;
        for (_, redirector) in &mut self.redirectors {
            redirector.prepare_next_buffer(self.redirector_frames_per_write);
        }

        let delay = self
            .output
            .as_ref()
            .map(|output| output.rendering_delay())
            .unwrap_or_default();
        let redirectors = &mut self.redirectors;
        self.pipeline
            .mix_and_filter(self.inputs.values_mut(), frames, delay, |input, data, channels| {
                for (_, redirector) in redirectors.iter_mut() {
                    redirector.on_input_audio(input.id(), data, channels);
                }
            });

        let expected_playback_us = delay
            .timestamp_microseconds
            .map(|timestamp| timestamp + delay.delay_microseconds + self.pipeline.post_loopback_rendering_delay_us());

        for (_, redirector) in &mut self.redirectors {
            redirector.finish_buffer();
        }
        self.write_mixed_pcm(frames, expected_playback_us);
    }

    fn write_mixed_pcm(&mut self, frames: usize, expected_playback_us: Option<i64>) {
        let Some(rate) = self.output_sample_rate else {
            return;
        };
        let (Some(loopback_mixer), Some(output_mixer), Some(output)) = (
            self.loopback_channel_mixer.as_mut(),
            self.output_channel_mixer.as_mut(),
            self.output.as_mut(),
        ) else {
            return;
        };

        let loopback_channels = loopback_mixer.output_channels();
        let loopback_data = loopback_mixer.transform(self.pipeline.loopback_output(), frames);
        clip(loopback_data);
        self.loopback
            .send_data(expected_playback_us, rate, loopback_channels, loopback_data, frames);

        let output_data = output_mixer.transform(self.pipeline.output(), frames);
        clip(output_data);
        let interrupted = match output.write(output_data) {
            Ok(outcome) => outcome.interrupted,
            Err(err) => {
                warn!(error = %err, "output write failed");
                true
            }
        };

        if interrupted {
            debug!("output underrun");
            self.loopback.send_interrupt(LoopbackInterruptReason::Underrun);
            for input in self.inputs.values_mut() {
                input.source_mut().on_output_underrun();
            }
        }
    }

    fn update_playout_channel(&mut self) {
        let channel = self
            .inputs
            .values()
            .map(MixerInput::playout_channel)
            .min()
            .unwrap_or(PlayoutChannel::All);
        if channel != self.playout_channel {
            info!(?channel, "playout channel changed");
            self.playout_channel = channel;
            self.pipeline.set_playout_channel(channel);
        }
    }

    fn update_stream_counts(&mut self) {
        let mut counts = StreamCounts::default();
        for input in self.inputs.values() {
            let audible = input.target_volume() > 0.0 || input.instantaneous_volume() > 0.0;
            if !input.active() || !audible {
                continue;
            }
            if input.primary() {
                counts.primary += 1;
            } else {
                counts.sfx += 1;
            }
        }
        if self.last_stream_counts != Some(counts) {
            self.last_stream_counts = Some(counts);
            debug!(primary = counts.primary, sfx = counts.sfx, "stream counts changed");
            if let Some(observer) = self.observer.as_mut() {
                observer.on_stream_count_changed(counts.primary, counts.sfx);
            }
        }
    }

    fn set_volume(&mut self, content_type: AudioContentType, level: f32) {
        if content_type == AudioContentType::Other {
            warn!("volume of 'other' streams cannot be set");
            return;
        }
        let level = level.clamp(0.0, 1.0);
        debug!(%content_type, level, "set volume");
        self.volume_info.get_mut(content_type).volume = level;
        for input in self.inputs.values_mut() {
            if input.content_type() == content_type {
                input.set_content_type_volume(level);
            }
        }
        self.update_stream_counts();
    }

    fn set_muted(&mut self, content_type: AudioContentType, muted: bool) {
        if content_type == AudioContentType::Other {
            warn!("'other' streams cannot be muted");
            return;
        }
        debug!(%content_type, muted, "set muted");
        self.volume_info.get_mut(content_type).muted = muted;
        for input in self.inputs.values_mut() {
            if input.content_type() == content_type {
                input.set_muted(muted);
            }
        }
        self.update_stream_counts();
    }

    fn set_output_limit(&mut self, content_type: AudioContentType, limit: f32) {
        if content_type == AudioContentType::Other {
            warn!("output limit of 'other' streams cannot be set");
            return;
        }
        let limit = limit.clamp(0.0, 1.0);
        debug!(%content_type, limit, "set output limit");
        self.volume_info.get_mut(content_type).limit = limit;
        let fade = match content_type {
            AudioContentType::Media if limit >= 1.0 => Some(MEDIA_UNDUCK_FADE),
            AudioContentType::Media => Some(MEDIA_DUCK_FADE),
            _ => None,
        };
        for input in self.inputs.values_mut() {
            if input.primary() && input.focus_type() == content_type {
                input.set_output_limit(limit, fade);
            }
        }
        self.update_stream_counts();
    }

    fn set_volume_multiplier(&mut self, id: InputId, multiplier: f32) {
        if let Some(input) = self.inputs.get_mut(&id) {
            input.set_volume_multiplier(multiplier);
        }
        self.update_stream_counts();
    }

    fn set_post_processor_config(&mut self, name: &str, config: &str) {
        if let Err(err) = self.pipeline.set_post_processor_config(name, config) {
            warn!(processor = name, error = %err, "unable to apply post-processor config");
        }
    }

    fn set_num_output_channels(&mut self, channels: usize) {
        if channels == 0 {
            warn!("ignoring request for zero output channels");
            return;
        }
        info!(channels, "set number of output channels");
        self.enable_dynamic_channel_count = true;
        self.fixed_output_channels = Some(channels);
        if self.state == MixerState::Running && channels != self.num_output_channels {
            self.stop(LoopbackInterruptReason::ConfigChange);
            self.start();
        }
    }

    fn reset_post_processors(&mut self, callback: ResultCallback) {
        info!("resetting post-processors");
        self.detach_inputs();
        let expected = self
            .inputs
            .values()
            .filter(|input| input.primary())
            .map(MixerInput::num_channels)
            .fold(DEFAULT_INPUT_CHANNELS, usize::max);
        self.create_post_processors(Some(callback), expected);
        self.pipeline.set_playout_channel(self.playout_channel);
        if self.state == MixerState::Running {
            // The new pipeline may end in a different channel count
            self.build_channel_mixers();
            self.attach_inputs();
        }
        self.update_playout_channel();
    }

    fn add_redirector(&mut self, id: RedirectorId, mut redirector: Box<dyn AudioOutputRedirector>) {
        info!(redirector = %id, "redirector added");
        if self.state == MixerState::Running {
            redirector.set_sample_rate(self.redirector_sample_rate);
        }
        for input in self.inputs.values() {
            redirector.add_input(input);
        }
        self.redirectors.push((id, redirector));
    }

    fn remove_redirector(&mut self, id: RedirectorId) {
        self.redirectors.retain(|(redirector_id, _)| *redirector_id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackEvent, LoopbackHandler};
    use amix_dsp::GroupInput;
    use crate::output::NullOutputStream;
    use crate::redirector::ChannelRedirector;
    use crate::testing::{FakeOutput, FakeSource, OutputProbe, SourceProbe};
    use amix_dsp::READ_ONLY_PIPELINE_JSON;
    use crossbeam_channel::{unbounded, Receiver};
    use parking_lot::Mutex;
    use std::sync::Arc;

    const FRAMES: usize = 256;

    struct Harness {
        core: MixerCore,
        tasks: Receiver<MixerTask>,
        output: OutputProbe,
        loopback: Receiver<LoopbackEvent>,
        counts: Receiver<StreamCounts>,
    }

    impl Harness {
        fn new(config: MixerConfig) -> Self {
            Self::build(config, READ_ONLY_PIPELINE_JSON, |output| output)
        }

        fn build(config: MixerConfig, pipeline_json: &str, output: impl FnOnce(FakeOutput) -> FakeOutput) -> Self {
            let probe = OutputProbe::default();
            let loopback = LoopbackHandler::new();
            let loopback_rx = loopback.subscribe(4096);
            let (counts_tx, counts_rx) = unbounded();
            let (tx, rx) = unbounded();
            let parts = MixerParts {
                config,
                pipeline_source: PipelineSource::Json(pipeline_json.to_string()),
                registry: ProcessorRegistry::with_builtins(),
                output: Some(Box::new(output(FakeOutput::new(&probe, FRAMES)))),
                output_factory: Box::new(|| Box::new(NullOutputStream::new())),
                loopback: Box::new(loopback),
                observer: Some(Box::new(counts_tx)),
            };
            Self {
                core: MixerCore::new(parts, tx),
                tasks: rx,
                output: probe,
                loopback: loopback_rx,
                counts: counts_rx,
            }
        }

        fn add(&mut self, id: u64, source: FakeSource) {
            self.core.handle_task(MixerTask::AddInput(InputId(id), Box::new(source)));
        }

        fn remove(&mut self, id: u64) {
            self.core.handle_task(MixerTask::RemoveInput(InputId(id)));
        }

        /// Run queued tasks until `rounds` playback rounds ran or the queue is empty
        fn run(&mut self, rounds: usize) {
            let mut ran = 0;
            while ran < rounds {
                let Ok(task) = self.tasks.try_recv() else {
                    break;
                };
                if let MixerTask::PlaybackLoop { generation } = task {
                    if generation == self.core.generation {
                        ran += 1;
                    }
                }
                self.core.handle_task(task);
            }
        }

        fn loopback_events(&self) -> Vec<LoopbackEvent> {
            self.loopback.try_iter().collect()
        }

        fn interrupts(&self) -> Vec<LoopbackInterruptReason> {
            self.loopback_events()
                .into_iter()
                .filter_map(|event| match event {
                    LoopbackEvent::Interrupt(reason) => Some(reason),
                    LoopbackEvent::Data(_) => None,
                })
                .collect()
        }

        /// Indices of fully silent writes from `from` on
        fn silent_writes_from(&self, from: usize) -> Vec<usize> {
            self.output
                .writes()
                .iter()
                .enumerate()
                .skip(from)
                .filter(|(_, write)| write.iter().all(|s| *s == 0.0))
                .map(|(i, _)| i)
                .collect()
        }

        fn last_counts(&self) -> Option<StreamCounts> {
            self.counts.try_iter().last()
        }

        fn input(&self, id: u64) -> &MixerInput {
            &self.core.inputs[&InputId(id)]
        }
    }

    #[test]
    fn test_first_input_starts_output_with_silence() {
        let mut h = Harness::new(MixerConfig::default());
        assert_eq!(h.core.state(), MixerState::Stopped);
        h.add(1, FakeSource::media(2, 48000));

        assert_eq!(h.core.state(), MixerState::Running);
        assert_eq!(h.output.starts(), vec![(48000, 2)]);
        // Primed buffer is written before the input is attached
        assert_eq!(h.output.write_count(), 1);
        assert!(h.output.last_write().unwrap().iter().all(|s| *s == 0.0));

        h.run(1);
        let written = h.output.last_write().unwrap();
        assert_eq!(written.len(), FRAMES * 2);
        assert!(written.iter().all(|s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_loopback_send_per_round() {
        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::media(2, 48000));
        let primed = h.loopback_events();
        assert_eq!(primed.len(), 1);

        h.run(10);
        let events = h.loopback_events();
        assert_eq!(events.len(), 10);
        let mut last = None;
        for event in events {
            let LoopbackEvent::Data(data) = event else {
                panic!("unexpected interrupt");
            };
            assert_eq!(data.frames, FRAMES);
            assert_eq!(data.channels, 2);
            assert_eq!(data.sample_rate, 48000);
            let timestamp = data.timestamp_us.unwrap();
            assert!(last.map_or(true, |last| timestamp > last));
            last = Some(timestamp);
        }
    }

    #[test]
    fn test_output_and_loopback_clipped() {
        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::media(2, 48000).with_value(0.8));
        h.add(2, FakeSource::effects("alarm", 2, 48000).with_value(0.8));
        h.loopback_events();
        h.run(1);

        assert!(h.output.last_write().unwrap().iter().all(|s| *s == 1.0));
        let Some(LoopbackEvent::Data(data)) = h.loopback_events().pop() else {
            panic!("no loopback data");
        };
        assert!(data.samples.iter().all(|s| *s == 1.0));
    }

    #[test]
    fn test_idle_close_after_timeout() {
        let config = MixerConfig {
            check_close_timeout_ms: Some(0),
            ..MixerConfig::default()
        };
        let mut h = Harness::new(config);
        h.add(1, FakeSource::media(2, 48000));
        h.run(2);
        h.remove(1);
        // The groups still hold the last round's input: one more buffer plays out
        h.run(1);
        assert_eq!(h.core.state(), MixerState::Running);
        h.run(1);

        assert_eq!(h.core.state(), MixerState::Stopped);
        assert_eq!(h.output.stops(), 1);
        assert_eq!(h.interrupts(), vec![LoopbackInterruptReason::OutputStopped]);
        assert!(h.tasks.try_recv().is_err(), "stopped loop must not repost");
    }

    #[test]
    fn test_never_close_with_negative_timeout() {
        let config = MixerConfig {
            check_close_timeout_ms: Some(-1),
            ..MixerConfig::default()
        };
        let mut h = Harness::new(config);
        h.add(1, FakeSource::media(2, 48000));
        h.remove(1);
        let before = h.output.write_count();
        h.run(5);
        assert_eq!(h.core.state(), MixerState::Running);
        assert_eq!(h.output.write_count(), before + 5);
    }

    #[test]
    fn test_default_timeout_keeps_output_open() {
        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::media(2, 48000));
        h.remove(1);
        h.run(3);
        assert_eq!(h.core.state(), MixerState::Running);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::media(2, 48000));
        h.core.stop(LoopbackInterruptReason::OutputStopped);
        let writes = h.output.write_count();
        h.core.stop(LoopbackInterruptReason::OutputStopped);

        assert_eq!(h.output.stops(), 1);
        assert_eq!(h.interrupts(), vec![LoopbackInterruptReason::OutputStopped]);
        // Pending loop task belongs to the old generation
        h.run(1);
        assert_eq!(h.output.write_count(), writes);
    }

    #[test]
    fn test_media_ducking_fades() {
        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::media(2, 48000));
        h.add(2, FakeSource::effects("platform", 2, 48000));

        h.core.handle_task(MixerTask::SetOutputLimit(AudioContentType::Media, 0.3));
        assert_eq!(h.input(1).fade_frames_remaining(), 7200);
        assert!((h.input(1).target_volume() - 0.3).abs() < 1e-6);
        // Only primary inputs are ducked
        assert_eq!(h.input(2).target_volume(), 1.0);

        h.run(1);
        h.core.handle_task(MixerTask::SetOutputLimit(AudioContentType::Media, 1.0));
        assert_eq!(h.input(1).fade_frames_remaining(), 33600);
    }

    #[test]
    fn test_other_types_duck_with_default_fade() {
        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::media(2, 48000).with_content_type(AudioContentType::Alarm));
        h.core.handle_task(MixerTask::SetOutputLimit(AudioContentType::Alarm, 0.5));
        assert_eq!(h.input(1).fade_frames_remaining(), 720);
    }

    #[test]
    fn test_new_input_picks_up_type_settings() {
        let mut h = Harness::new(MixerConfig::default());
        h.core.handle_task(MixerTask::SetVolume(AudioContentType::Media, 0.6));
        h.core.handle_task(MixerTask::SetOutputLimit(AudioContentType::Media, 0.4));
        h.add(1, FakeSource::media(2, 48000));
        assert!((h.input(1).target_volume() - 0.4).abs() < 1e-6);

        h.core.handle_task(MixerTask::SetMuted(AudioContentType::Media, true));
        assert_eq!(h.input(1).target_volume(), 0.0);
        h.core.handle_task(MixerTask::SetMuted(AudioContentType::Media, false));
        h.core.handle_task(MixerTask::SetVolumeMultiplier(InputId(1), 0.5));
        assert!((h.input(1).target_volume() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_renegotiation_ignores_effects_streams() {
        let config = MixerConfig {
            enable_dynamic_channel_count: true,
            ..MixerConfig::default()
        };
        let mut h = Harness::new(config);
        let effects = SourceProbe::default();
        h.add(1, FakeSource::effects("alarm", 2, 48000).with_probe(&effects));
        h.add(2, FakeSource::media(2, 44100));

        assert_eq!(h.output.starts(), vec![(48000, 2), (44100, 2)]);
        assert_eq!(effects.errors(), vec![MixerError::InputIgnored]);
        assert!(h.core.ignored_inputs.contains_key(&InputId(1)));
        assert!(h.interrupts().contains(&LoopbackInterruptReason::ConfigChange));

        // A primary stream is playing: no renegotiation
        h.add(3, FakeSource::media(2, 48000));
        assert_eq!(h.output.starts().len(), 2);
        assert_eq!(h.core.inputs.len(), 2);
    }

    #[test]
    fn test_channel_change_renegotiates() {
        let config = MixerConfig {
            enable_dynamic_channel_count: true,
            ..MixerConfig::default()
        };
        let mut h = Harness::new(config);
        h.add(1, FakeSource::media(2, 48000));
        h.remove(1);
        h.add(2, FakeSource::media(6, 48000));

        assert_eq!(h.output.starts(), vec![(48000, 2), (48000, 6)]);
        assert_eq!(h.core.pipeline.expected_input_channels(), 6);
    }

    #[test]
    fn test_fixed_rate_skips_renegotiation() {
        let config = MixerConfig {
            output_sample_rate: Some(96000),
            ..MixerConfig::default()
        };
        let mut h = Harness::new(config);
        h.add(1, FakeSource::media(2, 48000));
        h.remove(1);
        h.add(2, FakeSource::media(2, 44100));
        assert_eq!(h.output.starts(), vec![(96000, 2)]);
    }

    #[test]
    fn test_low_rate_streams_use_fallback() {
        let config = MixerConfig {
            enable_upsampling: true,
            ..MixerConfig::default()
        };
        let mut h = Harness::new(config);
        h.add(1, FakeSource::media(1, 16000));
        assert_eq!(h.output.starts(), vec![(48000, 2)]);

        h.remove(1);
        let first = h.output.write_count();
        h.add(2, FakeSource::media(2, 24000));
        assert_eq!(h.output.starts().len(), 1);
        h.run(32);
        assert_eq!(h.silent_writes_from(first + 8), Vec::<usize>::new());
    }

    #[test]
    fn test_device_rate_honored() {
        let mut h = Harness::build(MixerConfig::default(), READ_ONLY_PIPELINE_JSON, |output| {
            output.with_forced_rate(44100)
        });
        h.add(1, FakeSource::media(2, 48000));
        assert_eq!(h.core.output_sample_rate, Some(44100));
        assert_eq!(h.core.pipeline.sample_rate(), 44100);
        h.run(32);
        // Every round after warm-up carries audio, including the ones where
        // the resampler needs no new input
        assert_eq!(h.silent_writes_from(8), Vec::<usize>::new());
    }

    #[test]
    fn test_start_failure_ignores_input() {
        let mut h = Harness::new(MixerConfig::default());
        h.output.set_fail_start(true);
        let probe = SourceProbe::default();
        h.add(1, FakeSource::media(2, 48000).with_probe(&probe));

        assert_eq!(h.core.state(), MixerState::Stopped);
        assert_eq!(probe.errors(), vec![MixerError::InternalError]);
        assert!(h.core.ignored_inputs.contains_key(&InputId(1)));
        assert!(h.interrupts().is_empty());

        h.remove(1);
        h.remove(1);
        assert!(h.core.ignored_inputs.is_empty());
        assert!(probe.finalized());
    }

    #[test]
    fn test_underrun_reported() {
        let mut h = Harness::new(MixerConfig::default());
        let probe = SourceProbe::default();
        h.add(1, FakeSource::media(2, 48000).with_probe(&probe));
        h.output.interrupt_next_write();
        h.run(1);

        assert_eq!(probe.underruns(), 1);
        assert_eq!(h.interrupts(), vec![LoopbackInterruptReason::Underrun]);
        h.run(1);
        assert_eq!(probe.underruns(), 1);
        assert_eq!(h.core.state(), MixerState::Running);
    }

    #[test]
    fn test_sources_told_output_delay() {
        let mut h = Harness::new(MixerConfig::default());
        let probe = SourceProbe::default();
        h.add(1, FakeSource::media(2, 48000).with_probe(&probe));
        h.run(1);
        assert_eq!(probe.pulls(), 1);
        let delay = probe.last_delay().unwrap();
        assert_eq!(delay.delay_microseconds, 2000);
        assert!(delay.timestamp_microseconds.is_some());
    }

    #[test]
    fn test_stream_counts_ignore_silent_streams() {
        let mut h = Harness::new(MixerConfig::default());
        assert_eq!(h.last_counts(), Some(StreamCounts { primary: 0, sfx: 0 }));

        h.add(1, FakeSource::media(2, 48000));
        h.add(2, FakeSource::effects("alarm", 2, 48000).with_content_type(AudioContentType::Alarm));
        assert_eq!(h.last_counts(), Some(StreamCounts { primary: 1, sfx: 1 }));

        h.core.handle_task(MixerTask::SetVolume(AudioContentType::Media, 0.0));
        // Still fading out
        h.run(1);
        assert!(h.last_counts().is_none());
        h.run(4);
        assert_eq!(h.last_counts(), Some(StreamCounts { primary: 0, sfx: 1 }));
    }

    #[test]
    fn test_inactive_source_not_counted() {
        let mut h = Harness::new(MixerConfig::default());
        let probe = SourceProbe::default();
        h.add(1, FakeSource::media(2, 48000).with_probe(&probe));
        assert_eq!(h.last_counts(), Some(StreamCounts { primary: 1, sfx: 0 }));
        probe.set_active(false);
        h.run(1);
        assert_eq!(h.last_counts(), Some(StreamCounts { primary: 0, sfx: 0 }));
    }

    #[test]
    fn test_set_num_output_channels_restarts_once() {
        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::media(2, 48000));
        h.run(2);
        h.loopback_events();

        h.core.handle_task(MixerTask::SetNumOutputChannels(6));
        assert_eq!(h.output.starts(), vec![(48000, 2), (48000, 6)]);
        assert_eq!(h.interrupts(), vec![LoopbackInterruptReason::ConfigChange]);

        h.run(1);
        assert_eq!(h.output.last_write().unwrap().len(), FRAMES * 6);

        h.core.handle_task(MixerTask::SetNumOutputChannels(6));
        assert_eq!(h.output.starts().len(), 2);
    }

    #[test]
    fn test_playout_channel_follows_inputs() {
        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::media(2, 48000).with_playout_channel(PlayoutChannel::Channel(1)));
        assert_eq!(h.core.playout_channel, PlayoutChannel::Channel(1));
        h.add(2, FakeSource::effects("alarm", 2, 48000));
        assert_eq!(h.core.playout_channel, PlayoutChannel::All);
        h.remove(2);
        assert_eq!(h.core.playout_channel, PlayoutChannel::Channel(1));
        h.remove(1);
        assert_eq!(h.core.playout_channel, PlayoutChannel::All);
    }

    #[test]
    fn test_post_processor_config_applied() {
        let json = r#"{ "postprocessors": {
            "output_streams": [ { "streams": ["default"] } ],
            "mix": { "processors": [ { "name": "volume", "type": "gain", "config": { "gain_db": 0.0 } } ] }
        } }"#;
        let mut h = Harness::build(MixerConfig::default(), json, |output| output);
        h.add(1, FakeSource::media(2, 48000));
        h.core.handle_task(MixerTask::SetPostProcessorConfig {
            name: "volume".to_string(),
            config: r#"{ "gain_db": -6.0206 }"#.to_string(),
        });
        h.run(1);
        let written = h.output.last_write().unwrap();
        assert!((written[0] - 0.25).abs() < 1e-3, "got {}", written[0]);

        // Unknown processors are only logged
        h.core.handle_task(MixerTask::SetPostProcessorConfig {
            name: "eq".to_string(),
            config: "{}".to_string(),
        });
        assert_eq!(h.core.state(), MixerState::Running);
    }

    #[test]
    fn test_reset_post_processors_reports_result() {
        let results = Arc::new(Mutex::new(Vec::new()));

        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::media(2, 48000));
        let sink = results.clone();
        h.core.handle_task(MixerTask::ResetPostProcessors(Box::new(move |ok, message| {
            sink.lock().push((ok, message));
        })));
        assert_eq!(results.lock().pop(), Some((true, String::new())));
        assert!(h.input(1).filter_group().is_some());
        h.run(1);
        assert!(h.output.last_write().unwrap().iter().all(|s| (s - 0.5).abs() < 1e-6));

        // Broken description: read-only fallback, failure reported
        let mut h = Harness::build(MixerConfig::default(), "{ not json", |output| output);
        h.add(1, FakeSource::media(2, 48000));
        let sink = results.clone();
        h.core.handle_task(MixerTask::ResetPostProcessors(Box::new(move |ok, message| {
            sink.lock().push((ok, message));
        })));
        let (ok, message) = results.lock().pop().unwrap();
        assert!(!ok);
        assert!(message.contains("unable to build pipeline"));
        h.run(1);
        assert!(h.output.last_write().unwrap().iter().any(|s| *s != 0.0));
    }

    #[test]
    fn test_reset_rebuilds_output_remix() {
        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::media(6, 48000).with_value(0.1));
        h.run(4);
        let before = h.output.last_write().unwrap();
        assert_eq!(h.core.pipeline.output_channel_count(), 2);

        // The rebuilt pipeline takes the primary's six channels
        h.core.handle_task(MixerTask::ResetPostProcessors(Box::new(|_, _| {})));
        assert_eq!(h.core.pipeline.output_channel_count(), 6);
        let remix = h.core.output_channel_mixer.as_ref().unwrap();
        assert_eq!(remix.input_channels(), 6);
        assert_eq!(remix.output_channels(), 2);

        h.run(4);
        let after = h.output.last_write().unwrap();
        assert_eq!(after.len(), FRAMES * 2);
        for (a, b) in after.iter().zip(&before) {
            assert!((a - b).abs() < 1e-4, "downmix changed: {a} vs {b}");
        }
        assert_eq!(h.output.starts().len(), 1);
    }

    #[test]
    fn test_empty_format_input_rejected() {
        let mut h = Harness::new(MixerConfig::default());
        let observed = SourceProbe::default();
        h.add(1, FakeSource::media(0, 48000).with_probe(&observed));
        assert!(h.core.ignored_inputs.contains_key(&InputId(1)));
        assert_eq!(observed.errors(), vec![MixerError::InternalError]);
        assert!(h.output.starts().is_empty());

        let observed = SourceProbe::default();
        h.add(2, FakeSource::media(2, 0).with_probe(&observed));
        assert!(h.core.ignored_inputs.contains_key(&InputId(2)));
        assert_eq!(observed.errors(), vec![MixerError::InternalError]);
        assert!(h.output.starts().is_empty());

        // A well-formed input still plays
        h.add(3, FakeSource::media(2, 48000));
        assert_eq!(h.output.starts(), vec![(48000, 2)]);
        h.remove(1);
        assert!(!h.core.ignored_inputs.contains_key(&InputId(1)));
    }

    #[test]
    fn test_input_renegotiates_against_rebuilt_pipeline() {
        let config = MixerConfig {
            enable_dynamic_channel_count: true,
            ..MixerConfig::default()
        };
        let mut h = Harness::new(config);
        h.add(1, FakeSource::effects("alarm", 6, 48000));
        assert_eq!(h.core.pipeline.expected_input_channels(), 6);
        assert_eq!(h.output.starts(), vec![(48000, 6)]);

        // No primary left to size it, so the reset falls back to stereo
        h.core.handle_task(MixerTask::ResetPostProcessors(Box::new(|_, _| {})));
        assert_eq!(h.core.pipeline.expected_input_channels(), 2);
        h.remove(1);
        h.loopback_events();

        h.add(2, FakeSource::effects("alarm", 6, 48000));
        assert_eq!(h.interrupts(), vec![LoopbackInterruptReason::ConfigChange]);
        assert_eq!(h.output.starts(), vec![(48000, 6), (48000, 6)]);
        assert_eq!(h.core.pipeline.expected_input_channels(), 6);
        assert!(h.core.inputs.contains_key(&InputId(2)));
    }

    #[test]
    fn test_redirector_receives_matching_inputs() {
        let mut h = Harness::new(MixerConfig::default());
        let (tx, rx) = unbounded();
        h.core.handle_task(MixerTask::AddRedirector(
            RedirectorId(1),
            Box::new(ChannelRedirector::new(&["alarm"], 2, tx)),
        ));
        h.add(1, FakeSource::media(2, 48000));
        h.add(2, FakeSource::effects("alarm", 2, 48000).with_value(0.25));
        h.run(1);

        let buffer = rx.try_recv().unwrap();
        assert_eq!(buffer.frames, FRAMES);
        assert_eq!(buffer.sample_rate, 48000);
        assert!(buffer.samples.iter().all(|s| (s - 0.25).abs() < 1e-6));

        h.core.handle_task(MixerTask::RemoveRedirector(RedirectorId(1)));
        h.run(1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_redirector_added_late_sees_current_inputs() {
        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::effects("tts", 2, 48000));
        let (tx, rx) = unbounded();
        h.core.handle_task(MixerTask::AddRedirector(
            RedirectorId(7),
            Box::new(ChannelRedirector::new(&["tts"], 1, tx)),
        ));
        h.run(1);
        let buffer = rx.try_recv().unwrap();
        assert_eq!(buffer.channels, 1);
        assert_eq!(buffer.sample_rate, 48000);
    }

    #[test]
    fn test_health_check_answered() {
        let mut h = Harness::new(MixerConfig::default());
        let (tx, rx) = unbounded();
        assert!(h.core.handle_task(MixerTask::HealthCheck(tx)));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_shutdown_drops_inputs() {
        let mut h = Harness::new(MixerConfig::default());
        let probe = SourceProbe::default();
        h.add(1, FakeSource::media(2, 48000).with_probe(&probe));
        assert!(!h.core.handle_task(MixerTask::Shutdown));
        assert!(probe.finalized());
        assert_eq!(h.core.state(), MixerState::Stopped);
        assert_eq!(h.interrupts(), vec![LoopbackInterruptReason::OutputStopped]);
    }

    #[test]
    fn test_stale_loop_tasks_dropped() {
        let mut h = Harness::new(MixerConfig::default());
        h.add(1, FakeSource::media(2, 48000));
        h.core.handle_task(MixerTask::SetNumOutputChannels(4));
        let writes = h.output.write_count();
        // The old round and the new one are both queued; only one writes
        while let Ok(task) = h.tasks.try_recv() {
            if matches!(task, MixerTask::PlaybackLoop { .. }) {
                h.core.handle_task(task);
            }
            if h.output.write_count() > writes {
                break;
            }
        }
        assert_eq!(h.output.write_count(), writes + 1);
        assert_eq!(h.output.writes().last().unwrap().len(), FRAMES * 4);
    }
}
