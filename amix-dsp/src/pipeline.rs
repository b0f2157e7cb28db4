//! Mixer pipeline - the full tree of filter groups
//!
//! ```text
//! inputs -> stream groups -> mix (loopback tap) -> linearize -> device
//! ```
//!
//! Every group runs at the output sample rate. Inputs render at their
//! group's input channel count; stream group outputs are remixed to the mix
//! group's input channel count.

use crate::description::PipelineDescription;
use crate::error::PipelineError;
use crate::filter_group::{build_chain, FilterGroup, GroupId, GroupKind};
use crate::layout::PlayoutChannel;
use crate::processors::ProcessorRegistry;
use crate::timing::{frames_to_microseconds, RenderingDelay};
use crate::DEFAULT_DEVICE_ID;
use std::collections::HashMap;
use tracing::debug;

/// Frames buffers are sized for until `initialize` says otherwise
const INITIAL_FRAMES: usize = 256;

/// Something that renders audio into a filter group
pub trait GroupInput {
    /// Group this input is attached to; `None` while detached
    fn filter_group(&self) -> Option<GroupId>;

    /// Render `frames` frames into `dest` at the group's input channel count.
    ///
    /// `delay` is how far in the future the rendered audio will be heard.
    /// Returns `false` when the input contributed nothing this round.
    fn render(&mut self, frames: usize, delay: RenderingDelay, dest: &mut [f32]) -> bool;
}

/// The DSP tree built from a pipeline description
pub struct MixerPipeline {
    /// Stream groups first, then mix, then linearize
    groups: Vec<FilterGroup>,
    mix: GroupId,
    linearize: GroupId,
    routes: HashMap<String, GroupId>,
    default_group: GroupId,
    expected_input_channels: usize,
    sample_rate: u32,
    frames_per_write: usize,
    render_buffer: Vec<f32>,
}

impl MixerPipeline {
    /// Build the tree for inputs of `expected_input_channels` channels
    pub fn new(
        description: &PipelineDescription,
        registry: &ProcessorRegistry,
        expected_input_channels: usize,
    ) -> Result<Self, PipelineError> {
        if expected_input_channels == 0 {
            return Err(PipelineError::NoInputChannels);
        }
        description.validate()?;

        let mut groups = Vec::new();
        let mut routes = HashMap::new();
        for (index, stream) in description.postprocessors.output_streams.iter().enumerate() {
            let id = GroupId(groups.len());
            let name = stream.name.clone().unwrap_or_else(|| format!("stream_{index}"));
            let chain = build_chain(&stream.processors, registry, expected_input_channels)?;
            for device in &stream.streams {
                routes.insert(device.clone(), id);
            }
            groups.push(FilterGroup::new(
                id,
                GroupKind::Stream,
                name,
                stream.streams.clone(),
                expected_input_channels,
                chain,
            ));
        }

        let default_group = match routes.get(DEFAULT_DEVICE_ID) {
            Some(id) => *id,
            None => {
                let id = GroupId(groups.len());
                routes.insert(DEFAULT_DEVICE_ID.to_string(), id);
                groups.push(FilterGroup::new(
                    id,
                    GroupKind::Stream,
                    DEFAULT_DEVICE_ID.to_string(),
                    vec![DEFAULT_DEVICE_ID.to_string()],
                    expected_input_channels,
                    Vec::new(),
                ));
                id
            }
        };

        let mix_input_channels = groups
            .iter()
            .map(FilterGroup::output_channels)
            .max()
            .unwrap_or(expected_input_channels);
        for group in &mut groups {
            group.set_parent_channels(mix_input_channels, INITIAL_FRAMES);
        }

        let mix = GroupId(groups.len());
        let mix_chain = build_chain(&description.postprocessors.mix.processors, registry, mix_input_channels)?;
        let mix_group = FilterGroup::new(mix, GroupKind::Mix, "mix".to_string(), Vec::new(), mix_input_channels, mix_chain);
        let loopback_channels = mix_group.output_channels();
        groups.push(mix_group);

        let linearize = GroupId(groups.len());
        let linearize_chain =
            build_chain(&description.postprocessors.linearize.processors, registry, loopback_channels)?;
        groups.push(FilterGroup::new(
            linearize,
            GroupKind::Linearize,
            "linearize".to_string(),
            Vec::new(),
            loopback_channels,
            linearize_chain,
        ));

        debug!(
            stream_groups = mix.0,
            input_channels = expected_input_channels,
            loopback_channels,
            output_channels = groups[linearize.0].output_channels(),
            "built mixer pipeline"
        );
        Ok(Self {
            groups,
            mix,
            linearize,
            routes,
            default_group,
            expected_input_channels,
            sample_rate: 0,
            frames_per_write: 0,
            render_buffer: Vec::new(),
        })
    }

    /// Channel count the stream groups were built for
    pub fn expected_input_channels(&self) -> usize {
        self.expected_input_channels
    }

    /// Group a stream with `device_id` feeds; unknown ids go to `default`
    pub fn input_group(&self, device_id: &str) -> GroupId {
        self.routes.get(device_id).copied().unwrap_or(self.default_group)
    }

    pub fn group(&self, id: GroupId) -> Option<&FilterGroup> {
        self.groups.get(id.0)
    }

    pub fn groups(&self) -> &[FilterGroup] {
        &self.groups
    }

    /// Sample rate inputs of `device_id` must render at (0 until initialized)
    pub fn input_sample_rate(&self, device_id: &str) -> u32 {
        self.groups[self.input_group(device_id).0].sample_rate()
    }

    /// Channels of the device-bound output
    pub fn output_channel_count(&self) -> usize {
        self.groups[self.linearize.0].output_channels()
    }

    /// Channels of the loopback tap
    pub fn loopback_channel_count(&self) -> usize {
        self.groups[self.mix.0].output_channels()
    }

    /// Prepare every group for `sample_rate` and writes of `frames_per_write`
    pub fn initialize(&mut self, sample_rate: u32, frames_per_write: usize) {
        debug!(sample_rate, frames_per_write, "initializing pipeline");
        self.sample_rate = sample_rate;
        self.frames_per_write = frames_per_write;
        let widest = self.groups.iter().map(FilterGroup::input_channels).max().unwrap_or(0);
        self.render_buffer = vec![0.0; widest * frames_per_write];
        for group in &mut self.groups {
            group.initialize(sample_rate, frames_per_write);
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames_per_write(&self) -> usize {
        self.frames_per_write
    }

    /// Restrict playout to one channel (or all) in every group
    pub fn set_playout_channel(&mut self, channel: PlayoutChannel) {
        debug!(?channel, "setting playout channel");
        for group in &mut self.groups {
            group.set_playout_channel(channel);
        }
    }

    /// Latency from the input of `id` to the device
    pub fn rendering_delay_to_output(&self, id: GroupId) -> i64 {
        let mut frames = self.groups[self.linearize.0].delay_frames();
        if id != self.linearize {
            frames += self.groups[self.mix.0].delay_frames();
        }
        if id < self.mix {
            frames += self.groups[id.0].delay_frames();
        }
        frames_to_microseconds(frames, self.sample_rate)
    }

    /// Delay added after the loopback tap
    pub fn post_loopback_rendering_delay_us(&self) -> i64 {
        self.groups[self.linearize.0].delay_microseconds()
    }

    /// Pull `frames` frames from every attached input and run the tree.
    ///
    /// `delay` is the device's rendering delay; each input is told its own
    /// delay including the groups between it and the device. `on_rendered`
    /// sees every contributing input's audio at its group channel count.
    pub fn mix_and_filter<'a, I, F>(
        &mut self,
        inputs: impl IntoIterator<Item = &'a mut I>,
        frames: usize,
        delay: RenderingDelay,
        mut on_rendered: F,
    ) where
        I: GroupInput + 'a,
        F: FnMut(&I, &[f32], usize),
    {
        for group in &mut self.groups {
            group.clear(frames);
        }

        for input in inputs {
            let Some(id) = input.filter_group() else {
                continue;
            };
            let Some(channels) = self.groups.get(id.0).map(FilterGroup::input_channels) else {
                continue;
            };
            let input_delay = delay.plus(self.rendering_delay_to_output(id));
            let n = channels * frames;
            if self.render_buffer.len() < n {
                self.render_buffer.resize(n, 0.0);
            }
            let dest = &mut self.render_buffer[..n];
            dest.fill(0.0);

            if input.render(frames, input_delay, dest) {
                self.groups[id.0].accumulate(dest);
                on_rendered(&*input, &*dest, channels);
            }
        }

        let (streams, rest) = self.groups.split_at_mut(self.mix.0);
        let (mix, linearize) = rest.split_at_mut(1);
        let (mix, linearize) = (&mut mix[0], &mut linearize[0]);

        for stream in streams.iter_mut() {
            if stream.process() {
                mix.accumulate(stream.output_for_parent());
            }
        }
        if mix.process() {
            linearize.accumulate(mix.output());
        }
        linearize.process();
    }

    /// Device-bound output of the last `mix_and_filter`
    pub fn output(&self) -> &[f32] {
        self.groups[self.linearize.0].output()
    }

    /// Loopback output of the last `mix_and_filter`
    pub fn loopback_output(&self) -> &[f32] {
        self.groups[self.mix.0].output()
    }

    /// Any group still has sound to play out
    pub fn is_ringing(&self) -> bool {
        self.groups.iter().any(FilterGroup::is_ringing)
    }

    /// Apply `config` to every processor instance called `name`
    pub fn set_post_processor_config(&mut self, name: &str, config: &str) -> Result<(), PipelineError> {
        let mut found = false;
        for group in &mut self.groups {
            match group.set_post_processor_config(name, config) {
                Some(Ok(())) => found = true,
                Some(Err(source)) => {
                    debug!(processor = name, error = %source, "post-processor rejected config");
                    return Err(PipelineError::Processor {
                        name: name.to_string(),
                        source,
                    })
                }
                None => {}
            }
        }
        if found {
            debug!(processor = name, "applied post-processor config");
            Ok(())
        } else {
            debug!(processor = name, "no post-processor with this name");
            Err(PipelineError::UnknownProcessor(name.to_string()))
        }
    }
}

impl std::fmt::Debug for MixerPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixerPipeline")
            .field("groups", &self.groups)
            .field("expected_input_channels", &self.expected_input_channels)
            .field("sample_rate", &self.sample_rate)
            .field("frames_per_write", &self.frames_per_write)
            .finish()
    }
}
