//! Filter groups - the nodes of the mixing tree
//!
//! A group sums the audio routed to it, runs it through its post-processor
//! chain and hands the result to its parent (or to the device for the root).

use crate::channel_mixer::InterleavedChannelMixer;
use crate::error::{PipelineError, ProcessorError};
use crate::layout::{guess_channel_layout, PlayoutChannel};
use crate::processors::PostProcessor;
use crate::timing::frames_to_microseconds;

/// Index of a group inside its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub usize);

/// Position of a group in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Leaf group fed by inputs
    Stream,
    /// Sum of all stream groups; its output is the loopback tap
    Mix,
    /// Root; its output goes to the device
    Linearize,
}

pub(crate) struct NamedProcessor {
    pub name: String,
    pub processor: Box<dyn PostProcessor>,
}

impl std::fmt::Debug for NamedProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedProcessor")
            .field("name", &self.name)
            .field("output_channels", &self.processor.output_channels())
            .finish()
    }
}

/// One node of the DSP tree
pub struct FilterGroup {
    id: GroupId,
    kind: GroupKind,
    name: String,
    device_ids: Vec<String>,
    input_channels: usize,
    output_channels: usize,
    processors: Vec<NamedProcessor>,

    sample_rate: u32,
    /// Widest point of the processor chain
    max_channels: usize,
    /// Summed input (`input_channels` interleaved)
    mix_buffer: Vec<f32>,
    /// Processor chain ping-pong buffers; `output` holds the result
    output: Vec<f32>,
    scratch: Vec<f32>,
    frames: usize,

    /// Something was accumulated since the last `clear`
    has_input: bool,
    /// Frames of tail left after the last input
    ringing_remaining: usize,
    ringing_time: usize,
    delay_frames: usize,

    /// Remixer to the parent's input channel count, if it differs
    to_parent: Option<InterleavedChannelMixer>,
}

impl FilterGroup {
    pub(crate) fn new(
        id: GroupId,
        kind: GroupKind,
        name: String,
        device_ids: Vec<String>,
        input_channels: usize,
        processors: Vec<NamedProcessor>,
    ) -> Self {
        let mut channels = input_channels;
        let mut max_channels = input_channels;
        for entry in &processors {
            channels = entry.processor.output_channels();
            max_channels = max_channels.max(channels);
        }

        Self {
            id,
            kind,
            name,
            device_ids,
            input_channels,
            output_channels: channels,
            processors,
            sample_rate: 0,
            max_channels,
            mix_buffer: Vec::new(),
            output: Vec::new(),
            scratch: Vec::new(),
            frames: 0,
            has_input: false,
            ringing_remaining: 0,
            ringing_time: 0,
            delay_frames: 0,
            to_parent: None,
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device ids routed to this group (empty for mix and linearize)
    pub fn device_ids(&self) -> &[String] {
        &self.device_ids
    }

    /// Channel count inputs must be rendered at
    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Rate inputs must be rendered at (0 until initialized)
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Names of the processors in chain order
    pub fn processor_names(&self) -> impl Iterator<Item = &str> {
        self.processors.iter().map(|entry| entry.name.as_str())
    }

    /// Latency of this group's chain
    pub fn delay_frames(&self) -> usize {
        self.delay_frames
    }

    pub fn delay_microseconds(&self) -> i64 {
        frames_to_microseconds(self.delay_frames, self.sample_rate)
    }

    /// Still producing sound: fed this round, or inside the processors' tail
    pub fn is_ringing(&self) -> bool {
        self.has_input || self.ringing_remaining > 0
    }

    pub(crate) fn set_parent_channels(&mut self, parent_channels: usize, max_frames: usize) {
        self.to_parent = (parent_channels != self.output_channels).then(|| {
            InterleavedChannelMixer::new(
                guess_channel_layout(self.output_channels),
                self.output_channels,
                guess_channel_layout(parent_channels),
                parent_channels,
                max_frames,
            )
        });
    }

    /// Allocate buffers and prepare processors for `sample_rate`
    pub(crate) fn initialize(&mut self, sample_rate: u32, max_frames: usize) {
        self.sample_rate = sample_rate;
        self.mix_buffer = vec![0.0; self.input_channels * max_frames];
        self.output = vec![0.0; self.max_channels * max_frames];
        self.scratch = vec![0.0; self.max_channels * max_frames];
        self.frames = 0;
        self.has_input = false;
        self.ringing_remaining = 0;

        for entry in &mut self.processors {
            entry.processor.initialize(sample_rate);
        }
        self.update_timing();
    }

    fn update_timing(&mut self) {
        self.ringing_time = self
            .processors
            .iter()
            .map(|entry| entry.processor.ringing_time_frames())
            .sum();
        self.delay_frames = self
            .processors
            .iter()
            .map(|entry| entry.processor.delay_frames())
            .sum();
    }

    fn ensure_capacity(&mut self, frames: usize) {
        if self.mix_buffer.len() < self.input_channels * frames {
            self.mix_buffer.resize(self.input_channels * frames, 0.0);
        }
        if self.output.len() < self.max_channels * frames {
            self.output.resize(self.max_channels * frames, 0.0);
            self.scratch.resize(self.max_channels * frames, 0.0);
        }
    }

    /// Start a new round of `frames` frames
    pub(crate) fn clear(&mut self, frames: usize) {
        self.ensure_capacity(frames);
        self.frames = frames;
        self.has_input = false;
        self.mix_buffer[..self.input_channels * frames].fill(0.0);
    }

    /// Sum `data` (`input_channels` interleaved) into this round's input
    pub(crate) fn accumulate(&mut self, data: &[f32]) {
        let n = self.input_channels * self.frames;
        for (acc, x) in self.mix_buffer[..n].iter_mut().zip(data) {
            *acc += x;
        }
        self.has_input = true;
    }

    /// Run the processor chain over this round's input.
    ///
    /// Returns `false` when the group was silent and skipped its processors.
    pub(crate) fn process(&mut self) -> bool {
        let frames = self.frames;
        if self.has_input {
            self.ringing_remaining = self.ringing_time;
        } else if self.ringing_remaining == 0 {
            // Nothing in, tail already gone
            self.output[..self.output_channels * frames].fill(0.0);
            return false;
        } else {
            self.ringing_remaining = self.ringing_remaining.saturating_sub(frames);
        }

        let mut channels = self.input_channels;
        self.output[..channels * frames].copy_from_slice(&self.mix_buffer[..channels * frames]);
        for entry in &mut self.processors {
            let out_channels = entry.processor.output_channels();
            entry.processor.process(
                &self.output[..channels * frames],
                &mut self.scratch[..out_channels * frames],
                frames,
            );
            std::mem::swap(&mut self.output, &mut self.scratch);
            channels = out_channels;
        }
        true
    }

    /// This round's output (`output_channels` interleaved)
    pub fn output(&self) -> &[f32] {
        &self.output[..self.output_channels * self.frames]
    }

    /// This round's output remixed for the parent group
    pub(crate) fn output_for_parent(&mut self) -> &[f32] {
        let frames = self.frames;
        let n = self.output_channels * frames;
        match self.to_parent.as_mut() {
            Some(mixer) => &*mixer.transform(&self.output[..n], frames),
            None => &self.output[..n],
        }
    }

    /// Apply `config` to every processor called `name`.
    ///
    /// Returns `None` when this group has no such processor, otherwise the
    /// first error any of them reported.
    pub(crate) fn set_post_processor_config(
        &mut self,
        name: &str,
        config: &str,
    ) -> Option<Result<(), ProcessorError>> {
        let mut outcome = None;
        for entry in self.processors.iter_mut().filter(|entry| entry.name == name) {
            let result = entry.processor.set_config(config);
            outcome = match outcome {
                None | Some(Ok(())) => Some(result),
                failed => failed,
            };
        }
        if outcome.is_some() {
            self.update_timing();
        }
        outcome
    }

    pub(crate) fn set_playout_channel(&mut self, channel: PlayoutChannel) {
        for entry in &mut self.processors {
            entry.processor.set_playout_channel(channel);
        }
    }
}

impl std::fmt::Debug for FilterGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterGroup")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("device_ids", &self.device_ids)
            .field("input_channels", &self.input_channels)
            .field("output_channels", &self.output_channels)
            .field("processors", &self.processor_names().collect::<Vec<_>>())
            .finish()
    }
}

/// Build a processor chain starting at `input_channels`
pub(crate) fn build_chain(
    descriptions: &[crate::description::ProcessorDescription],
    registry: &crate::processors::ProcessorRegistry,
    input_channels: usize,
) -> Result<Vec<NamedProcessor>, PipelineError> {
    let mut channels = input_channels;
    let mut chain = Vec::with_capacity(descriptions.len());
    for description in descriptions {
        let name = description.instance_name().to_string();
        let processor = registry
            .create(&description.kind, &description.config, channels)
            .map_err(|source| PipelineError::Processor {
                name: name.clone(),
                source,
            })?;
        channels = processor.output_channels();
        chain.push(NamedProcessor { name, processor });
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::ProcessorDescription;
    use crate::processors::ProcessorRegistry;
    use serde_json::json;

    fn processor(name: &str, kind: &str, config: serde_json::Value) -> ProcessorDescription {
        ProcessorDescription {
            name: Some(name.to_string()),
            kind: kind.to_string(),
            config,
        }
    }

    fn group(descriptions: &[ProcessorDescription], input_channels: usize) -> FilterGroup {
        let chain = build_chain(descriptions, &ProcessorRegistry::with_builtins(), input_channels).unwrap();
        let mut group = FilterGroup::new(
            GroupId(0),
            GroupKind::Stream,
            "test".to_string(),
            vec!["default".to_string()],
            input_channels,
            chain,
        );
        group.initialize(48000, 4);
        group
    }

    #[test]
    fn test_empty_chain_passes_sum() {
        let mut g = group(&[], 2);
        g.clear(2);
        g.accumulate(&[0.1, 0.2, 0.3, 0.4]);
        g.accumulate(&[0.1, 0.2, 0.3, 0.4]);
        g.process();
        let out = g.output();
        assert_eq!(out.len(), 4);
        assert!((out[3] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_chain_changes_channels() {
        let mut g = group(
            &[
                processor("gain", "gain", json!({ "gain_db": 0.0 })),
                processor("down", "mixdown", json!({ "output_channels": 1 })),
            ],
            2,
        );
        assert_eq!(g.output_channels(), 1);
        g.clear(2);
        g.accumulate(&[1.0, 1.0, 0.5, 0.5]);
        g.process();
        assert_eq!(g.output(), &[1.0, 0.5][..]);
    }

    #[test]
    fn test_output_for_parent_remixes() {
        let mut g = group(&[], 1);
        g.set_parent_channels(2, 4);
        g.clear(1);
        g.accumulate(&[0.5]);
        g.process();
        assert_eq!(g.output_for_parent(), &[0.5, 0.5][..]);
    }

    #[test]
    fn test_ringing_follows_tail() {
        // 1 ms echo at 48 kHz, no feedback: tail is 48 frames
        let mut g = group(&[processor("echo", "delay", json!({ "delay_ms": 1.0, "feedback": 0.0 }))], 1);
        assert!(!g.is_ringing());

        g.clear(4);
        g.accumulate(&[1.0; 4]);
        g.process();
        assert!(g.is_ringing());

        let mut rounds = 0;
        loop {
            g.clear(4);
            g.process();
            rounds += 1;
            if !g.is_ringing() {
                break;
            }
            assert!(rounds < 100, "tail never ended");
        }
        assert_eq!(rounds, 12);
    }

    #[test]
    fn test_silent_without_input() {
        let mut g = group(&[processor("gain", "gain", json!({ "gain_db": 6.0 }))], 2);
        g.clear(4);
        g.process();
        assert!(g.output().iter().all(|s| *s == 0.0));
        assert!(!g.is_ringing());
    }

    #[test]
    fn test_set_post_processor_config() {
        let mut g = group(&[processor("trim", "gain", json!({}))], 1);
        assert!(g.set_post_processor_config("missing", "{}").is_none());
        assert!(matches!(g.set_post_processor_config("trim", r#"{ "gain_db": -20.0 }"#), Some(Ok(()))));
        assert!(matches!(g.set_post_processor_config("trim", "nope"), Some(Err(_))));

        g.clear(1);
        g.accumulate(&[1.0]);
        g.process();
        assert!((g.output()[0] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_config_reaches_every_processor_with_the_name() {
        let mut g = group(
            &[
                processor("trim", "gain", json!({})),
                processor("other", "gain", json!({})),
                processor("trim", "gain", json!({})),
            ],
            1,
        );
        assert!(matches!(g.set_post_processor_config("trim", r#"{ "gain_db": -20.0 }"#), Some(Ok(()))));

        // Both -20 dB stages apply
        g.clear(1);
        g.accumulate(&[1.0]);
        g.process();
        assert!((g.output()[0] - 0.01).abs() < 1e-6);

        assert!(matches!(g.set_post_processor_config("trim", "nope"), Some(Err(_))));
    }

    #[test]
    fn test_build_chain_reports_processor_name() {
        let err = build_chain(
            &[processor("broken", "nonexistent", json!({}))],
            &ProcessorRegistry::with_builtins(),
            2,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Processor { name, .. } if name == "broken"));
    }

    #[test]
    fn test_clear_grows_buffers() {
        let mut g = group(&[], 2);
        g.clear(16);
        g.accumulate(&[0.25; 32]);
        g.process();
        assert_eq!(g.output().len(), 32);
    }
}
