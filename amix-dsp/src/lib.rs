//! DSP building blocks for amix
//!
//! This crate provides everything the stream mixer runs below its inputs:
//! - Channel layouts and the interleaved channel mixer
//! - Post-processors (gain, biquad, delay, mixdown) and their registry
//! - Filter groups and the mixer pipeline tree built from a JSON description

mod channel_mixer;
mod description;
mod error;
mod filter_group;
mod layout;
mod pipeline;
pub mod processors;
mod timing;

pub use channel_mixer::InterleavedChannelMixer;
pub use description::{
    PipelineDescription, PostProcessorsSection, ProcessorDescription, StageDescription,
    StreamGroupDescription, VolumePoint, READ_ONLY_PIPELINE_JSON, REDIRECTABLE_DEVICE_IDS,
};
pub use error::{PipelineError, ProcessorError};
pub use filter_group::{FilterGroup, GroupId, GroupKind};
pub use layout::{guess_channel_layout, ChannelLayout, ChannelPosition, PlayoutChannel};
pub use pipeline::{GroupInput, MixerPipeline};
pub use processors::{PostProcessor, ProcessorRegistry};
pub use timing::{frames_to_microseconds, RenderingDelay};

/// Device id every pipeline routes unknown streams to
pub const DEFAULT_DEVICE_ID: &str = "default";
/// Communications (voice call) streams
pub const COMMUNICATIONS_DEVICE_ID: &str = "communications";
/// Platform sounds
pub const PLATFORM_DEVICE_ID: &str = "platform";
/// Alarms and timers
pub const ALARM_DEVICE_ID: &str = "alarm";
/// Text-to-speech
pub const TTS_DEVICE_ID: &str = "tts";
