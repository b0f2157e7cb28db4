//! Stream mixer engine for amix
//!
//! This crate provides the mixer that sits between audio producers and one
//! output device:
//! - StreamMixer: thread-safe handle; all work happens on one mixer thread
//! - MixerInput: per-source volume, ducking, resampling and channel mapping
//! - Output stream, loopback and redirector contracts plus default implementations
//! - Volume map, configuration and the mixer thread health checker

mod config;
mod engine;
mod health;
mod input;
mod loopback;
mod output;
mod receiver;
mod redirector;
mod source;
mod stream_mixer;
mod volume;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, MixerConfig};
pub use engine::{BuildError, ResultCallback, StreamMixer, StreamMixerBuilder};
pub use health::FailureHandler;
pub use input::MixerInput;
pub use loopback::{LoopbackData, LoopbackEvent, LoopbackHandler, LoopbackInterruptReason, LoopbackSink};
pub use output::{
    monotonic_now_us, MixerOutputStream, NullOutputStream, OutputError, OutputFactory, WriteOutcome,
};
pub use receiver::{StreamCountObserver, StreamCounts};
pub use redirector::{AudioOutputRedirector, ChannelRedirector, RedirectedBuffer, RedirectorId};
pub use source::{AudioContentType, InputId, MixerError, Source};
pub use volume::{VolumeInfo, VolumeMap};

pub use amix_dsp::{PipelineDescription, PlayoutChannel, ProcessorRegistry, RenderingDelay};
