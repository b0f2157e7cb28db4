//! Post-processors run by filter groups
//!
//! Every processor is created for a fixed input channel count and reports the
//! channel count it produces. Configs are JSON objects; missing fields take
//! their defaults.

mod biquad;
mod delay;
mod gain;
mod mixdown;

pub use biquad::{Biquad, BiquadConfig, FilterType};
pub use delay::{Delay, DelayConfig};
pub use gain::{Gain, GainConfig};
pub use mixdown::{Mixdown, MixdownConfig};

use crate::error::ProcessorError;
use crate::layout::PlayoutChannel;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// Trait for post-processors
pub trait PostProcessor: Send {
    /// Type name as used in pipeline descriptions
    fn kind(&self) -> &'static str;

    /// Channels produced for each frame
    fn output_channels(&self) -> usize;

    /// Prepare for `sample_rate`; clears any state
    fn initialize(&mut self, sample_rate: u32);

    /// Process `frames` frames of interleaved `input` into `output`.
    ///
    /// `input` holds `frames * input channels` samples, `output` holds
    /// `frames * output_channels()` samples.
    fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize);

    /// Apply a JSON config at runtime
    fn set_config(&mut self, config: &str) -> Result<(), ProcessorError>;

    /// Latency added by this processor
    fn delay_frames(&self) -> usize {
        0
    }

    /// How long output keeps sounding after the input goes silent
    fn ringing_time_frames(&self) -> usize {
        0
    }

    fn set_playout_channel(&mut self, _channel: PlayoutChannel) {}

    /// Clear processing state
    fn reset(&mut self);
}

/// Builds a processor from its JSON config and input channel count
pub type ProcessorConstructor =
    fn(&serde_json::Value, usize) -> Result<Box<dyn PostProcessor>, ProcessorError>;

/// Maps processor type names to constructors
#[derive(Clone)]
pub struct ProcessorRegistry {
    constructors: HashMap<String, ProcessorConstructor>,
}

impl ProcessorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with `gain`, `biquad`, `delay` and `mixdown`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(gain::KIND, gain::create);
        registry.register(biquad::KIND, biquad::create);
        registry.register(delay::KIND, delay::create);
        registry.register(mixdown::KIND, mixdown::create);
        registry
    }

    /// Register (or replace) a processor type
    pub fn register(&mut self, kind: &str, constructor: ProcessorConstructor) {
        self.constructors.insert(kind.to_string(), constructor);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Create a processor of type `kind`
    pub fn create(
        &self,
        kind: &str,
        config: &serde_json::Value,
        input_channels: usize,
    ) -> Result<Box<dyn PostProcessor>, ProcessorError> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| ProcessorError::UnknownType(kind.to_string()))?;
        constructor(config, input_channels)
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.constructors.keys().collect();
        kinds.sort();
        f.debug_struct("ProcessorRegistry").field("kinds", &kinds).finish()
    }
}

/// Parse a config value; `null` means all defaults
pub(crate) fn parse_config_value<T: DeserializeOwned + Default>(
    kind: &'static str,
    config: &serde_json::Value,
) -> Result<T, ProcessorError> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|source| ProcessorError::InvalidConfig { kind, source })
}

/// Parse a runtime config string
pub(crate) fn parse_config_str<T: DeserializeOwned>(
    kind: &'static str,
    config: &str,
) -> Result<T, ProcessorError> {
    serde_json::from_str(config).map_err(|source| ProcessorError::InvalidConfig { kind, source })
}

#[inline]
pub(crate) fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let registry = ProcessorRegistry::with_builtins();
        for kind in ["gain", "biquad", "delay", "mixdown"] {
            assert!(registry.contains(kind), "missing {kind}");
        }
    }

    #[test]
    fn test_unknown_type() {
        let registry = ProcessorRegistry::with_builtins();
        assert!(matches!(
            registry.create("reverb", &json!({}), 2),
            Err(ProcessorError::UnknownType(kind)) if kind == "reverb"
        ));
    }

    #[test]
    fn test_create_with_null_config() {
        let registry = ProcessorRegistry::with_builtins();
        let processor = registry.create("gain", &serde_json::Value::Null, 2).unwrap();
        assert_eq!(processor.kind(), "gain");
        assert_eq!(processor.output_channels(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let registry = ProcessorRegistry::with_builtins();
        assert!(matches!(
            registry.create("gain", &json!({ "gain_db": "loud" }), 2),
            Err(ProcessorError::InvalidConfig { kind: "gain", .. })
        ));
    }

    #[test]
    fn test_register_custom() {
        let mut registry = ProcessorRegistry::new();
        assert!(!registry.contains("gain"));
        registry.register("louder", gain::create);
        assert!(registry.create("louder", &json!({ "gain_db": 6.0 }), 1).is_ok());
    }

    #[test]
    fn test_db_to_linear() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(-20.0) - 0.1).abs() < 1e-6);
    }
}
