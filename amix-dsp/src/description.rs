//! Pipeline description - the JSON topology a `MixerPipeline` is built from
//!
//! ```json
//! {
//!   "postprocessors": {
//!     "output_streams": [ { "streams": ["default"], "processors": [] } ],
//!     "mix": { "processors": [] },
//!     "linearize": { "processors": [] }
//!   },
//!   "volume_map": [ { "level": 1.0, "db": 0.0 } ]
//! }
//! ```

use crate::error::PipelineError;
use crate::{
    ALARM_DEVICE_ID, COMMUNICATIONS_DEVICE_ID, DEFAULT_DEVICE_ID, PLATFORM_DEVICE_ID, TTS_DEVICE_ID,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Built-in description used when the configured one cannot be built.
///
/// Routes every canonical device to a single processor-less group.
pub const READ_ONLY_PIPELINE_JSON: &str = r#"{
  "postprocessors": {
    "output_streams": [
      {
        "name": "default",
        "streams": ["default", "communications", "platform", "alarm", "tts"],
        "processors": []
      }
    ],
    "mix": { "processors": [] },
    "linearize": { "processors": [] }
  }
}"#;

/// Root of a pipeline description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescription {
    #[serde(default)]
    pub postprocessors: PostProcessorsSection,
    /// Volume curve points; empty means the built-in curve
    #[serde(default)]
    pub volume_map: Vec<VolumePoint>,
}

/// The three stages of the tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostProcessorsSection {
    #[serde(default)]
    pub output_streams: Vec<StreamGroupDescription>,
    #[serde(default)]
    pub mix: StageDescription,
    #[serde(default)]
    pub linearize: StageDescription,
}

/// A stream group: the devices routed to it and its processors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamGroupDescription {
    #[serde(default)]
    pub name: Option<String>,
    pub streams: Vec<String>,
    #[serde(default)]
    pub processors: Vec<ProcessorDescription>,
}

/// Processors of the `mix` or `linearize` stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageDescription {
    #[serde(default)]
    pub processors: Vec<ProcessorDescription>,
}

/// One post-processor instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorDescription {
    /// Instance name used by runtime config updates; defaults to the type
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ProcessorDescription {
    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }
}

/// One point of the volume curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumePoint {
    pub level: f32,
    pub db: f32,
}

impl PipelineDescription {
    /// Parse and validate a description
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let description: Self = serde_json::from_str(json)?;
        description.validate()?;
        Ok(description)
    }

    /// Read, parse and validate a description file
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// The built-in read-only description
    pub fn read_only() -> Result<Self, PipelineError> {
        Self::from_json(READ_ONLY_PIPELINE_JSON)
    }

    /// Check device routing is unambiguous
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut seen = HashSet::new();
        for (index, group) in self.postprocessors.output_streams.iter().enumerate() {
            if group.streams.is_empty() {
                return Err(PipelineError::EmptyStreamGroup(index));
            }
            for device in &group.streams {
                if !seen.insert(device.as_str()) {
                    return Err(PipelineError::DuplicateDevice(device.clone()));
                }
            }
        }
        Ok(())
    }

    /// Whether some stream group lists `device_id`
    pub fn routes(&self, device_id: &str) -> bool {
        self.postprocessors
            .output_streams
            .iter()
            .any(|group| group.streams.iter().any(|d| d == device_id))
    }
}

/// Device ids whose groups must share one sample rate for redirection
pub const REDIRECTABLE_DEVICE_IDS: [&str; 5] = [
    PLATFORM_DEVICE_ID,
    ALARM_DEVICE_ID,
    TTS_DEVICE_ID,
    DEFAULT_DEVICE_ID,
    COMMUNICATIONS_DEVICE_ID,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_parses() {
        let description = PipelineDescription::read_only().unwrap();
        assert_eq!(description.postprocessors.output_streams.len(), 1);
        for device in REDIRECTABLE_DEVICE_IDS {
            assert!(description.routes(device));
        }
    }

    #[test]
    fn test_parse_full_description() {
        let json = r#"{
            "postprocessors": {
                "output_streams": [
                    { "name": "media", "streams": ["default"],
                      "processors": [ { "name": "eq", "type": "biquad", "config": { "frequency": 80.0 } } ] },
                    { "streams": ["alarm"] }
                ],
                "linearize": { "processors": [ { "type": "gain", "config": { "gain_db": -3.0 } } ] }
            },
            "volume_map": [ { "level": 1.0, "db": 0.0 } ]
        }"#;
        let description = PipelineDescription::from_json(json).unwrap();
        let streams = &description.postprocessors.output_streams;
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].processors[0].instance_name(), "eq");
        assert!(streams[1].processors.is_empty());
        assert!(description.postprocessors.mix.processors.is_empty());
        assert_eq!(description.postprocessors.linearize.processors[0].instance_name(), "gain");
        assert_eq!(description.volume_map.len(), 1);
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let json = r#"{ "postprocessors": { "output_streams": [
            { "streams": ["default", "alarm"] }, { "streams": ["alarm"] } ] } }"#;
        assert!(matches!(
            PipelineDescription::from_json(json),
            Err(PipelineError::DuplicateDevice(device)) if device == "alarm"
        ));
    }

    #[test]
    fn test_empty_stream_group_rejected() {
        let json = r#"{ "postprocessors": { "output_streams": [ { "streams": [] } ] } }"#;
        assert!(matches!(
            PipelineDescription::from_json(json),
            Err(PipelineError::EmptyStreamGroup(0))
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            PipelineDescription::from_json("{ not json"),
            Err(PipelineError::Json(_))
        ));
    }

    #[test]
    fn test_empty_object_is_valid() {
        let description = PipelineDescription::from_json("{}").unwrap();
        assert!(description.postprocessors.output_streams.is_empty());
    }
}
