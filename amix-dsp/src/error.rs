//! Errors raised while building or reconfiguring a pipeline

use thiserror::Error;

/// Errors from building a post-processor or applying its config
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("unknown post-processor type '{0}'")]
    UnknownType(String),
    #[error("invalid config for '{kind}': {source}")]
    InvalidConfig {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported channel count {channels} for '{kind}'")]
    UnsupportedChannels { kind: &'static str, channels: usize },
}

/// Errors from loading a pipeline description or building the tree
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("device '{0}' is routed to more than one stream group")]
    DuplicateDevice(String),
    #[error("stream group {0} lists no streams")]
    EmptyStreamGroup(usize),
    #[error("post-processor '{name}': {source}")]
    Processor {
        name: String,
        #[source]
        source: ProcessorError,
    },
    #[error("no post-processor named '{0}'")]
    UnknownProcessor(String),
    #[error("expected input channel count must be non-zero")]
    NoInputChannels,
}
