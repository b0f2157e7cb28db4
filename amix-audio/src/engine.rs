//! StreamMixer - the thread-safe handle to the mixer thread
//!
//! Every mutating call becomes one `MixerTask` on an unbounded mailbox, so
//! callers never block and see their calls applied in order.

use crate::config::MixerConfig;
use crate::health::{abort_on_failure, FailureHandler, HealthCheckSettings, HealthChecker};
use crate::loopback::{LoopbackHandler, LoopbackSink};
use crate::output::{MixerOutputStream, NullOutputStream, OutputFactory};
use crate::receiver::StreamCountObserver;
use crate::redirector::{AudioOutputRedirector, RedirectorId};
use crate::source::{AudioContentType, InputId, Source};
use crate::stream_mixer::{MixerCore, MixerParts, MixerTask, PipelineSource};
use crate::volume::VolumeMap;
use amix_dsp::ProcessorRegistry;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Completion callback for `reset_post_processors`: `(success, message)`
pub type ResultCallback = Box<dyn FnOnce(bool, String) + Send>;

const MIXER_THREAD_NAME: &str = "amix-mixer";
const MIXER_THREAD_STACK_SIZE: usize = 512 * 1024;
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("unable to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Configures and starts a `StreamMixer`
pub struct StreamMixerBuilder {
    config: MixerConfig,
    pipeline_json: Option<String>,
    registry: ProcessorRegistry,
    output: Option<Box<dyn MixerOutputStream>>,
    output_factory: Option<OutputFactory>,
    loopback: Option<Box<dyn LoopbackSink>>,
    observer: Option<Box<dyn StreamCountObserver>>,
    health_interval: Duration,
    health_timeout: Duration,
    on_health_failure: Option<FailureHandler>,
}

impl Default for StreamMixerBuilder {
    fn default() -> Self {
        Self {
            config: MixerConfig::default(),
            pipeline_json: None,
            registry: ProcessorRegistry::with_builtins(),
            output: None,
            output_factory: None,
            loopback: None,
            observer: None,
            health_interval: HEALTH_CHECK_INTERVAL,
            health_timeout: HEALTH_CHECK_TIMEOUT,
            on_health_failure: None,
        }
    }
}

impl StreamMixerBuilder {
    pub fn config(mut self, config: MixerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an in-memory pipeline description instead of `config.pipeline_path()`
    pub fn pipeline_json(mut self, json: impl Into<String>) -> Self {
        self.pipeline_json = Some(json.into());
        self
    }

    pub fn registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Output stream used for the first start; later starts reuse it
    pub fn output(mut self, output: impl MixerOutputStream + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    /// Creates the output stream lazily on first start
    pub fn output_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn MixerOutputStream> + Send + 'static,
    {
        self.output_factory = Some(Box::new(factory));
        self
    }

    pub fn loopback(mut self, sink: impl LoopbackSink + 'static) -> Self {
        self.loopback = Some(Box::new(sink));
        self
    }

    pub fn stream_count_observer(mut self, observer: impl StreamCountObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn health_check(mut self, interval: Duration, timeout: Duration) -> Self {
        self.health_interval = interval;
        self.health_timeout = timeout;
        self
    }

    /// Replace the default failure handler, which aborts the process
    pub fn on_health_check_failure<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_health_failure = Some(Arc::new(handler));
        self
    }

    /// Spawn the mixer and health checker threads
    pub fn build(self) -> Result<StreamMixer, BuildError> {
        let pipeline_source = match self.pipeline_json {
            Some(json) => PipelineSource::Json(json),
            None => PipelineSource::File(self.config.pipeline_path()),
        };
        let volume_map = pipeline_source.volume_map();

        let parts = MixerParts {
            config: self.config,
            pipeline_source: pipeline_source.clone(),
            registry: self.registry,
            output: self.output,
            output_factory: self
                .output_factory
                .unwrap_or_else(|| Box::new(|| -> Box<dyn MixerOutputStream> { Box::new(NullOutputStream::new()) })),
            loopback: self.loopback.unwrap_or_else(|| Box::new(LoopbackHandler::default())),
            observer: self.observer,
        };

        let (tx, rx) = unbounded();
        let core_tx = tx.clone();
        let thread = thread::Builder::new()
            .name(MIXER_THREAD_NAME.to_string())
            .stack_size(MIXER_THREAD_STACK_SIZE)
            .spawn(move || {
                let mut core = MixerCore::new(parts, core_tx);
                while let Ok(task) = rx.recv() {
                    if !core.handle_task(task) {
                        break;
                    }
                }
            })
            .map_err(|source| BuildError::Spawn {
                name: MIXER_THREAD_NAME,
                source,
            })?;

        let mut mixer = StreamMixer {
            tasks: tx.clone(),
            next_input_id: AtomicU64::new(1),
            next_redirector_id: AtomicU64::new(1),
            volume_map: Arc::new(RwLock::new(volume_map)),
            pipeline_source,
            health_checker: None,
            thread: Some(thread),
        };

        // The mixer exists from here on, so its Drop joins the thread on error
        let settings = HealthCheckSettings {
            interval: self.health_interval,
            timeout: self.health_timeout,
            on_failure: self.on_health_failure.unwrap_or_else(abort_on_failure),
        };
        let checker = HealthChecker::start(tx, settings).map_err(|source| BuildError::Spawn {
            name: "amix-health",
            source,
        })?;
        mixer.health_checker = Some(checker);
        info!("stream mixer started");
        Ok(mixer)
    }
}

/// Handle to a running mixer. All methods may be called from any thread.
pub struct StreamMixer {
    tasks: Sender<MixerTask>,
    next_input_id: AtomicU64,
    next_redirector_id: AtomicU64,
    volume_map: Arc<RwLock<VolumeMap>>,
    pipeline_source: PipelineSource,
    health_checker: Option<HealthChecker>,
    thread: Option<JoinHandle<()>>,
}

impl StreamMixer {
    pub fn builder() -> StreamMixerBuilder {
        StreamMixerBuilder::default()
    }

    fn send(&self, task: MixerTask) {
        if self.tasks.send(task).is_err() {
            warn!("mixer thread is gone, dropping task");
        }
    }

    /// Hand `source` to the mixer. The id stays valid until `remove_input`.
    pub fn add_input<S: Source + 'static>(&self, source: S) -> InputId {
        let id = InputId(self.next_input_id.fetch_add(1, Ordering::Relaxed));
        self.send(MixerTask::AddInput(id, Box::new(source)));
        id
    }

    /// Remove an input; unknown or already removed ids are ignored
    pub fn remove_input(&self, id: InputId) {
        self.send(MixerTask::RemoveInput(id));
    }

    /// Volume of a content type, 0.0 to 1.0
    pub fn set_volume(&self, content_type: AudioContentType, level: f32) {
        self.send(MixerTask::SetVolume(content_type, level));
    }

    pub fn set_muted(&self, content_type: AudioContentType, muted: bool) {
        self.send(MixerTask::SetMuted(content_type, muted));
    }

    /// Ducking limit for primary inputs focused on `content_type`
    pub fn set_output_limit(&self, content_type: AudioContentType, limit: f32) {
        self.send(MixerTask::SetOutputLimit(content_type, limit));
    }

    pub fn set_volume_multiplier(&self, id: InputId, multiplier: f32) {
        self.send(MixerTask::SetVolumeMultiplier(id, multiplier));
    }

    /// Send a JSON config to every post-processor named `name`
    pub fn set_post_processor_config(&self, name: &str, config: &str) {
        self.send(MixerTask::SetPostProcessorConfig {
            name: name.to_string(),
            config: config.to_string(),
        });
    }

    /// Enables dynamic channel count and restarts the output if needed
    pub fn set_num_output_channels(&self, channels: usize) {
        self.send(MixerTask::SetNumOutputChannels(channels));
    }

    /// Reload the volume map and rebuild the pipeline.
    ///
    /// `callback` runs on the mixer thread once the pipeline is rebuilt.
    pub fn reset_post_processors<F>(&self, callback: F)
    where
        F: FnOnce(bool, String) + Send + 'static,
    {
        *self.volume_map.write() = self.pipeline_source.volume_map();
        self.send(MixerTask::ResetPostProcessors(Box::new(callback)));
    }

    pub fn add_redirector(&self, redirector: impl AudioOutputRedirector + 'static) -> RedirectorId {
        let id = RedirectorId(self.next_redirector_id.fetch_add(1, Ordering::Relaxed));
        self.send(MixerTask::AddRedirector(id, Box::new(redirector)));
        id
    }

    pub fn remove_redirector(&self, id: RedirectorId) {
        self.send(MixerTask::RemoveRedirector(id));
    }

    pub fn volume_to_multiplier(&self, volume: f32) -> f32 {
        self.volume_map.read().volume_to_multiplier(volume)
    }

    pub fn volume_to_db(&self, volume: f32) -> f32 {
        self.volume_map.read().volume_to_db(volume)
    }

    pub fn db_to_volume(&self, db: f32) -> f32 {
        self.volume_map.read().db_to_volume(db)
    }
}

impl Drop for StreamMixer {
    fn drop(&mut self) {
        if let Some(mut checker) = self.health_checker.take() {
            checker.stop();
        }
        let _ = self.tasks.send(MixerTask::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("mixer thread panicked");
            }
        }
    }
}
