//! Mixer output on the default cpal device
//!
//! `cpal::Stream` is not `Send`, so the stream lives on its own thread and
//! is fed through a `ringbuf` ring. `write` blocks while the ring is full,
//! which paces the mixer thread to the device clock.

use amix_audio::{monotonic_now_us, MixerOutputStream, OutputError, RenderingDelay, WriteOutcome};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const THREAD_NAME: &str = "amix-cpal";
/// Write length; the ring holds `RING_WRITES` of them
const WRITE_MS: u32 = 10;
const RING_WRITES: usize = 4;
const WRITE_POLL: Duration = Duration::from_millis(1);

/// Stream parameters the device actually opened with
struct Opened {
    sample_rate: u32,
    channels: usize,
    producer: HeapProd<f32>,
}

struct Running {
    producer: HeapProd<f32>,
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// cpal-backed `MixerOutputStream`
pub struct CpalOutputStream {
    running: Option<Running>,
    underrun: Arc<AtomicBool>,
    sample_rate: u32,
    channels: usize,
}

impl CpalOutputStream {
    pub fn new() -> Self {
        Self {
            running: None,
            underrun: Arc::new(AtomicBool::new(false)),
            sample_rate: 0,
            channels: 0,
        }
    }

    fn write_frames(sample_rate: u32) -> usize {
        (sample_rate * WRITE_MS / 1000) as usize
    }
}

impl Default for CpalOutputStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick a stream config: the requested one if the device supports it,
/// otherwise the device default.
fn choose_config(device: &cpal::Device, sample_rate: u32, channels: usize) -> Result<cpal::StreamConfig, OutputError> {
    let wanted = cpal::SampleRate(sample_rate);
    let supported = device
        .supported_output_configs()
        .map_err(|err| OutputError::Unavailable(err.to_string()))?
        .filter(|range| range.sample_format() == cpal::SampleFormat::F32)
        .find(|range| {
            range.channels() as usize == channels
                && range.min_sample_rate() <= wanted
                && wanted <= range.max_sample_rate()
        });
    if let Some(range) = supported {
        return Ok(range.with_sample_rate(wanted).config());
    }

    let default = device
        .default_output_config()
        .map_err(|err| OutputError::Unavailable(err.to_string()))?;
    if default.sample_format() != cpal::SampleFormat::F32 {
        return Err(OutputError::UnsupportedFormat { sample_rate, channels });
    }
    debug!(
        requested_rate = sample_rate,
        requested_channels = channels,
        rate = default.sample_rate().0,
        channels = default.channels(),
        "device does not support requested format, using its default"
    );
    Ok(default.config())
}

/// Runs on the stream thread: open the device, hand the ring's producer
/// back, park until stopped
fn run_stream(
    sample_rate: u32,
    channels: usize,
    underrun: Arc<AtomicBool>,
    opened: Sender<Result<Opened, OutputError>>,
    stop: Receiver<()>,
) {
    let setup = (|| -> Result<(cpal::Stream, Opened), OutputError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| OutputError::Unavailable("no output device".to_string()))?;
        let config = choose_config(&device, sample_rate, channels)?;
        let sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;
        let capacity = CpalOutputStream::write_frames(sample_rate) * RING_WRITES * channels;
        let (producer, mut consumer) = HeapRb::<f32>::new(capacity).split();

        // Underruns only count once audio has started flowing
        let mut flowing = false;
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let read = consumer.pop_slice(data);
                    if read < data.len() {
                        data[read..].fill(0.0);
                        if flowing {
                            underrun.store(true, Ordering::Relaxed);
                        }
                    }
                    flowing |= read > 0;
                },
                |err| warn!(error = %err, "cpal output stream error"),
                None,
            )
            .map_err(|err| OutputError::Failed(err.to_string()))?;
        stream.play().map_err(|err| OutputError::Failed(err.to_string()))?;
        Ok((
            stream,
            Opened {
                sample_rate,
                channels,
                producer,
            },
        ))
    })();

    match setup {
        Ok((stream, info)) => {
            let _ = opened.send(Ok(info));
            // Blocks until the sender is dropped
            let _ = stop.recv();
            drop(stream);
        }
        Err(err) => {
            let _ = opened.send(Err(err));
        }
    }
}

impl MixerOutputStream for CpalOutputStream {
    fn start(&mut self, sample_rate: u32, channels: usize) -> Result<(), OutputError> {
        self.stop();

        let (opened_tx, opened_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let underrun = self.underrun.clone();
        underrun.store(false, Ordering::Relaxed);

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run_stream(sample_rate, channels, underrun, opened_tx, stop_rx))
            .map_err(|err| OutputError::Failed(err.to_string()))?;

        let opened = match opened_rx.recv() {
            Ok(Ok(opened)) => opened,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(OutputError::Failed("stream thread exited".to_string()));
            }
        };

        info!(sample_rate = opened.sample_rate, channels = opened.channels, "cpal output started");
        self.sample_rate = opened.sample_rate;
        self.channels = opened.channels;
        self.running = Some(Running {
            producer: opened.producer,
            stop: stop_tx,
            thread,
        });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            drop(running.stop);
            let _ = running.thread.join();
            info!("cpal output stopped");
        }
    }

    fn write(&mut self, data: &[f32]) -> Result<WriteOutcome, OutputError> {
        let running = self.running.as_mut().ok_or(OutputError::NotStarted)?;
        let mut written = 0;
        while written < data.len() {
            written += running.producer.push_slice(&data[written..]);
            if written < data.len() {
                if running.thread.is_finished() {
                    return Err(OutputError::Failed("stream thread exited".to_string()));
                }
                thread::sleep(WRITE_POLL);
            }
        }
        Ok(WriteOutcome {
            interrupted: self.underrun.swap(false, Ordering::Relaxed),
        })
    }

    fn rendering_delay(&self) -> RenderingDelay {
        let Some(running) = self.running.as_ref() else {
            return RenderingDelay::default();
        };
        if self.channels == 0 || self.sample_rate == 0 {
            return RenderingDelay::default();
        }
        let queued_frames = (running.producer.occupied_len() / self.channels) as i64;
        RenderingDelay::new(queued_frames * 1_000_000 / self.sample_rate as i64, monotonic_now_us())
    }

    fn num_channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn optimal_write_frames_count(&self) -> usize {
        Self::write_frames(self.sample_rate)
    }
}

impl Drop for CpalOutputStream {
    fn drop(&mut self) {
        self.stop();
    }
}
