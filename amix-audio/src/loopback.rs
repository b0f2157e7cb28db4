//! Loopback - the final mix, before device-specific processing

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Why loopback audio stopped flowing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackInterruptReason {
    /// Output restarted with new parameters
    ConfigChange,
    /// Output closed
    OutputStopped,
    /// Output underran; audio was dropped
    Underrun,
}

impl fmt::Display for LoopbackInterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopbackInterruptReason::ConfigChange => "config change",
            LoopbackInterruptReason::OutputStopped => "output stopped",
            LoopbackInterruptReason::Underrun => "underrun",
        };
        f.write_str(name)
    }
}

/// Consumer of the mixed loopback signal, called on the mixer thread
pub trait LoopbackSink: Send {
    /// `data` holds `frames` interleaved frames of `channels` channels.
    /// `timestamp_us` is when the first frame will be heard, if known.
    fn send_data(&mut self, timestamp_us: Option<i64>, sample_rate: u32, channels: usize, data: &[f32], frames: usize);

    fn send_interrupt(&mut self, reason: LoopbackInterruptReason);

    /// Bytes per `send_data` call from now on
    fn set_data_size(&mut self, _bytes: usize) {}
}

/// One block of loopback audio
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackData {
    pub timestamp_us: Option<i64>,
    pub sample_rate: u32,
    pub channels: usize,
    pub frames: usize,
    pub samples: Vec<f32>,
}

impl LoopbackData {
    /// Largest absolute sample value
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopbackEvent {
    Data(LoopbackData),
    Interrupt(LoopbackInterruptReason),
}

/// Fans loopback audio out to any number of channel subscribers.
///
/// Cloning shares the subscriber list, so one clone can live in the mixer
/// while another hands out subscriptions. Slow subscribers lose events;
/// dropped receivers are pruned.
#[derive(Clone, Default)]
pub struct LoopbackHandler {
    subscribers: Arc<Mutex<Vec<Sender<LoopbackEvent>>>>,
    data_size: Arc<AtomicUsize>,
}

impl LoopbackHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with room for `capacity` pending events
    pub fn subscribe(&self, capacity: usize) -> Receiver<LoopbackEvent> {
        let (tx, rx) = bounded(capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Bytes per data block, as last announced by the mixer
    pub fn data_size(&self) -> usize {
        self.data_size.load(Ordering::Relaxed)
    }

    fn broadcast(&self, event: LoopbackEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !matches!(tx.try_send(event.clone()), Err(TrySendError::Disconnected(_))));
    }
}

impl fmt::Debug for LoopbackHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackHandler")
            .field("subscribers", &self.subscriber_count())
            .field("data_size", &self.data_size())
            .finish()
    }
}

impl LoopbackSink for LoopbackHandler {
    fn send_data(&mut self, timestamp_us: Option<i64>, sample_rate: u32, channels: usize, data: &[f32], frames: usize) {
        if self.subscribers.lock().is_empty() {
            return;
        }
        let len = (frames * channels).min(data.len());
        self.broadcast(LoopbackEvent::Data(LoopbackData {
            timestamp_us,
            sample_rate,
            channels,
            frames,
            samples: data[..len].to_vec(),
        }));
    }

    fn send_interrupt(&mut self, reason: LoopbackInterruptReason) {
        self.broadcast(LoopbackEvent::Interrupt(reason));
    }

    fn set_data_size(&mut self, bytes: usize) {
        self.data_size.store(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out() {
        let mut handler = LoopbackHandler::new();
        let a = handler.subscribe(4);
        let b = handler.subscribe(4);
        handler.send_data(Some(10), 48000, 2, &[0.5, -0.25, 0.0, 0.0], 1);

        for rx in [&a, &b] {
            match rx.try_recv().unwrap() {
                LoopbackEvent::Data(data) => {
                    assert_eq!(data.samples, vec![0.5, -0.25]);
                    assert_eq!(data.timestamp_us, Some(10));
                    assert_eq!(data.peak(), 0.5);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_full_subscriber_drops_events() {
        let mut handler = LoopbackHandler::new();
        let rx = handler.subscribe(1);
        handler.send_interrupt(LoopbackInterruptReason::Underrun);
        handler.send_interrupt(LoopbackInterruptReason::OutputStopped);
        assert_eq!(rx.try_recv().unwrap(), LoopbackEvent::Interrupt(LoopbackInterruptReason::Underrun));
        assert!(rx.try_recv().is_err());
        assert_eq!(handler.subscriber_count(), 1);
    }

    #[test]
    fn test_disconnected_subscribers_pruned() {
        let mut handler = LoopbackHandler::new();
        let rx = handler.subscribe(4);
        drop(rx);
        handler.send_interrupt(LoopbackInterruptReason::ConfigChange);
        assert_eq!(handler.subscriber_count(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let handler = LoopbackHandler::new();
        let mut sink = handler.clone();
        let rx = handler.subscribe(4);
        sink.set_data_size(2048);
        sink.send_interrupt(LoopbackInterruptReason::Underrun);
        assert_eq!(handler.data_size(), 2048);
        assert!(rx.try_recv().is_ok());
    }
}
