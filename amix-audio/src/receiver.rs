//! Stream count notifications

use crossbeam_channel::Sender;

/// Active stream counts; a stream is active while its source plays and its
/// volume is above zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamCounts {
    pub primary: usize,
    pub sfx: usize,
}

/// Told whenever the number of active primary or effects streams changes
pub trait StreamCountObserver: Send {
    fn on_stream_count_changed(&mut self, primary: usize, sfx: usize);
}

impl StreamCountObserver for Sender<StreamCounts> {
    fn on_stream_count_changed(&mut self, primary: usize, sfx: usize) {
        let _ = self.try_send(StreamCounts { primary, sfx });
    }
}
