//! Rendering delay bookkeeping

/// How far in the future audio written now will be heard.
///
/// `timestamp_microseconds` is the monotonic time the delay was measured at;
/// `None` when the output cannot tell yet (nothing written, device stopped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderingDelay {
    pub delay_microseconds: i64,
    pub timestamp_microseconds: Option<i64>,
}

impl RenderingDelay {
    pub fn new(delay_microseconds: i64, timestamp_microseconds: i64) -> Self {
        Self {
            delay_microseconds,
            timestamp_microseconds: Some(timestamp_microseconds),
        }
    }

    /// Same measurement with extra delay added on top
    pub fn plus(self, extra_microseconds: i64) -> Self {
        Self {
            delay_microseconds: self.delay_microseconds + extra_microseconds,
            timestamp_microseconds: self.timestamp_microseconds,
        }
    }
}

/// Convert a frame count at `sample_rate` into microseconds
#[inline]
pub fn frames_to_microseconds(frames: usize, sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return 0;
    }
    (frames as i64 * 1_000_000) / sample_rate as i64
}
