//! Channel layouts guessed from channel counts

/// Speaker position of one interleaved channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPosition {
    FrontLeft,
    FrontRight,
    Center,
    Lfe,
    BackLeft,
    BackRight,
    SideLeft,
    SideRight,
}

/// Channel layout (interleaving order follows WAVE conventions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    /// L R BL BR
    Quad,
    /// L R C LFE SL SR
    Surround5_1,
    /// L R C LFE BL BR SL SR
    Surround7_1,
    /// No known speaker mapping; channels are copied by index
    Discrete,
}

impl ChannelLayout {
    /// Speaker positions in interleaving order (empty for `Discrete`)
    pub fn positions(self) -> &'static [ChannelPosition] {
        use ChannelPosition::*;
        match self {
            ChannelLayout::Mono => &[Center],
            ChannelLayout::Stereo => &[FrontLeft, FrontRight],
            ChannelLayout::Quad => &[FrontLeft, FrontRight, BackLeft, BackRight],
            ChannelLayout::Surround5_1 => &[FrontLeft, FrontRight, Center, Lfe, SideLeft, SideRight],
            ChannelLayout::Surround7_1 => &[
                FrontLeft, FrontRight, Center, Lfe, BackLeft, BackRight, SideLeft, SideRight,
            ],
            ChannelLayout::Discrete => &[],
        }
    }

    /// Index of `position` in this layout
    pub fn index_of(self, position: ChannelPosition) -> Option<usize> {
        self.positions().iter().position(|p| *p == position)
    }
}

/// Guess the most likely layout for a channel count
pub fn guess_channel_layout(channels: usize) -> ChannelLayout {
    match channels {
        1 => ChannelLayout::Mono,
        2 => ChannelLayout::Stereo,
        4 => ChannelLayout::Quad,
        6 => ChannelLayout::Surround5_1,
        8 => ChannelLayout::Surround7_1,
        _ => ChannelLayout::Discrete,
    }
}

/// Restrict playout to one physical channel, or play all of them.
///
/// `All` orders before any channel index, so the minimum over a set of
/// streams prefers playing every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PlayoutChannel {
    #[default]
    All,
    Channel(usize),
}
