//! Interleaved channel mixer - up/down-mixes between channel layouts

use crate::layout::{ChannelLayout, ChannelPosition};

/// Gain used when folding one speaker into two (-3 dB)
const EQUAL_POWER_SCALE: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Converts N-channel interleaved audio to M-channel interleaved audio.
///
/// Built once per (N, M) pair; owns its output buffer so converting a block
/// never allocates as long as it fits in `max_frames`.
#[derive(Debug, Clone)]
pub struct InterleavedChannelMixer {
    input_channels: usize,
    output_channels: usize,
    /// `output_channels` rows of `input_channels` gains
    matrix: Vec<f32>,
    /// Plain copy, no matrix multiply needed
    passthrough: bool,
    buffer: Vec<f32>,
}

impl InterleavedChannelMixer {
    /// Create a mixer from `input_layout`/`input_channels` to
    /// `output_layout`/`output_channels` for blocks of up to `max_frames`
    pub fn new(
        input_layout: ChannelLayout,
        input_channels: usize,
        output_layout: ChannelLayout,
        output_channels: usize,
        max_frames: usize,
    ) -> Self {
        assert!(input_channels > 0 && output_channels > 0, "channel counts must be non-zero");

        let matrix = build_matrix(input_layout, input_channels, output_layout, output_channels);
        let passthrough = input_channels == output_channels
            && (0..output_channels).all(|out| {
                (0..input_channels).all(|inp| {
                    let expected = if inp == out { 1.0 } else { 0.0 };
                    matrix[out * input_channels + inp] == expected
                })
            });

        Self {
            input_channels,
            output_channels,
            matrix,
            passthrough,
            buffer: vec![0.0; output_channels * max_frames],
        }
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Gain from input channel `input` to output channel `output`
    pub fn gain(&self, input: usize, output: usize) -> f32 {
        self.matrix[output * self.input_channels + input]
    }

    /// Convert `frames` frames of `input` and return the converted block.
    ///
    /// The returned slice is owned by the mixer and valid until the next call.
    pub fn transform(&mut self, input: &[f32], frames: usize) -> &mut [f32] {
        let needed = frames * self.output_channels;
        if self.buffer.len() < needed {
            // Block larger than planned for; grow once and keep it
            self.buffer.resize(needed, 0.0);
        }
        let available = (input.len() / self.input_channels).min(frames);
        let out = &mut self.buffer[..needed];

        if self.passthrough {
            let copied = available * self.input_channels;
            out[..copied].copy_from_slice(&input[..copied]);
            out[copied..].fill(0.0);
            return out;
        }

        out.fill(0.0);
        for frame in 0..available {
            let in_frame = &input[frame * self.input_channels..(frame + 1) * self.input_channels];
            let out_frame = &mut out[frame * self.output_channels..(frame + 1) * self.output_channels];
            for (o, sample) in out_frame.iter_mut().enumerate() {
                let row = &self.matrix[o * self.input_channels..(o + 1) * self.input_channels];
                *sample = row.iter().zip(in_frame).map(|(gain, x)| gain * x).sum();
            }
        }
        out
    }
}

/// Build the mixing matrix, folding speakers the output lacks into
/// the nearest ones it has
fn build_matrix(
    input_layout: ChannelLayout,
    input_channels: usize,
    output_layout: ChannelLayout,
    output_channels: usize,
) -> Vec<f32> {
    let mut matrix = vec![0.0; input_channels * output_channels];
    let mut set = |inp: usize, out: usize, gain: f32| {
        matrix[out * input_channels + inp] += gain;
    };

    let in_positions = input_layout.positions();
    let out_positions = output_layout.positions();
    if in_positions.len() != input_channels || out_positions.len() != output_channels {
        // Unknown speaker mapping on either side: copy by index
        for ch in 0..input_channels.min(output_channels) {
            set(ch, ch, 1.0);
        }
        return matrix;
    }

    let out_index = |position| output_layout.index_of(position);
    let stereo_to_mono = input_layout == ChannelLayout::Stereo && output_layout == ChannelLayout::Mono;

    for (inp, &position) in in_positions.iter().enumerate() {
        if let Some(out) = out_index(position) {
            set(inp, out, 1.0);
            continue;
        }

        use ChannelPosition::*;
        match position {
            Center => {
                // Mono up-mix is a straight copy; surround center folds at -3 dB
                let gain = if input_layout == ChannelLayout::Mono { 1.0 } else { EQUAL_POWER_SCALE };
                if let (Some(l), Some(r)) = (out_index(FrontLeft), out_index(FrontRight)) {
                    set(inp, l, gain);
                    set(inp, r, gain);
                }
            }
            FrontLeft | FrontRight => {
                // Full-scale stereo summed at -3 dB clips, so halve instead
                let gain = if stereo_to_mono { 0.5 } else { EQUAL_POWER_SCALE };
                if let Some(c) = out_index(Center) {
                    set(inp, c, gain);
                }
            }
            Lfe => {
                if let Some(c) = out_index(Center) {
                    set(inp, c, EQUAL_POWER_SCALE);
                } else if let (Some(l), Some(r)) = (out_index(FrontLeft), out_index(FrontRight)) {
                    set(inp, l, EQUAL_POWER_SCALE);
                    set(inp, r, EQUAL_POWER_SCALE);
                }
            }
            BackLeft | SideLeft | BackRight | SideRight => {
                let (twin, front) = match position {
                    BackLeft => (SideLeft, FrontLeft),
                    SideLeft => (BackLeft, FrontLeft),
                    BackRight => (SideRight, FrontRight),
                    _ => (BackRight, FrontRight),
                };
                if let Some(out) = out_index(twin) {
                    set(inp, out, 1.0);
                } else if let Some(out) = out_index(front) {
                    set(inp, out, EQUAL_POWER_SCALE);
                } else if let Some(c) = out_index(Center) {
                    set(inp, c, EQUAL_POWER_SCALE);
                }
            }
        }
    }
    matrix
}
