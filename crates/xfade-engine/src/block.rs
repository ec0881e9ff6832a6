//! Planar multichannel sample buffers.
//!
//! [`AudioBlock`] is the unit of audio that travels through the engine:
//! - decoders produce blocks at the sink's rate and channel count
//! - the crossfader splits, merges and overlaps blocks from two streams
//! - the sink queues whole blocks and the output callback drains them through a read cursor
//!
//! Blocks are moved between stages rather than shared; whoever holds a block owns it exclusively,
//! so the mutating algebra below (`split`, `merge`, `overlap`) never races with a reader.

use std::mem;

/// Owned, resizable multichannel buffer.
///
/// All channel vectors have the same length (the block's frame count). The read cursor is only
/// used by the output side; producers leave it at zero.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioBlock {
    channels: Vec<Vec<f32>>,
    read_pos: usize,
    remove_click: bool,
}

/// Result of [`AudioBlock::overlap`].
#[derive(Debug)]
pub struct Overlap {
    /// Sample-wise sum over the region where both blocks have material.
    pub merged: AudioBlock,
    /// `true` when the later-starting block ends inside the earlier one, so the remainder after
    /// the overlap comes from the earlier-starting block.
    pub embedded: bool,
}

impl AudioBlock {
    /// Empty block with `channels` channels.
    pub fn new(channels: usize) -> Self {
        Self {
            channels: vec![Vec::new(); channels],
            read_pos: 0,
            remove_click: false,
        }
    }

    /// Block of `frames` zero samples.
    pub fn silence(channels: usize, frames: usize) -> Self {
        Self {
            channels: vec![vec![0.0; frames]; channels],
            read_pos: 0,
            remove_click: false,
        }
    }

    /// Build from per-channel vectors. Shorter channels are zero-padded to the longest one.
    pub fn from_channels(mut channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.iter().map(Vec::len).max().unwrap_or(0);
        for ch in &mut channels {
            ch.resize(frames, 0.0);
        }
        Self {
            channels,
            read_pos: 0,
            remove_click: false,
        }
    }

    /// Deinterleave `samples` (frame-major) into a new block. A trailing partial frame is dropped.
    pub fn from_interleaved(samples: &[f32], channels: usize) -> Self {
        if channels == 0 {
            return Self::default();
        }
        let frames = samples.len() / channels;
        let mut out = vec![Vec::with_capacity(frames); channels];
        for frame in samples.chunks_exact(channels) {
            for (ch, s) in frame.iter().enumerate() {
                out[ch].push(*s);
            }
        }
        Self {
            channels: out,
            read_pos: 0,
            remove_click: false,
        }
    }

    /// Append this block's samples to `out` in interleaved order.
    pub fn write_interleaved(&self, out: &mut Vec<f32>) {
        let frames = self.len();
        out.reserve(frames * self.channels.len());
        for i in 0..frames {
            for ch in &self.channels {
                out.push(ch[i]);
            }
        }
    }

    pub fn to_interleaved(&self) -> Vec<f32> {
        let mut out = Vec::new();
        self.write_interleaved(&mut out);
        out
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.channels[ch]
    }

    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        &mut self.channels[ch]
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn set_read_pos(&mut self, pos: usize) {
        self.read_pos = pos.min(self.len());
    }

    /// Frames left after the read cursor.
    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.read_pos)
    }

    pub fn at_end(&self) -> bool {
        self.read_pos >= self.len()
    }

    /// Whether the boundary between the previous emission and this block should be smoothed.
    pub fn remove_click(&self) -> bool {
        self.remove_click
    }

    pub fn set_remove_click(&mut self, remove_click: bool) {
        self.remove_click = remove_click;
    }

    /// Drop all samples, keeping the channel count.
    pub fn clear(&mut self) {
        for ch in &mut self.channels {
            ch.clear();
        }
        self.read_pos = 0;
        self.remove_click = false;
    }

    /// Replace this block's contents with a copy of `other`.
    pub fn set(&mut self, other: &AudioBlock) {
        self.clone_from(other);
    }

    pub fn swap(&mut self, other: &mut AudioBlock) {
        mem::swap(self, other);
    }

    /// Multiply every sample by `gain`.
    pub fn apply_gain(&mut self, gain: f32) {
        if gain == 1.0 {
            return;
        }
        for ch in &mut self.channels {
            for s in ch.iter_mut() {
                *s *= gain;
            }
        }
    }

    /// Multiply by a gain moving linearly from `from` (first frame) towards `to` (one frame past
    /// the last).
    pub fn apply_gain_ramp(&mut self, from: f32, to: f32) {
        if from == to {
            self.apply_gain(from);
            return;
        }
        let frames = self.len();
        let step = (to - from) / frames.max(1) as f32;
        for ch in &mut self.channels {
            for (i, s) in ch.iter_mut().enumerate() {
                *s *= from + step * i as f32;
            }
        }
    }

    /// Keep frames `[0, pos)` and return frames `[pos, len)` as a new block.
    ///
    /// The read cursor follows the samples it pointed at: if it was past `pos`, the tail inherits
    /// the remainder and this block is left exhausted. The click flag stays with the head.
    pub fn split(&mut self, pos: usize) -> AudioBlock {
        let pos = pos.min(self.len());
        let tail_channels = self
            .channels
            .iter_mut()
            .map(|ch| ch.split_off(pos))
            .collect();
        let tail_read_pos = self.read_pos.saturating_sub(pos);
        self.read_pos = self.read_pos.min(pos);
        AudioBlock {
            channels: tail_channels,
            read_pos: tail_read_pos,
            remove_click: false,
        }
    }

    /// Return frames `[0, pos)` as a new block and keep frames `[pos, len)` in `self`.
    pub fn split_backwards(&mut self, pos: usize) -> AudioBlock {
        let mut head = self.split(pos);
        self.swap(&mut head);
        head
    }

    /// Add `other` sample-wise, growing to the longer of the two lengths.
    pub fn merge(&mut self, other: &AudioBlock) {
        if self.channels.is_empty() {
            self.channels = vec![Vec::new(); other.channel_count()];
        }
        let frames = self.len().max(other.len());
        for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
            dst.resize(frames, 0.0);
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }
        if self.channels.len() > other.channels.len() {
            for dst in &mut self.channels[other.channels.len()..] {
                dst.resize(frames, 0.0);
            }
        }
    }

    /// Concatenate `other` after this block's last frame.
    pub fn append(&mut self, other: &AudioBlock) {
        if self.channels.is_empty() {
            self.channels = vec![Vec::new(); other.channel_count()];
        }
        let frames = self.len();
        for (ch, dst) in self.channels.iter_mut().enumerate() {
            match other.channels.get(ch) {
                Some(src) => dst.extend_from_slice(src),
                None => dst.resize(frames + other.len(), 0.0),
            }
        }
    }

    /// Resize every channel to `frames`, zero-filling new frames.
    pub fn resize(&mut self, frames: usize) {
        for ch in &mut self.channels {
            ch.resize(frames, 0.0);
        }
        self.read_pos = self.read_pos.min(frames);
    }

    /// Convert to `dst` channels: mono is duplicated, a mono target averages all sources, other
    /// layouts clamp to the last available source channel.
    pub fn remap_channels(&mut self, dst: usize) {
        let src = self.channels.len();
        if src == dst || src == 0 || dst == 0 {
            return;
        }
        let frames = self.len();
        let mapped = if dst == 1 {
            let scale = 1.0 / src as f32;
            let mut mono = vec![0.0; frames];
            for ch in &self.channels {
                for (m, s) in mono.iter_mut().zip(ch) {
                    *m += *s * scale;
                }
            }
            vec![mono]
        } else {
            (0..dst)
                .map(|ch| self.channels[ch.min(src - 1)].clone())
                .collect()
        };
        self.channels = mapped;
    }

    /// Overlap two blocks on a common timeline where `other` starts `offset` frames after `self`
    /// (a negative offset means `other` starts first).
    ///
    /// Afterwards `self` holds the material before the overlap (from the earlier-starting block),
    /// the returned [`Overlap::merged`] holds the summed overlap region, and `other` holds whatever
    /// extends past the overlap. Concatenating head, merged and remainder reproduces the mix of
    /// both blocks. If the blocks do not touch, the remainder is preceded by the silent gap.
    pub fn overlap(&mut self, other: &mut AudioBlock, offset: isize) -> Overlap {
        if offset < 0 {
            // Normalize so that `self` is the earlier-starting block.
            self.swap(other);
            let result = self.overlap(other, -offset);
            return result;
        }

        let offset = offset as usize;
        let len_a = self.len();
        let len_b = other.len();
        let channels = self.channel_count().max(other.channel_count());

        if offset >= len_a {
            let gap = AudioBlock::silence(channels, offset - len_a);
            let mut rest = gap;
            rest.append(other);
            *other = rest;
            return Overlap {
                merged: AudioBlock::new(channels),
                embedded: false,
            };
        }

        let end = offset + len_b;
        let embedded = end <= len_a;
        let mut merged = self.split(offset);

        if embedded {
            let rest_a = merged.split(len_b);
            merged.merge(other);
            *other = rest_a;
        } else {
            let rest_b = other.split(len_a - offset);
            merged.merge(other);
            *other = rest_b;
        }
        merged.set_remove_click(false);
        other.set_remove_click(false);

        Overlap { merged, embedded }
    }
}
