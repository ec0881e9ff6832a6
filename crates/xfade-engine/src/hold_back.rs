//! Blocks retained by the sink until a boundary filter has seen enough context.

use std::collections::VecDeque;

use crate::block::AudioBlock;

/// Ordered run of blocks with an incrementally maintained frame total.
#[derive(Debug, Default)]
pub struct HoldBackQueue {
    blocks: VecDeque<AudioBlock>,
    total: usize,
}

impl HoldBackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, block: AudioBlock) {
        self.total += block.len();
        self.blocks.push_back(block);
    }

    /// Remove and return the oldest block.
    pub fn remove(&mut self) -> Option<AudioBlock> {
        let block = self.blocks.pop_front()?;
        self.total -= block.len();
        Some(block)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Frames held across all blocks.
    pub fn total_len(&self) -> usize {
        self.total
    }

    /// Frames held by everything except the oldest block.
    pub fn total_len_without_front(&self) -> usize {
        self.total - self.front_len()
    }

    pub fn front_len(&self) -> usize {
        self.blocks.front().map(AudioBlock::len).unwrap_or(0)
    }

    pub fn back_len(&self) -> usize {
        self.blocks.back().map(AudioBlock::len).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.total = 0;
    }

    /// Concatenate all held blocks into one new block without removing them.
    pub fn create_block(&self, channels: usize) -> AudioBlock {
        let mut out = AudioBlock::new(channels);
        for block in &self.blocks {
            out.append(block);
        }
        out
    }

    /// Sample at frame `index` counted from the start of the oldest block.
    pub fn sample(&self, ch: usize, index: usize) -> Option<f32> {
        let (block, offset) = self.locate(index)?;
        self.blocks[block].channel(ch).get(offset).copied()
    }

    pub fn sample_mut(&mut self, ch: usize, index: usize) -> Option<&mut f32> {
        let (block, offset) = self.locate(index)?;
        self.blocks[block].channel_mut(ch).get_mut(offset)
    }

    fn locate(&self, mut index: usize) -> Option<(usize, usize)> {
        for (i, block) in self.blocks.iter().enumerate() {
            if index < block.len() {
                return Some((i, index));
            }
            index -= block.len();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(samples: &[f32]) -> AudioBlock {
        AudioBlock::from_channels(vec![samples.to_vec()])
    }

    #[test]
    fn totals_follow_add_and_remove() {
        let mut q = HoldBackQueue::new();
        q.add(mono(&[1.0, 2.0, 3.0]));
        q.add(mono(&[4.0, 5.0]));
        assert_eq!(q.total_len(), 5);
        assert_eq!(q.total_len_without_front(), 2);
        assert_eq!(q.back_len(), 2);

        let front = q.remove().unwrap();
        assert_eq!(front.len(), 3);
        assert_eq!(q.total_len(), 2);
        assert_eq!(q.total_len_without_front(), 0);
    }

    #[test]
    fn samples_are_addressed_across_blocks() {
        let mut q = HoldBackQueue::new();
        q.add(mono(&[1.0, 2.0]));
        q.add(mono(&[3.0, 4.0, 5.0]));
        assert_eq!(q.sample(0, 3), Some(4.0));
        *q.sample_mut(0, 1).unwrap() = 9.0;
        assert_eq!(q.create_block(1).channel(0), &[1.0, 9.0, 3.0, 4.0, 5.0]);
        assert_eq!(q.sample(0, 5), None);
    }
}
