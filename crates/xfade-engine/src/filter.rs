//! Click removal across block boundaries.
//!
//! When two pieces of audio are butted together (track change, crossfade entry, leftover hand-back)
//! the waveform can jump. The sink keeps a short tail of already-submitted audio in a
//! [`HoldBackQueue`] and, when the next block asks for it, rewrites a few milliseconds on both
//! sides of the boundary with a cubic Hermite curve that starts on the left signal and lands on the
//! right signal with matching slopes.

use serde::Deserialize;

use crate::block::AudioBlock;
use crate::hold_back::HoldBackQueue;

/// Smallest smoothing window, in samples.
pub const MIN_WINDOW_SAMPLES: usize = 6;

/// Default smoothing window, in seconds.
pub const DEFAULT_TIME_INTERVAL: f32 = 0.001;

/// Interpolation applied at a boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// Leave samples untouched.
    PassThru,
    #[default]
    CubicHermite,
}

/// Which sides of a boundary have enough samples for the filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadyFlags(u8);

impl ReadyFlags {
    pub const NONE: ReadyFlags = ReadyFlags(0);
    pub const LEFT: ReadyFlags = ReadyFlags(1);
    pub const RIGHT: ReadyFlags = ReadyFlags(2);
    pub const BOTH: ReadyFlags = ReadyFlags(3);

    pub fn left(self) -> bool {
        self.0 & Self::LEFT.0 != 0
    }

    pub fn right(self) -> bool {
        self.0 & Self::RIGHT.0 != 0
    }

    pub fn both(self) -> bool {
        self == Self::BOTH
    }
}

/// Endpoint values and slopes of one channel, slopes scaled to the whole window.
#[derive(Clone, Copy, Debug)]
struct Endpoints {
    p0: f32,
    m0: f32,
    p1: f32,
    m1: f32,
}

/// Boundary smoothing filter configured for one sample rate.
#[derive(Clone, Debug)]
pub struct ClickRemovalFilter {
    kind: FilterKind,
    time_interval: f32,
    window: usize,
}

impl ClickRemovalFilter {
    pub fn new(kind: FilterKind, time_interval: f32, sample_rate: u32) -> Self {
        let interval = if time_interval.is_finite() && time_interval > 0.0 {
            time_interval
        } else {
            DEFAULT_TIME_INTERVAL
        };
        let window = ((interval * sample_rate as f32).round() as usize).max(MIN_WINDOW_SAMPLES);
        Self {
            kind,
            time_interval: interval,
            window,
        }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn time_interval(&self) -> f32 {
        self.time_interval
    }

    /// Samples rewritten per channel at one boundary.
    pub fn window_samples(&self) -> usize {
        self.window
    }

    fn left_span(&self) -> usize {
        self.window / 2
    }

    fn right_span(&self) -> usize {
        self.window - self.left_span()
    }

    /// Frames that must be held back before a boundary can be smoothed.
    pub fn samples_needed_left(&self) -> usize {
        match self.kind {
            FilterKind::PassThru => 0,
            // One extra sample for the slope estimate.
            FilterKind::CubicHermite => self.left_span() + 1,
        }
    }

    /// Frames the incoming block must carry before a boundary can be smoothed.
    pub fn samples_needed_right(&self) -> usize {
        match self.kind {
            FilterKind::PassThru => 0,
            // Landing sample plus one for its slope.
            FilterKind::CubicHermite => self.right_span() + 2,
        }
    }

    pub fn ready_flags(&self, left_available: usize, right_available: usize) -> ReadyFlags {
        let mut flags = 0;
        if left_available >= self.samples_needed_left() {
            flags |= ReadyFlags::LEFT.0;
        }
        if right_available >= self.samples_needed_right() {
            flags |= ReadyFlags::RIGHT.0;
        }
        ReadyFlags(flags)
    }

    /// Corrected sample at `t` in `[0, 1]` across the window.
    fn process_sample(&self, ends: Endpoints, t: f32) -> f32 {
        let t2 = t * t;
        let t3 = t2 * t;
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;
        h00 * ends.p0 + h10 * ends.m0 + h01 * ends.p1 + h11 * ends.m1
    }

    /// Smooth the boundary between the newest held-back frames and the head of `right`.
    ///
    /// Returns `false` (leaving everything untouched) when either side is too short.
    pub fn apply(&self, left: &mut HoldBackQueue, right: &mut AudioBlock) -> bool {
        if self.kind == FilterKind::PassThru {
            return false;
        }
        if !self.ready_flags(left.total_len(), right.len()).both() {
            return false;
        }

        let n = self.window as f32;
        let left_span = self.left_span();
        let right_span = self.right_span();
        let left_start = left.total_len() - left_span;

        for ch in 0..right.channel_count() {
            let (Some(before), Some(p0)) = (left.sample(ch, left_start - 1), left.sample(ch, left_start))
            else {
                continue;
            };
            let rhs = right.channel(ch);
            let ends = Endpoints {
                p0,
                m0: (p0 - before) * n,
                p1: rhs[right_span],
                m1: (rhs[right_span + 1] - rhs[right_span]) * n,
            };

            for j in 0..left_span {
                if let Some(s) = left.sample_mut(ch, left_start + j) {
                    *s = self.process_sample(ends, j as f32 / n);
                }
            }
            let rhs = right.channel_mut(ch);
            for k in 0..right_span {
                rhs[k] = self.process_sample(ends, (left_span + k) as f32 / n);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(samples: Vec<f32>) -> AudioBlock {
        AudioBlock::from_channels(vec![samples])
    }

    #[test]
    fn window_respects_minimum() {
        let f = ClickRemovalFilter::new(FilterKind::CubicHermite, 0.00001, 44_100);
        assert_eq!(f.window_samples(), MIN_WINDOW_SAMPLES);
        let f = ClickRemovalFilter::new(FilterKind::CubicHermite, 0.001, 44_100);
        assert_eq!(f.window_samples(), 44);
        assert_eq!(f.samples_needed_left(), 23);
        assert_eq!(f.samples_needed_right(), 24);
    }

    #[test]
    fn ready_flags_report_each_side() {
        let f = ClickRemovalFilter::new(FilterKind::CubicHermite, 0.0, 8_000);
        assert_eq!(f.ready_flags(0, 0), ReadyFlags::NONE);
        assert_eq!(f.ready_flags(100, 0), ReadyFlags::LEFT);
        assert_eq!(f.ready_flags(0, 100), ReadyFlags::RIGHT);
        assert!(f.ready_flags(100, 100).both());
    }

    #[test]
    fn pass_thru_never_touches_samples() {
        let f = ClickRemovalFilter::new(FilterKind::PassThru, 0.001, 8_000);
        let mut left = HoldBackQueue::new();
        left.add(mono(vec![1.0; 32]));
        let mut right = mono(vec![-1.0; 32]);
        assert!(!f.apply(&mut left, &mut right));
        assert_eq!(right.channel(0)[0], -1.0);
    }

    #[test]
    fn step_is_smoothed_monotonically() {
        let f = ClickRemovalFilter::new(FilterKind::CubicHermite, 0.001, 8_000);
        let mut left = HoldBackQueue::new();
        left.add(mono(vec![1.0; 20]));
        let mut right = mono(vec![-1.0; 20]);
        assert!(f.apply(&mut left, &mut right));

        let mut joined = left.create_block(1);
        joined.append(&right);
        let s = joined.channel(0);
        for w in s.windows(2) {
            assert!(w[1] <= w[0] + 1e-6, "{} then {}", w[0], w[1]);
            assert!((w[0] - w[1]).abs() < 1.0);
        }
        assert_eq!(s[0], 1.0);
        assert_eq!(*s.last().unwrap(), -1.0);
    }

    #[test]
    fn smooth_signal_is_preserved() {
        // A straight line passes through the interpolation unchanged.
        let f = ClickRemovalFilter::new(FilterKind::CubicHermite, 0.001, 8_000);
        let line: Vec<f32> = (0..40).map(|i| i as f32 * 0.01).collect();
        let mut left = HoldBackQueue::new();
        left.add(mono(line[..20].to_vec()));
        let mut right = mono(line[20..].to_vec());
        assert!(f.apply(&mut left, &mut right));
        let mut joined = left.create_block(1);
        joined.append(&right);
        for (a, b) in joined.channel(0).iter().zip(&line) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn short_right_side_is_left_alone() {
        let f = ClickRemovalFilter::new(FilterKind::CubicHermite, 0.001, 8_000);
        let mut left = HoldBackQueue::new();
        left.add(mono(vec![1.0; 20]));
        let mut right = mono(vec![-1.0; 3]);
        assert!(!f.apply(&mut left, &mut right));
        assert_eq!(right.channel(0), &[-1.0, -1.0, -1.0]);
    }
}
