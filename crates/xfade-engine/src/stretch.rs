//! Time-stretch stage of one crossfade stream.
//!
//! A feeder thread pushes [`AudioStretchInfo`] units (audio chunk + time ratio + optional
//! reference markers) through a bounded channel; the mixer pulls fixed-size stretched chunks with
//! [`AudioStretcher::get_stretched_audio`]. In between sits a [`StretchEngine`]:
//! - [`SignalsmithEngine`] (signalsmith-stretch) for beat-synchronized fades
//! - [`DirectEngine`] for plain fades, where every ratio is 1
//!
//! The stretcher hides engine latency: the first `input_latency * ratio + output_latency` produced
//! frames are dropped, the engine's tail is drained at end of stream, and the output is trimmed to
//! exactly the sum of `round(frames * ratio)` over all chunks. Reference markers are carried into
//! that output coordinate system.

use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender, bounded};
use signalsmith_stretch::Stretch;

use crate::block::AudioBlock;
use crate::crossfade::calculator::MIN_STRETCH_RATIO;

/// One chunk of unstretched audio and how to stretch it.
#[derive(Clone, Debug)]
pub struct AudioStretchInfo {
    pub block: AudioBlock,
    /// Output length / input length.
    pub time_ratio: f64,
    /// Final chunk of the stream.
    pub last: bool,
    /// Frame inside `block` where this stream's reference point lies.
    pub ref_pos: Option<usize>,
    /// Frame inside `block` where the other stream's reference point lies.
    pub comp_ref_pos: Option<usize>,
}

impl AudioStretchInfo {
    pub fn new(block: AudioBlock, time_ratio: f64) -> Self {
        Self {
            block,
            time_ratio,
            last: false,
            ref_pos: None,
            comp_ref_pos: None,
        }
    }
}

/// Stretched output handed to the mixer.
#[derive(Debug)]
pub struct StretchedChunk {
    pub block: AudioBlock,
    /// Reference point inside `block`, reported once.
    pub ref_pos: Option<usize>,
    /// Complementary reference point inside `block`, reported once.
    pub comp_ref_pos: Option<usize>,
    /// No more audio will follow this chunk.
    pub end_of_stream: bool,
}

/// Interleaved time-stretch engine.
pub trait StretchEngine: Send {
    /// Delay, in input frames, between input and output.
    fn input_latency(&self) -> usize;
    /// Additional delay, in output frames.
    fn output_latency(&self) -> usize;
    /// Consume all of `input` and fill all of `output`; lengths set the ratio.
    fn process(&mut self, input: &[f32], output: &mut [f32]);
    /// Emit buffered output without further input.
    fn flush(&mut self, output: &mut [f32]);
    fn reset(&mut self);
}

/// Phase-vocoder stretching without pitch change.
pub struct SignalsmithEngine {
    stretch: Stretch,
}

impl SignalsmithEngine {
    pub fn new(channels: usize, sample_rate: u32) -> Self {
        Self {
            stretch: Stretch::preset_default(channels as u32, sample_rate),
        }
    }
}

// The native stretcher is only ever touched by the thread that owns the engine.
unsafe impl Send for SignalsmithEngine {}

impl StretchEngine for SignalsmithEngine {
    fn input_latency(&self) -> usize {
        self.stretch.input_latency()
    }

    fn output_latency(&self) -> usize {
        self.stretch.output_latency()
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        output.fill(0.0);
        self.stretch.process(input, &mut output[..]);
    }

    fn flush(&mut self, output: &mut [f32]) {
        output.fill(0.0);
        self.stretch.flush(&mut output[..]);
    }

    fn reset(&mut self) {
        self.stretch.reset();
    }
}

/// Latency-free engine: copies when lengths match, linearly resamples otherwise.
pub struct DirectEngine {
    channels: usize,
}

impl DirectEngine {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
        }
    }
}

impl StretchEngine for DirectEngine {
    fn input_latency(&self) -> usize {
        0
    }

    fn output_latency(&self) -> usize {
        0
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let ch = self.channels;
        let in_frames = input.len() / ch;
        let out_frames = output.len() / ch;
        if in_frames == out_frames {
            output.copy_from_slice(&input[..output.len()]);
            return;
        }
        if in_frames == 0 {
            output.fill(0.0);
            return;
        }
        let step = in_frames as f64 / out_frames.max(1) as f64;
        for o in 0..out_frames {
            let pos = o as f64 * step;
            let i0 = (pos.floor() as usize).min(in_frames - 1);
            let i1 = (i0 + 1).min(in_frames - 1);
            let frac = (pos - i0 as f64) as f32;
            for c in 0..ch {
                let a = input[i0 * ch + c];
                let b = input[i1 * ch + c];
                output[o * ch + c] = a + (b - a) * frac;
            }
        }
    }

    fn flush(&mut self, output: &mut [f32]) {
        output.fill(0.0);
    }

    fn reset(&mut self) {}
}

/// Producer side of a stretcher.
#[derive(Clone)]
pub struct StretchFeed {
    tx: Sender<AudioStretchInfo>,
}

impl StretchFeed {
    /// Queue a chunk, blocking while the stretcher is behind. Returns `false` once the stretcher
    /// has been dropped.
    pub fn submit(&self, info: AudioStretchInfo) -> bool {
        self.tx.send(info).is_ok()
    }
}

/// Frames of engine output still to be dropped before genuine audio starts.
///
/// The target tracks the ratio in force: when the ratio changes before the latency has been
/// consumed, the unconsumed part is rescaled to the new ratio.
#[derive(Clone, Copy, Debug, Default)]
struct LatencyState {
    target: f64,
    discarded: usize,
    ratio: Option<f64>,
}

impl LatencyState {
    fn update_ratio(&mut self, ratio: f64, input_latency: usize, output_latency: usize) {
        let full = input_latency as f64 * ratio + output_latency as f64;
        match self.ratio {
            None => self.target = full,
            Some(old) if old != ratio => {
                let old_full = input_latency as f64 * old + output_latency as f64;
                let remaining = (self.target - self.discarded as f64).max(0.0);
                if old_full > 0.0 && remaining > 0.0 {
                    self.target = self.discarded as f64 + remaining * full / old_full;
                }
            }
            Some(_) => {}
        }
        self.ratio = Some(ratio);
    }

    fn pending(&self) -> usize {
        (self.target.round() as usize).saturating_sub(self.discarded)
    }
}

/// Consumer side: stretches queued chunks on demand.
pub struct AudioStretcher {
    channels: usize,
    engine: Box<dyn StretchEngine>,
    infos: Receiver<AudioStretchInfo>,
    latency: LatencyState,
    ready: VecDeque<f32>,
    carry: f64,
    scheduled: u64,
    delivered: u64,
    ref_pos: Option<u64>,
    ref_reported: bool,
    comp_ref_pos: Option<u64>,
    comp_ref_reported: bool,
    input_done: bool,
    scratch_in: Vec<f32>,
    scratch_out: Vec<f32>,
}

impl AudioStretcher {
    /// Create a stretcher and its feed, with room for `capacity` queued chunks.
    pub fn new(
        channels: usize,
        engine: Box<dyn StretchEngine>,
        capacity: usize,
    ) -> (StretchFeed, AudioStretcher) {
        let (tx, rx) = bounded(capacity.max(1));
        let stretcher = AudioStretcher {
            channels: channels.max(1),
            engine,
            infos: rx,
            latency: LatencyState::default(),
            ready: VecDeque::new(),
            carry: 0.0,
            scheduled: 0,
            delivered: 0,
            ref_pos: None,
            ref_reported: false,
            comp_ref_pos: None,
            comp_ref_reported: false,
            input_done: false,
            scratch_in: Vec::new(),
            scratch_out: Vec::new(),
        };
        (StretchFeed { tx }, stretcher)
    }

    fn ready_frames(&self) -> usize {
        self.ready.len() / self.channels
    }

    /// Stretch one queued chunk.
    fn push_info(&mut self, info: AudioStretchInfo) {
        let ratio = if info.time_ratio.is_finite() {
            info.time_ratio.max(MIN_STRETCH_RATIO)
        } else {
            1.0
        };
        self.latency.update_ratio(
            ratio,
            self.engine.input_latency(),
            self.engine.output_latency(),
        );

        let exact = info.block.len() as f64 * ratio + self.carry;
        let frames_out = exact.floor() as usize;
        self.carry = exact - frames_out as f64;

        if let (Some(rel), None) = (info.ref_pos, self.ref_pos) {
            self.ref_pos = Some(self.scheduled + (rel as f64 * ratio).round() as u64);
        }
        if let (Some(rel), None) = (info.comp_ref_pos, self.comp_ref_pos) {
            self.comp_ref_pos = Some(self.scheduled + (rel as f64 * ratio).round() as u64);
        }
        self.scheduled += frames_out as u64;

        self.scratch_in.clear();
        info.block.write_interleaved(&mut self.scratch_in);
        self.scratch_out.clear();
        self.scratch_out.resize(frames_out * self.channels, 0.0);
        self.engine.process(&self.scratch_in, &mut self.scratch_out);
        let produced = std::mem::take(&mut self.scratch_out);
        self.accept(&produced);
        self.scratch_out = produced;

        if info.last {
            self.finish();
        }
    }

    /// Drop latency frames, keep the rest.
    fn accept(&mut self, produced: &[f32]) {
        let frames = produced.len() / self.channels;
        let skip = self.latency.pending().min(frames);
        self.latency.discarded += skip;
        self.ready.extend(&produced[skip * self.channels..]);
    }

    /// Drain the engine and clamp the output to its nominal length.
    fn finish(&mut self) {
        if self.input_done {
            return;
        }
        self.input_done = true;

        let ratio = self.latency.ratio.unwrap_or(1.0);
        let in_lat = self.engine.input_latency();
        if in_lat > 0 {
            let zeros = vec![0.0; in_lat * self.channels];
            let out_frames = (in_lat as f64 * ratio).round() as usize;
            let mut out = vec![0.0; out_frames * self.channels];
            self.engine.process(&zeros, &mut out);
            self.accept(&out);
        }
        let out_lat = self.engine.output_latency();
        if out_lat > 0 {
            let mut out = vec![0.0; out_lat * self.channels];
            self.engine.flush(&mut out);
            self.accept(&out);
        }

        let owed = (self.scheduled - self.delivered) as usize * self.channels;
        if self.ready.len() > owed {
            tracing::debug!(
                extra_frames = (self.ready.len() - owed) / self.channels,
                "stretcher trimmed tail"
            );
        }
        self.ready.resize(owed, 0.0);
    }

    /// Pull up to `frames` stretched frames, blocking for more input as needed.
    ///
    /// Returns fewer frames only at end of stream. A feed that is dropped without a final chunk
    /// counts as end of stream.
    pub fn get_stretched_audio(&mut self, frames: usize) -> StretchedChunk {
        while !self.input_done && self.ready_frames() < frames {
            match self.infos.recv() {
                Ok(info) => self.push_info(info),
                Err(_) => self.finish(),
            }
        }

        let take = frames.min(self.ready_frames());
        let mut samples = Vec::with_capacity(take * self.channels);
        samples.extend(self.ready.drain(..take * self.channels));
        let block = AudioBlock::from_interleaved(&samples, self.channels);

        let start = self.delivered;
        self.delivered += take as u64;
        let end_of_stream = self.input_done && self.delivered >= self.scheduled;

        let ref_pos = report(&mut self.ref_pos, &mut self.ref_reported, start, take, end_of_stream);
        let comp_ref_pos = report(
            &mut self.comp_ref_pos,
            &mut self.comp_ref_reported,
            start,
            take,
            end_of_stream,
        );

        StretchedChunk {
            block,
            ref_pos,
            comp_ref_pos,
            end_of_stream,
        }
    }
}

fn report(
    pos: &mut Option<u64>,
    reported: &mut bool,
    start: u64,
    len: usize,
    end_of_stream: bool,
) -> Option<usize> {
    let p = (*pos)?;
    if *reported || (p >= start + len as u64 && !end_of_stream) {
        return None;
    }
    *reported = true;
    Some((p.saturating_sub(start) as usize).min(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fixed delay line standing in for an engine with input latency.
    struct DelayEngine {
        line: VecDeque<f32>,
        channels: usize,
        delay: usize,
    }

    impl DelayEngine {
        fn new(channels: usize, delay: usize) -> Self {
            Self {
                line: std::iter::repeat_n(0.0, delay * channels).collect(),
                channels,
                delay,
            }
        }
    }

    impl StretchEngine for DelayEngine {
        fn input_latency(&self) -> usize {
            self.delay
        }
        fn output_latency(&self) -> usize {
            0
        }
        fn process(&mut self, input: &[f32], output: &mut [f32]) {
            self.line.extend(input);
            for s in output.iter_mut() {
                *s = self.line.pop_front().unwrap_or(0.0);
            }
        }
        fn flush(&mut self, output: &mut [f32]) {
            output.fill(0.0);
        }
        fn reset(&mut self) {
            self.line.clear();
            self.line.extend(std::iter::repeat_n(0.0, self.delay * self.channels));
        }
    }

    fn ramp_block(start: usize, frames: usize) -> AudioBlock {
        let ch: Vec<f32> = (start..start + frames).map(|i| i as f32).collect();
        AudioBlock::from_channels(vec![ch.clone(), ch])
    }

    fn feed_ramp(feed: &StretchFeed, chunks: usize, frames: usize, ratio: f64, ref_at: Option<usize>) {
        for c in 0..chunks {
            let mut info = AudioStretchInfo::new(ramp_block(c * frames, frames), ratio);
            info.last = c + 1 == chunks;
            if c == 0 {
                info.ref_pos = ref_at;
            }
            assert!(feed.submit(info));
        }
    }

    fn drain(stretcher: &mut AudioStretcher, chunk: usize) -> (Vec<f32>, Option<usize>) {
        let mut out = Vec::new();
        let mut ref_abs = None;
        loop {
            let got = stretcher.get_stretched_audio(chunk);
            if let Some(r) = got.ref_pos {
                ref_abs = Some(out.len() + r);
            }
            out.extend_from_slice(got.block.channel(0));
            if got.end_of_stream {
                return (out, ref_abs);
            }
        }
    }

    #[test]
    fn unity_ratio_passes_audio_through() {
        let (feed, mut stretcher) = AudioStretcher::new(2, Box::new(DirectEngine::new(2)), 8);
        feed_ramp(&feed, 3, 100, 1.0, Some(30));
        let (out, ref_abs) = drain(&mut stretcher, 128);
        assert_eq!(out.len(), 300);
        assert_eq!(out[299], 299.0);
        assert_eq!(ref_abs, Some(30));
    }

    #[test]
    fn ratio_scales_length_and_reference() {
        let (feed, mut stretcher) = AudioStretcher::new(2, Box::new(DirectEngine::new(2)), 8);
        feed_ramp(&feed, 3, 100, 0.5, Some(30));
        let (out, ref_abs) = drain(&mut stretcher, 64);
        assert_eq!(out.len(), 150);
        assert_eq!(ref_abs, Some(15));
    }

    #[test]
    fn engine_latency_is_removed() {
        let (feed, mut stretcher) = AudioStretcher::new(2, Box::new(DelayEngine::new(2, 10)), 8);
        feed_ramp(&feed, 4, 50, 1.0, None);
        let (out, _) = drain(&mut stretcher, 64);
        let expected: Vec<f32> = (0..200).map(|i| i as f32).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn dropped_feed_ends_stream() {
        let (feed, mut stretcher) = AudioStretcher::new(2, Box::new(DirectEngine::new(2)), 8);
        assert!(feed.submit(AudioStretchInfo::new(ramp_block(0, 40), 1.0)));
        drop(feed);
        let got = stretcher.get_stretched_audio(64);
        assert_eq!(got.block.len(), 40);
        assert!(got.end_of_stream);
    }

    #[test]
    fn latency_rescales_when_ratio_changes() {
        let mut latency = LatencyState::default();
        latency.update_ratio(1.0, 10, 0);
        assert_eq!(latency.pending(), 10);
        latency.discarded = 4;
        latency.update_ratio(2.0, 10, 0);
        assert_eq!(latency.pending(), 12);
    }
}
