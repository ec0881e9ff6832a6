//! Dual-stream crossfade engine.
//!
//! A started crossfade runs three threads:
//! - the fade-out feeder chunks the outgoing track from the split point onwards
//! - the fade-in feeder seeks the incoming track to its fade start and does the same
//! - the mixer pulls both stretched streams, lines them up on a common reference point and sums
//!   them into the sink
//!
//! Each feeder tags the chunk where its progress passes the reference percent (`ref`) and the chunk
//! where the other stream joins (`comp`). The stretcher carries those tags into stretched output
//! coordinates, so the mixer can align the streams sample-accurately whatever the stretch ratios.
//!
//! The incoming track rarely seeks exactly to the requested time. Its feeder reports how much
//! progress the overshoot already covers (`percent padding`); the fade-out feeder waits for that
//! before it knows where the incoming stream begins.

use std::mem;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::block::AudioBlock;
use crate::config::CrossfadeSettings;
use crate::crossfade::beatgrid::FadeRole;
use crate::crossfade::calculator::{CalculatorChoice, CrossfadeCalculator, EPSILON};
use crate::crossfade::fade_map::FadeMap;
use crate::decode::Decoder;
use crate::sink::SinkHandle;
use crate::stretch::{
    AudioStretchInfo, AudioStretcher, DirectEngine, SignalsmithEngine, StretchEngine, StretchFeed,
};

/// Stretch infos queued per stream before a feeder blocks.
const STRETCH_QUEUE_CAPACITY: usize = 8;

/// One-shot value passed between crossfade threads.
struct Handshake<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T: Copy> Handshake<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn publish(&self, value: T) {
        *self.value.lock().unwrap() = Some(value);
        self.ready.notify_all();
    }

    /// Publish `value` unless a value was published already.
    fn publish_if_empty(&self, value: T) {
        let mut guard = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(value);
        }
        drop(guard);
        self.ready.notify_all();
    }

    fn wait(&self) -> T {
        let mut guard = self.value.lock().unwrap();
        loop {
            if let Some(value) = *guard {
                return value;
            }
            guard = self.ready.wait(guard).unwrap();
        }
    }
}

/// Shared state of one running crossfade.
struct FadeSync {
    /// Progress already covered by the incoming track's seek overshoot.
    percent_padding: Handshake<f64>,
    /// The incoming stream carries a marker for where the outgoing stream's reference lies.
    file2_has_comp: Handshake<bool>,
}

impl FadeSync {
    fn new() -> Self {
        Self {
            percent_padding: Handshake::new(),
            file2_has_comp: Handshake::new(),
        }
    }
}

/// Held by the fade-in feeder: however it exits, the other threads get an answer.
struct ReleaseOnExit<'a>(&'a FadeSync);

impl Drop for ReleaseOnExit<'_> {
    fn drop(&mut self) {
        self.0.percent_padding.publish_if_empty(0.0);
        self.0.file2_has_comp.publish_if_empty(false);
    }
}

/// Crossfade between two tracks, eligible and ready to start.
pub struct Crossfader {
    calc: Arc<CrossfadeCalculator>,
    settings: CrossfadeSettings,
}

impl Crossfader {
    /// Choose a calculator for the pair. `None` means the tracks play back to back.
    pub fn new(
        settings: CrossfadeSettings,
        fade_out: (&Path, f64),
        fade_in: (&Path, f64),
    ) -> Option<Self> {
        let choice = CalculatorChoice {
            normal_enabled: settings.normal_enabled,
            dj_enabled: settings.dj_enabled,
            crossfade_time: settings.duration,
            optimistic_tempo: settings.optimistic_tempo,
        };
        let calc = CrossfadeCalculator::choose(choice, fade_out.0, fade_out.1, fade_in.0, fade_in.1)?;
        tracing::info!(
            from = %fade_out.0.display(),
            to = %fade_in.0.display(),
            kind = calc.label(),
            starts_at = calc.time_at_start_of_fade_out(),
            "crossfade prepared"
        );
        Some(Self {
            calc: Arc::new(calc),
            settings,
        })
    }

    pub fn calculator(&self) -> &CrossfadeCalculator {
        &self.calc
    }

    /// Outgoing track time where the crossfade begins.
    pub fn fade_out_start(&self) -> f64 {
        self.calc.time_at_start_of_fade_out()
    }

    pub fn ready_to_crossfade(&self, position: f64) -> bool {
        position >= self.fade_out_start()
    }

    /// Spawn the feeder and mixer threads.
    ///
    /// `tail` is the outgoing audio starting at track time `tail_start_time` (at or after
    /// [`fade_out_start`](Self::fade_out_start)); `fade_in` must already be open.
    pub fn start(
        self,
        tail: AudioBlock,
        tail_start_time: f64,
        fade_out: Box<dyn Decoder>,
        fade_in: Box<dyn Decoder>,
        sink: SinkHandle,
    ) -> CrossfadeSession {
        let channels = sink.channels();
        let sample_rate = sink.sample_rate();
        let calc = self.calc;

        let (out_feed, out_stretcher) =
            AudioStretcher::new(channels, make_engine(&calc, channels, sample_rate), STRETCH_QUEUE_CAPACITY);
        let (in_feed, in_stretcher) =
            AudioStretcher::new(channels, make_engine(&calc, channels, sample_rate), STRETCH_QUEUE_CAPACITY);

        // Progress of the outgoing track at the first sample of `tail`.
        let fade_out_time = calc.time_at_start_of_fade_out();
        let lead = (tail_start_time - fade_out_time).max(0.0);
        let out_start = calc.fade_out_percentage()
            + calc
                .percentage_change(FadeRole::FadeOut, calc.fade_out_percentage(), fade_out_time, lead)
                .change;

        let sync = Arc::new(FadeSync::new());

        let feeder = |role, feed| Feeder {
            calc: calc.clone(),
            role,
            fade_map: self.settings.fade_map,
            sample_rate: sample_rate as f64,
            chunk_frames: self.settings.chunk_frames.max(1),
            channels,
            feed,
            progress: None,
        };
        let out_feeder = feeder(FadeRole::FadeOut, out_feed);
        let mut in_feeder = feeder(FadeRole::FadeIn, in_feed);
        let (progress, positions) = unbounded();
        in_feeder.progress = Some(progress);

        let out_sync = sync.clone();
        let fade_out = thread::spawn(move || {
            run_fade_out(out_feeder, fade_out, tail, tail_start_time, out_start, &out_sync)
        });

        let in_sync = sync.clone();
        let fade_in = thread::spawn(move || run_fade_in(in_feeder, fade_in, out_start, &in_sync));

        let fade_in_start = calc.fade_in_percentage();
        let chunk_frames = self.settings.chunk_frames.max(1);
        let mixer = thread::spawn(move || {
            let s1 = MixStream::new("fade-out", out_stretcher, channels, chunk_frames);
            let s2 = MixStream::new("fade-in", in_stretcher, channels, chunk_frames);
            let join_percent = fade_in_start + sync.percent_padding.wait();
            let expect_comp1 = join_percent > out_start + EPSILON;
            let file2_has_comp = sync.file2_has_comp.wait();
            mix(s1, s2, expect_comp1, file2_has_comp, &sink)
        });

        CrossfadeSession {
            fade_out,
            fade_in,
            mixer,
            positions,
        }
    }
}

fn make_engine(calc: &CrossfadeCalculator, channels: usize, sample_rate: u32) -> Box<dyn StretchEngine> {
    if calc.uses_time_stretch() {
        Box::new(SignalsmithEngine::new(channels, sample_rate))
    } else {
        Box::new(DirectEngine::new(channels))
    }
}

/// Handles of a running crossfade.
pub struct CrossfadeSession {
    fade_out: JoinHandle<()>,
    fade_in: JoinHandle<(AudioBlock, Box<dyn Decoder>)>,
    mixer: JoinHandle<usize>,
    positions: Receiver<f64>,
}

impl CrossfadeSession {
    /// Incoming track time after each chunk its feeder hands over. Ends when the feeder is done.
    pub fn positions(&self) -> crossbeam_channel::Iter<'_, f64> {
        self.positions.iter()
    }

    /// Wait for all three threads.
    ///
    /// Returns the incoming track's audio past the end of the fade together with its decoder, or
    /// `None` if the fade-in thread panicked.
    pub fn join(self) -> Option<(AudioBlock, Box<dyn Decoder>)> {
        match self.mixer.join() {
            Ok(frames) => tracing::debug!(frames, "crossfade mixed"),
            Err(_) => tracing::error!("crossfade mixer panicked"),
        }
        if self.fade_out.join().is_err() {
            tracing::error!("fade-out feeder panicked");
        }
        match self.fade_in.join() {
            Ok(result) => Some(result),
            Err(_) => {
                tracing::error!("fade-in feeder panicked");
                None
            }
        }
    }
}

fn run_fade_out(
    feeder: Feeder,
    mut decoder: Box<dyn Decoder>,
    tail: AudioBlock,
    tail_start_time: f64,
    start_percent: f64,
    sync: &FadeSync,
) {
    let join_percent = feeder.calc.fade_in_percentage() + sync.percent_padding.wait();
    let comp = (join_percent > start_percent + EPSILON).then_some(join_percent);

    let mut source = ChunkSource::new(tail, decoder.as_mut(), feeder.channels);
    feeder.run(&mut source, start_percent, tail_start_time, Some(start_percent), comp);
}

fn run_fade_in(
    feeder: Feeder,
    mut decoder: Box<dyn Decoder>,
    fade_out_start: f64,
    sync: &FadeSync,
) -> (AudioBlock, Box<dyn Decoder>) {
    let _release = ReleaseOnExit(sync);
    let calc = feeder.calc.clone();
    let fade_in_time = calc.time_at_start_of_fade_in();
    let start_percent = calc.fade_in_percentage();

    if !decoder.seek(fade_in_time) {
        tracing::warn!(path = %decoder.path().display(), time = fade_in_time, "fade-in seek failed");
    }
    let position = decoder.position();
    let overshoot = (position - fade_in_time).max(0.0);
    let padding = if overshoot > 0.0 {
        calc.percentage_change(FadeRole::FadeIn, start_percent, fade_in_time, overshoot)
            .change
    } else {
        0.0
    };
    let join_percent = start_percent + padding;
    let has_comp = fade_out_start > join_percent + EPSILON;
    tracing::debug!(overshoot, padding, has_comp, "fade-in positioned");
    sync.percent_padding.publish(padding);
    sync.file2_has_comp.publish(has_comp);

    let channels = feeder.channels;
    let leftover = {
        let mut source = ChunkSource::new(AudioBlock::new(channels), decoder.as_mut(), channels);
        feeder.run(
            &mut source,
            join_percent,
            position,
            Some(join_percent),
            has_comp.then_some(fade_out_start),
        );
        source.into_rest()
    };
    (leftover, decoder)
}

/// Hands out fixed-size chunks from a leading block followed by a decoder's output.
struct ChunkSource<'a> {
    current: AudioBlock,
    decoder: &'a mut dyn Decoder,
}

impl<'a> ChunkSource<'a> {
    fn new(mut first: AudioBlock, decoder: &'a mut dyn Decoder, channels: usize) -> Self {
        if first.channel_count() == 0 {
            first = AudioBlock::new(channels);
        }
        first.set_read_pos(0);
        Self {
            current: first,
            decoder,
        }
    }

    /// Up to `frames` frames; shorter only at end of track, empty once exhausted.
    fn next_chunk(&mut self, frames: usize) -> AudioBlock {
        while self.current.len() < frames {
            let block = self.decoder.next_block();
            if block.is_empty() {
                break;
            }
            self.current.append(&block);
        }
        let take = frames.min(self.current.len());
        self.current.split_backwards(take)
    }

    fn push_front(&mut self, mut block: AudioBlock) {
        block.append(&self.current);
        self.current = block;
    }

    fn into_rest(self) -> AudioBlock {
        self.current
    }
}

/// Chunks one track into stretch infos until its part of the fade is over.
struct Feeder {
    calc: Arc<CrossfadeCalculator>,
    role: FadeRole,
    fade_map: FadeMap,
    sample_rate: f64,
    chunk_frames: usize,
    channels: usize,
    feed: StretchFeed,
    /// Receives the track time after every chunk.
    progress: Option<Sender<f64>>,
}

impl Feeder {
    fn gain(&self, percent: f64) -> f32 {
        self.fade_map
            .map(self.calc.volume(self.role, percent.clamp(0.0, 1.0)))
            .clamp(0.0, 1.0) as f32
    }

    fn frames_for(&self, percent: f64, change: f64) -> usize {
        let secs = self.calc.original_time_change(self.role, percent, change);
        (secs * self.sample_rate).round().max(0.0) as usize
    }

    /// Frame inside a chunk spanning `[percent, percent + change)` where `target` lies, if the
    /// chunk reaches it. The final chunk takes any marker not placed yet.
    fn marker_offset(&self, target: f64, percent: f64, change: f64, len: usize, last: bool) -> Option<usize> {
        if target >= percent + change && !last {
            return None;
        }
        if target <= percent {
            return Some(0);
        }
        Some(self.frames_for(percent, target - percent).min(len))
    }

    /// Feed chunks starting at progress `percent` and track time `time`. Audio past the end of
    /// the fade is left in `source`.
    fn run(
        &self,
        source: &mut ChunkSource<'_>,
        mut percent: f64,
        mut time: f64,
        mut ref_target: Option<f64>,
        mut comp_target: Option<f64>,
    ) {
        loop {
            let mut chunk = source.next_chunk(self.chunk_frames);
            if chunk.is_empty() {
                tracing::debug!(role = self.role.label(), percent, "track ended inside the fade");
                let mut info = AudioStretchInfo::new(AudioBlock::new(self.channels), 1.0);
                info.last = true;
                info.ref_pos = ref_target.map(|_| 0);
                info.comp_ref_pos = comp_target.map(|_| 0);
                self.feed.submit(info);
                return;
            }

            let dt = chunk.len() as f64 / self.sample_rate;
            let step = self.calc.percentage_change(self.role, percent, time, dt);
            let mut change = step.change;
            let mut next_time = step.new_time;
            if step.done {
                change = (1.0 - percent).max(0.0);
                let cut = self.frames_for(percent, change).min(chunk.len());
                source.push_front(chunk.split(cut));
                next_time = time + cut as f64 / self.sample_rate;
            }

            chunk.apply_gain_ramp(self.gain(percent), self.gain(percent + change));
            let len = chunk.len();
            let mut info = AudioStretchInfo::new(chunk, self.calc.stretch_factor(self.role, percent));
            info.last = step.done;
            if let Some(pos) =
                ref_target.and_then(|t| self.marker_offset(t, percent, change, len, step.done))
            {
                info.ref_pos = Some(pos);
                ref_target = None;
            }
            if let Some(pos) =
                comp_target.and_then(|t| self.marker_offset(t, percent, change, len, step.done))
            {
                info.comp_ref_pos = Some(pos);
                comp_target = None;
            }

            if !self.feed.submit(info) {
                tracing::debug!(role = self.role.label(), "mixer went away");
                return;
            }
            if let Some(progress) = &self.progress {
                let _ = progress.send(next_time);
            }
            percent += change;
            time = next_time;
            if step.done {
                return;
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Marker {
    Ref,
    Comp,
}

/// Mixer-side view of one stretched stream.
struct MixStream {
    name: &'static str,
    stretcher: AudioStretcher,
    pending: AudioBlock,
    ref_pos: Option<usize>,
    comp_pos: Option<usize>,
    eos: bool,
    chunk_frames: usize,
}

impl MixStream {
    fn new(name: &'static str, stretcher: AudioStretcher, channels: usize, chunk_frames: usize) -> Self {
        Self {
            name,
            stretcher,
            pending: AudioBlock::new(channels),
            ref_pos: None,
            comp_pos: None,
            eos: false,
            chunk_frames,
        }
    }

    /// Pull one chunk into `pending`. `false` once the stream has ended.
    fn fetch(&mut self) -> bool {
        if self.eos {
            return false;
        }
        let chunk = self.stretcher.get_stretched_audio(self.chunk_frames);
        let base = self.pending.len();
        if let Some(pos) = chunk.ref_pos {
            self.ref_pos.get_or_insert(base + pos);
        }
        if let Some(pos) = chunk.comp_ref_pos {
            self.comp_pos.get_or_insert(base + pos);
        }
        self.eos = chunk.end_of_stream;
        self.pending.append(&chunk.block);
        true
    }

    /// Frame in `pending` where `marker` lies, fetching as needed.
    fn locate(&mut self, marker: Marker) -> Option<usize> {
        loop {
            let found = match marker {
                Marker::Ref => self.ref_pos,
                Marker::Comp => self.comp_pos,
            };
            if found.is_some() {
                return found;
            }
            if !self.fetch() {
                tracing::warn!(stream = self.name, ?marker, "stream ended without marker");
                return None;
            }
        }
    }

    fn take(&mut self, frames: usize) -> AudioBlock {
        let rest = self.pending.split(frames);
        let head = mem::replace(&mut self.pending, rest);
        self.ref_pos = self.ref_pos.and_then(|p| p.checked_sub(frames));
        self.comp_pos = self.comp_pos.and_then(|p| p.checked_sub(frames));
        head
    }

    fn take_all(&mut self) -> AudioBlock {
        self.take(self.pending.len())
    }

    /// Make sure `pending` has material unless the stream is over.
    fn refill(&mut self) {
        while self.pending.is_empty() && self.fetch() {}
    }
}

/// Submits mixer output; the first block is click-filtered against what the sink played before.
struct Emitter<'a> {
    sink: &'a SinkHandle,
    frames: usize,
}

impl Emitter<'_> {
    fn emit(&mut self, mut block: AudioBlock) {
        if block.is_empty() {
            return;
        }
        block.set_remove_click(self.frames == 0);
        self.frames += block.len();
        self.sink.submit_audio_block(block);
    }
}

/// Align the two streams and sum them into the sink. Returns the number of frames emitted.
fn mix(
    mut s1: MixStream,
    mut s2: MixStream,
    expect_comp1: bool,
    file2_has_comp: bool,
    sink: &SinkHandle,
) -> usize {
    let mut out = Emitter { sink, frames: 0 };

    // Nothing before either reference point is part of the fade.
    for stream in [&mut s1, &mut s2] {
        if let Some(pos) = stream.locate(Marker::Ref) {
            let skipped = stream.take(pos);
            if !skipped.is_empty() {
                tracing::debug!(stream = stream.name, frames = skipped.len(), "skipped lead-in");
            }
        }
    }

    if expect_comp1 && !file2_has_comp {
        // Outgoing stream plays alone until the incoming one joins.
        match s1.locate(Marker::Comp) {
            Some(pos) => out.emit(s1.take(pos)),
            None => out.emit(s1.take_all()),
        }
    } else if file2_has_comp {
        if let Some(pos) = s2.locate(Marker::Comp) {
            let skipped = s2.take(pos);
            tracing::debug!(frames = skipped.len(), "incoming stream starts before the fade");
        }
    }

    s1.refill();
    s2.refill();
    if !s1.pending.is_empty() && !s2.pending.is_empty() {
        let mut a = s1.take_all();
        let mut b = s2.take_all();
        let overlap = a.overlap(&mut b, 0);
        out.emit(overlap.merged);
        if overlap.embedded {
            s1.pending = b;
        } else {
            s2.pending = b;
        }
    }

    loop {
        s1.refill();
        s2.refill();
        let n = s1.pending.len().min(s2.pending.len());
        if n == 0 {
            break;
        }
        let mut block = s1.take(n);
        block.merge(&s2.take(n));
        out.emit(block);
    }

    // Whichever stream outlasts the other continues alone.
    for stream in [&mut s1, &mut s2] {
        loop {
            let rest = stream.take_all();
            out.emit(rest);
            if !stream.fetch() {
                break;
            }
        }
    }

    out.frames
}
