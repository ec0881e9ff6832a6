//! Bounded block queue between the producers (request processor, crossfade mixer) and the output.
//!
//! Data path:
//! - `submit_audio_block` smooths the boundary against held-back audio, then releases the oldest
//!   held-back blocks into the delivery queue, blocking while it is full
//! - the output backend calls `render` (real time) or `render_available` (offline), which drains
//!   one block at a time through a [`RenderCursor`]
//!
//! Playback starts in buffering mode and emits nothing until `min_playback_blocks` are queued; an
//! empty queue drops back into buffering mode instead of stuttering block by block.
//!
//! Stopping wakes every waiter, waits until no producer is still inside its wait, and only then
//! clears the held-back audio.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::block::AudioBlock;
use crate::config::SinkConfig;
use crate::error::{SinkError, SinkResult};
use crate::filter::ClickRemovalFilter;
use crate::hold_back::HoldBackQueue;
use crate::output::OutputBackend;
use crate::status::{SinkCounters, SinkStats};

/// Owner of the sink and its output backend.
///
/// `start`/`stop` are meant to be called from one controlling thread; producers and the output use
/// [`SinkHandle`] clones.
pub struct AudioSink {
    core: Arc<SinkCore>,
    backend: Box<dyn OutputBackend>,
}

/// Cloneable producer/consumer view of a sink.
#[derive(Clone)]
pub struct SinkHandle {
    core: Arc<SinkCore>,
}

/// Consumer-side read position: the block currently being played.
#[derive(Debug, Default)]
pub struct RenderCursor {
    current: Option<AudioBlock>,
}

struct SinkCore {
    sample_rate: u32,
    channels: usize,
    min_playback_blocks: usize,
    capacity: usize,
    state: Mutex<SinkState>,
    space_available: Condvar,
    waiters_left: Condvar,
    audio_available: Condvar,
    counters: SinkCounters,
}

struct SinkState {
    queue: VecDeque<AudioBlock>,
    hold_back: HoldBackQueue,
    /// Block that asked for click removal but was too short to smooth on its own.
    pending: Option<AudioBlock>,
    filter: Option<ClickRemovalFilter>,
    running: bool,
    buffering: bool,
    /// Producers are done for now; play out the queue even below the minimum fill level.
    draining: bool,
    waiters: usize,
}

enum Fetch {
    Block(AudioBlock),
    Buffering,
    Underrun,
}

impl AudioSink {
    pub fn new(config: &SinkConfig, backend: Box<dyn OutputBackend>) -> Self {
        let filter = config.click_removal.map(|c| {
            ClickRemovalFilter::new(c.kind, c.time_interval, config.sample_rate)
        });
        let capacity = config.queue_capacity_blocks.max(1);
        let core = SinkCore {
            sample_rate: config.sample_rate,
            channels: config.channels.max(1),
            min_playback_blocks: config.min_playback_blocks.clamp(1, capacity),
            capacity,
            state: Mutex::new(SinkState {
                queue: VecDeque::with_capacity(capacity),
                hold_back: HoldBackQueue::new(),
                pending: None,
                filter,
                running: false,
                buffering: true,
                draining: false,
                waiters: 0,
            }),
            space_available: Condvar::new(),
            waiters_left: Condvar::new(),
            audio_available: Condvar::new(),
            counters: SinkCounters::default(),
        };
        Self {
            core: Arc::new(core),
            backend,
        }
    }

    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            core: self.core.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.state.lock().unwrap().running
    }

    /// Open the output and enter buffering mode.
    pub fn start(&mut self) -> SinkResult<()> {
        {
            let mut st = self.core.state.lock().unwrap();
            if st.running {
                return Err(SinkError::AlreadyRunning);
            }
            st.running = true;
            st.buffering = true;
            st.draining = false;
        }
        if let Err(err) = self.backend.start(self.handle()) {
            self.core.state.lock().unwrap().running = false;
            return Err(SinkError::Backend(err));
        }
        tracing::info!(
            sample_rate = self.core.sample_rate,
            channels = self.core.channels,
            "sink started"
        );
        Ok(())
    }

    /// Stop the output, wake all producers and drop queued audio.
    pub fn stop(&mut self) {
        {
            let mut st = self.core.state.lock().unwrap();
            if !st.running {
                return;
            }
            st.running = false;
        }
        self.core.wake_all();
        self.backend.stop();
        self.core.flush();
        tracing::info!("sink stopped");
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SinkCore {
    fn wake_all(&self) {
        self.space_available.notify_all();
        self.waiters_left.notify_all();
        self.audio_available.notify_all();
    }

    fn flush(&self) {
        let mut st = self.state.lock().unwrap();
        st.queue.clear();
        let mut st = self
            .waiters_left
            .wait_while(st, |s| s.waiters > 0)
            .unwrap();
        st.queue.clear();
        st.hold_back.clear();
        st.pending = None;
        st.buffering = true;
        st.draining = false;
    }

    /// Frames that must stay held back so the next boundary can still be smoothed.
    fn keep_frames(st: &SinkState) -> usize {
        st.filter
            .as_ref()
            .map(ClickRemovalFilter::samples_needed_left)
            .unwrap_or(0)
    }

    /// Release held-back blocks while more than `keep` frames would remain.
    fn release<'a>(
        &'a self,
        mut st: MutexGuard<'a, SinkState>,
        keep: usize,
    ) -> MutexGuard<'a, SinkState> {
        while st.hold_back.block_count() > 0 && st.hold_back.total_len_without_front() >= keep {
            let Some(block) = st.hold_back.remove() else {
                break;
            };
            st = self.enqueue(st, block);
            if !st.running {
                break;
            }
        }
        st
    }

    /// Push one block into the delivery queue, waiting for space.
    fn enqueue<'a>(
        &'a self,
        mut st: MutexGuard<'a, SinkState>,
        block: AudioBlock,
    ) -> MutexGuard<'a, SinkState> {
        while st.running && st.queue.len() >= self.capacity {
            st.waiters += 1;
            st = self.space_available.wait(st).unwrap();
            st.waiters -= 1;
            if st.waiters == 0 {
                self.waiters_left.notify_all();
            }
        }
        if !st.running {
            return st;
        }
        self.counters.add_released(block.len());
        st.queue.push_back(block);
        self.audio_available.notify_all();
        st
    }

    /// Consumer side: next block to play, honouring buffering mode.
    fn next_block(&self) -> Fetch {
        let Ok(mut st) = self.state.lock() else {
            return Fetch::Buffering;
        };
        if !st.running {
            return Fetch::Buffering;
        }
        if st.buffering {
            let enough = st.queue.len() >= self.min_playback_blocks
                || (st.draining && !st.queue.is_empty());
            if !enough {
                return Fetch::Buffering;
            }
            st.buffering = false;
        }
        match st.queue.pop_front() {
            Some(block) => {
                self.space_available.notify_all();
                Fetch::Block(block)
            }
            None => {
                st.buffering = true;
                if st.draining {
                    Fetch::Buffering
                } else {
                    tracing::debug!("sink underrun, buffering");
                    Fetch::Underrun
                }
            }
        }
    }
}

impl SinkHandle {
    pub fn sample_rate(&self) -> u32 {
        self.core.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.core.channels
    }

    /// Queue a block for playback, blocking while the delivery queue is full.
    ///
    /// Blocks submitted while the sink is stopped are dropped. A block flagged with
    /// `remove_click` has its boundary with the previously submitted audio smoothed first.
    pub fn submit_audio_block(&self, block: AudioBlock) {
        if block.is_empty() {
            return;
        }
        let core = &self.core;
        let mut st = core.state.lock().unwrap();
        if !st.running {
            return;
        }
        st.draining = false;

        let mut block = block;
        if let Some(mut pending) = st.pending.take() {
            pending.append(&block);
            block = pending;
        }

        if block.remove_click() {
            let state = &mut *st;
            if let Some(filter) = &state.filter {
                let ready = filter.ready_flags(state.hold_back.total_len(), block.len());
                if ready.left() && !ready.right() {
                    state.pending = Some(block);
                    return;
                }
                if ready.both() {
                    filter.apply(&mut state.hold_back, &mut block);
                }
            }
            block.set_remove_click(false);
        }

        st.hold_back.add(block);
        let keep = SinkCore::keep_frames(&st);
        drop(core.release(st, keep));
    }

    /// Push everything still held back into the delivery queue and let the output play the queue
    /// out below the minimum fill level.
    pub fn release_held_back(&self) {
        let core = &self.core;
        let mut st = core.state.lock().unwrap();
        if !st.running {
            return;
        }
        if let Some(mut pending) = st.pending.take() {
            pending.set_remove_click(false);
            st.hold_back.add(pending);
        }
        let mut st = core.release(st, 0);
        if st.running {
            st.draining = true;
            core.audio_available.notify_all();
        }
    }

    /// Wait until everything released so far has been played. Returns `false` on timeout.
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        let core = &self.core;
        let deadline = Instant::now() + timeout;
        let mut st = core.state.lock().unwrap();
        loop {
            let played = core.counters.played_frames.load(Ordering::Relaxed);
            let released = core.counters.released_frames.load(Ordering::Relaxed);
            if !st.running
                || (st.queue.is_empty()
                    && st.hold_back.is_empty()
                    && st.pending.is_none()
                    && played >= released)
            {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(Duration::from_millis(50));
            st = core.space_available.wait_timeout(st, wait).unwrap().0;
        }
    }

    /// Wait until the output could take a block. Returns `false` on timeout or when stopped.
    pub fn wait_for_audio(&self, timeout: Duration) -> bool {
        let core = &self.core;
        let st = core.state.lock().unwrap();
        let (st, _) = core
            .audio_available
            .wait_timeout_while(st, timeout, |s| {
                s.running
                    && !(s.queue.len() >= core.min_playback_blocks
                        || (!s.buffering && !s.queue.is_empty())
                        || (s.draining && !s.queue.is_empty()))
            })
            .unwrap();
        st.running && !st.queue.is_empty()
    }

    /// Fill `out` (interleaved, `out_channels` wide) for a real-time callback.
    ///
    /// Frames that cannot be served are zero-filled. Returns the number of real frames written.
    pub fn render(&self, cursor: &mut RenderCursor, out: &mut [f32], out_channels: usize) -> usize {
        let (filled, last) = self.fill(cursor, out, out_channels);
        let frames = out.len() / out_channels.max(1);
        if filled < frames {
            out[filled * out_channels..].fill(0.0);
            if let Some(Fetch::Underrun) = last {
                self.core.counters.add_underrun(frames - filled);
            }
        }
        self.core.counters.add_played(filled);
        filled
    }

    /// Like [`render`](Self::render) but without padding: returns as soon as nothing is playable.
    pub fn render_available(
        &self,
        cursor: &mut RenderCursor,
        out: &mut [f32],
        out_channels: usize,
    ) -> usize {
        let (filled, _) = self.fill(cursor, out, out_channels);
        self.core.counters.add_played(filled);
        filled
    }

    fn fill(
        &self,
        cursor: &mut RenderCursor,
        out: &mut [f32],
        out_channels: usize,
    ) -> (usize, Option<Fetch>) {
        let out_channels = out_channels.max(1);
        let frames = out.len() / out_channels;
        let mut filled = 0;
        while filled < frames {
            if cursor.current.as_ref().is_none_or(AudioBlock::at_end) {
                match self.core.next_block() {
                    Fetch::Block(block) => cursor.current = Some(block),
                    other => {
                        cursor.current = None;
                        return (filled, Some(other));
                    }
                }
            }
            let Some(block) = cursor.current.as_mut() else {
                break;
            };
            let n = (frames - filled).min(block.remaining());
            let start = block.read_pos();
            for i in 0..n {
                let frame = &mut out[(filled + i) * out_channels..(filled + i + 1) * out_channels];
                for (dst_ch, sample) in frame.iter_mut().enumerate() {
                    *sample = mapped_sample(block, start + i, out_channels, dst_ch);
                }
            }
            block.set_read_pos(start + n);
            filled += n;
        }
        (filled, None)
    }

    pub fn stats(&self) -> SinkStats {
        let st = self.core.state.lock().unwrap();
        SinkStats::snapshot(
            &self.core.counters,
            self.core.sample_rate,
            self.core.channels,
            st.queue.len(),
            st.buffering,
        )
    }

    pub fn is_running(&self) -> bool {
        self.core.state.lock().unwrap().running
    }
}

/// Read one output sample for `dst_ch`, mapping mono<->stereo and clamping other layouts.
fn mapped_sample(block: &AudioBlock, frame: usize, dst_channels: usize, dst_ch: usize) -> f32 {
    let src_channels = block.channel_count();
    let get = |ch: usize| block.channel(ch).get(frame).copied().unwrap_or(0.0);
    match (src_channels, dst_channels) {
        (0, _) => 0.0,
        (2, 1) => 0.5 * (get(0) + get(1)),
        (1, _) => get(0),
        _ => get(dst_ch.min(src_channels - 1)),
    }
}
