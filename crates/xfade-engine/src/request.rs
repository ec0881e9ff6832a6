//! Request processor: the playback state machine.
//!
//! One worker thread pops [`AudioRequest`]s, opens a decoder for each and pushes its blocks into
//! the sink. While a track plays, the request at the front of the deque is checked as a crossfade
//! candidate as soon as it appears; once the current position reaches the candidate's fade start,
//! the request is popped, the current block is split at the exact fade start and a
//! [`Crossfader`] takes over both tracks. When it finishes, playback continues on the incoming
//! decoder with the audio the fade left over.
//!
//! Failures never stop the worker: an ineligible pair plays back to back, and a request whose file
//! cannot be opened is skipped.

use std::collections::VecDeque;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::block::AudioBlock;
use crate::config::CrossfadeSettings;
use crate::crossfade::{Crossfader, FadeMap};
use crate::decode::{Decoder, DecoderFactory};
use crate::sink::{AudioSink, SinkHandle};
use crate::status::TrackStatus;

/// A queued file. Ids tell repeated requests for the same file apart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioRequest {
    pub id: u64,
    pub path: PathBuf,
}

/// Notifications from the worker thread. Both hooks default to doing nothing.
pub trait PlaybackListener: Send + Sync {
    /// A new track became current.
    fn on_metadata_loaded(&self, _status: &TrackStatus) {}
    /// Called after every decoded block of the current track.
    fn on_position_update(&self, _status: &TrackStatus) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default)]
pub struct NullListener;

impl PlaybackListener for NullListener {}

struct QueueState {
    requests: VecDeque<AudioRequest>,
    running: bool,
    terminate: bool,
    /// A track is being played or opened.
    busy: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    changed: Condvar,
    settings: Mutex<CrossfadeSettings>,
    next_id: AtomicU64,
}

pub struct RequestQueue {
    shared: Arc<Shared>,
    sink: SinkHandle,
    factory: Arc<dyn DecoderFactory>,
    listener: Arc<dyn PlaybackListener>,
    worker: Option<JoinHandle<()>>,
}

impl RequestQueue {
    pub fn new(
        sink: SinkHandle,
        factory: Arc<dyn DecoderFactory>,
        listener: Arc<dyn PlaybackListener>,
        settings: CrossfadeSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    requests: VecDeque::new(),
                    running: false,
                    terminate: false,
                    busy: false,
                }),
                changed: Condvar::new(),
                settings: Mutex::new(settings),
                next_id: AtomicU64::new(1),
            }),
            sink,
            factory,
            listener,
            worker: None,
        }
    }

    fn request(&self, path: &Path) -> AudioRequest {
        AudioRequest {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
        }
    }

    /// Queue `path` after everything already queued.
    pub fn play(&self, path: impl AsRef<Path>) -> u64 {
        let request = self.request(path.as_ref());
        let id = request.id;
        tracing::debug!(id, path = %request.path.display(), "queued");
        self.shared.state.lock().unwrap().requests.push_back(request);
        self.shared.changed.notify_all();
        id
    }

    /// Queue `path` ahead of everything else.
    pub fn play_next(&self, path: impl AsRef<Path>) -> u64 {
        let request = self.request(path.as_ref());
        let id = request.id;
        tracing::debug!(id, path = %request.path.display(), "queued next");
        self.shared.state.lock().unwrap().requests.push_front(request);
        self.shared.changed.notify_all();
        id
    }

    /// Snapshot of the requests not yet started.
    pub fn pending(&self) -> Vec<AudioRequest> {
        self.shared.state.lock().unwrap().requests.iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().unwrap().running
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        let st = self.shared.state.lock().unwrap();
        !st.busy && st.requests.is_empty()
    }

    pub fn start_request_processor(&mut self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.running {
                tracing::debug!("request processor already running");
                return;
            }
            st.running = true;
            st.terminate = false;
        }
        let worker = Worker {
            shared: self.shared.clone(),
            sink: self.sink.clone(),
            factory: self.factory.clone(),
            listener: self.listener.clone(),
        };
        self.worker = Some(thread::spawn(move || worker.run()));
        tracing::info!("request processor started");
    }

    /// Ask the worker to finish and join it.
    ///
    /// A worker blocked on a full sink only returns once the output makes room; use
    /// [`stop_request_processor_and_sink`](Self::stop_request_processor_and_sink) to unblock it.
    pub fn stop_request_processor(&mut self) {
        self.shared.state.lock().unwrap().terminate = true;
        self.shared.changed.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("request processor panicked");
            }
        }
        let mut st = self.shared.state.lock().unwrap();
        st.running = false;
        st.busy = false;
        drop(st);
        self.shared.changed.notify_all();
    }

    /// Stop the sink first so a producer blocked on it wakes up, then stop the worker.
    pub fn stop_request_processor_and_sink(&mut self, sink: &mut AudioSink) {
        sink.stop();
        self.stop_request_processor();
    }

    /// Block until the deque is empty (the last request may still be playing).
    pub fn wait_for_empty_queue(&self) {
        let st = self.shared.state.lock().unwrap();
        let _st = self
            .shared
            .changed
            .wait_while(st, |s| s.running && !s.terminate && !s.requests.is_empty())
            .unwrap();
    }

    /// Block until the deque is empty and no track is in flight.
    pub fn wait_for_idle(&self) {
        let st = self.shared.state.lock().unwrap();
        let _st = self
            .shared
            .changed
            .wait_while(st, |s| {
                s.running && !s.terminate && (s.busy || !s.requests.is_empty())
            })
            .unwrap();
    }

    pub fn settings(&self) -> CrossfadeSettings {
        *self.shared.settings.lock().unwrap()
    }

    pub fn set_normal_xfade_enabled(&self, enabled: bool) {
        self.shared.settings.lock().unwrap().normal_enabled = enabled;
    }

    pub fn set_dj_xfade_enabled(&self, enabled: bool) {
        self.shared.settings.lock().unwrap().dj_enabled = enabled;
    }

    pub fn set_xfade_duration(&self, seconds: f64) {
        self.shared.settings.lock().unwrap().duration = seconds.max(0.0);
    }

    pub fn set_optimistic_tempo_adaptation(&self, optimistic: bool) {
        self.shared.settings.lock().unwrap().optimistic_tempo = optimistic;
    }

    pub fn set_fade_map(&self, fade_map: FadeMap) {
        self.shared.settings.lock().unwrap().fade_map = fade_map;
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop_request_processor();
        }
    }
}

/// Next request, loaded and eligible for a crossfade from the current track.
struct Candidate {
    request: AudioRequest,
    fader: Crossfader,
}

/// Incoming track after a crossfade, with the audio the fade did not use.
struct Continuation {
    decoder: Box<dyn Decoder>,
    leftover: AudioBlock,
}

struct Worker {
    shared: Arc<Shared>,
    sink: SinkHandle,
    factory: Arc<dyn DecoderFactory>,
    listener: Arc<dyn PlaybackListener>,
}

impl Worker {
    fn run(self) {
        let mut carried: Option<Continuation> = None;
        loop {
            let next = match carried.take() {
                Some(next) => Some(next),
                None => {
                    let Some(request) = self.next_request() else {
                        break;
                    };
                    self.open(&request).map(|decoder| {
                        self.announce(decoder.as_ref());
                        Continuation {
                            decoder,
                            leftover: AudioBlock::new(self.sink.channels()),
                        }
                    })
                }
            };
            if let Some(next) = next {
                carried = self.play_track(next);
            }
        }
        tracing::info!("request processor stopped");
    }

    fn terminating(&self) -> bool {
        self.shared.state.lock().unwrap().terminate
    }

    /// Pop the next request, waiting while the deque is empty. `None` on termination.
    fn next_request(&self) -> Option<AudioRequest> {
        let mut st = self.shared.state.lock().unwrap();
        if st.requests.is_empty() && !st.terminate {
            drop(st);
            // Nothing follows: let the sink play out what it still holds back.
            self.sink.release_held_back();
            st = self.shared.state.lock().unwrap();
            st.busy = false;
            self.shared.changed.notify_all();
        }
        let mut st = self
            .shared
            .changed
            .wait_while(st, |s| s.requests.is_empty() && !s.terminate)
            .unwrap();
        if st.terminate {
            return None;
        }
        let request = st.requests.pop_front();
        st.busy = request.is_some();
        drop(st);
        self.shared.changed.notify_all();
        request
    }

    fn front_request(&self) -> Option<AudioRequest> {
        self.shared.state.lock().unwrap().requests.front().cloned()
    }

    /// Pop the front request if it is still `id`.
    fn pop_front_if(&self, id: u64) -> Option<AudioRequest> {
        let mut st = self.shared.state.lock().unwrap();
        if st.requests.front().map(|r| r.id) != Some(id) {
            return None;
        }
        let request = st.requests.pop_front();
        drop(st);
        self.shared.changed.notify_all();
        request
    }

    fn open(&self, request: &AudioRequest) -> Option<Box<dyn Decoder>> {
        let mut decoder = self.factory.create(&request.path);
        match decoder.open() {
            Ok(()) => {
                tracing::info!(
                    path = %request.path.display(),
                    duration_secs = decoder.duration(),
                    "opened track"
                );
                Some(decoder)
            }
            Err(err) => {
                tracing::warn!(path = %request.path.display(), "skipping unplayable track: {err:#}");
                None
            }
        }
    }

    fn status_of(decoder: &dyn Decoder) -> TrackStatus {
        TrackStatus {
            path: decoder.path().to_path_buf(),
            metadata: decoder.metadata().clone(),
            position: decoder.position(),
            duration: decoder.duration(),
        }
    }

    fn announce(&self, decoder: &dyn Decoder) {
        let status = Self::status_of(decoder);
        tracing::info!(
            title = %status.metadata.title,
            artist = %status.metadata.artist,
            "now playing"
        );
        self.listener.on_metadata_loaded(&status);
    }

    /// Probe `request` as the track to crossfade into from `current`.
    fn prepare(&self, current: &dyn Decoder, request: AudioRequest) -> Option<Candidate> {
        let mut lookahead = self.factory.create(&request.path);
        if let Err(err) = lookahead.load_metadata() {
            tracing::debug!(path = %request.path.display(), "no crossfade candidate: {err:#}");
            return None;
        }
        let settings = *self.shared.settings.lock().unwrap();
        let fader = Crossfader::new(
            settings,
            (current.path(), current.duration()),
            (&request.path, lookahead.duration()),
        )?;
        Some(Candidate { request, fader })
    }

    /// Play `track` until it ends or hands over to a crossfade.
    fn play_track(&self, track: Continuation) -> Option<Continuation> {
        let Continuation {
            mut decoder,
            leftover,
        } = track;
        let mut status = Self::status_of(decoder.as_ref());
        // The first audio of every track is smoothed against whatever played before it.
        let mut first = true;
        self.submit(leftover, &mut first);

        let mut candidate: Option<Candidate> = None;
        let mut last_front: Option<u64> = None;

        loop {
            if self.terminating() {
                return None;
            }
            let mut block = decoder.next_block();
            if block.is_empty() {
                tracing::debug!(path = %status.path.display(), "track finished");
                return None;
            }
            status.position = decoder.position();
            self.listener.on_position_update(&status);

            let front = self.front_request();
            let front_id = front.as_ref().map(|r| r.id);
            if front_id != last_front {
                last_front = front_id;
                candidate = front.and_then(|r| self.prepare(decoder.as_ref(), r));
            }

            let position = status.position;
            let Some(Candidate { request, fader }) =
                candidate.take_if(|c| c.fader.ready_to_crossfade(position))
            else {
                self.submit(block, &mut first);
                continue;
            };

            let Some(request) = self.pop_front_if(request.id) else {
                last_front = None;
                self.submit(block, &mut first);
                continue;
            };
            let Some(next) = self.open(&request) else {
                // Keep playing the current track; the new front is checked next block.
                last_front = None;
                self.submit(block, &mut first);
                continue;
            };

            if mem::take(&mut first) {
                block.set_remove_click(true);
            }
            return self.crossfade(fader, decoder, block, status.position, next);
        }
    }

    fn submit(&self, mut block: AudioBlock, first: &mut bool) {
        if block.is_empty() {
            return;
        }
        if mem::take(first) {
            block.set_remove_click(true);
        }
        self.sink.submit_audio_block(block);
    }

    /// Split `block` (ending at track time `position`) at the fade start and run the crossfade.
    fn crossfade(
        &self,
        fader: Crossfader,
        decoder: Box<dyn Decoder>,
        mut block: AudioBlock,
        position: f64,
        next: Box<dyn Decoder>,
    ) -> Option<Continuation> {
        let rate = self.sink.sample_rate() as f64;
        let back_delta = (position - fader.fade_out_start()).max(0.0);
        let back_frames = (back_delta * rate).round() as usize;
        let tail = block.split(block.len().saturating_sub(back_frames));
        let tail_start = position - tail.len() as f64 / rate;
        self.sink.submit_audio_block(block);

        tracing::info!(
            kind = fader.calculator().label(),
            from = %decoder.path().display(),
            to = %next.path().display(),
            at = tail_start,
            "crossfading"
        );
        self.announce(next.as_ref());
        let mut status = Self::status_of(next.as_ref());
        let session = fader.start(tail, tail_start, decoder, next, self.sink.clone());
        for position in session.positions() {
            status.position = position;
            self.listener.on_position_update(&status);
        }
        let (leftover, decoder) = session.join()?;
        Some(Continuation { decoder, leftover })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::config::{ClickRemovalConfig, SinkConfig};
    use crate::crossfade::Beatgrid;
    use crate::decode::{ToneFactory, TrackMetadata};
    use crate::output::{ManualOutput, MemoryOutput};

    const RATE: u32 = 8_000;

    fn sink_config() -> SinkConfig {
        SinkConfig {
            sample_rate: RATE,
            channels: 2,
            min_playback_blocks: 8,
            queue_capacity_blocks: 16,
            frames_per_buffer: 256,
            click_removal: Some(ClickRemovalConfig::default()),
        }
    }

    #[derive(Default)]
    struct Recorder {
        titles: Mutex<Vec<String>>,
        /// `(index of the current track, position)` per update.
        updates: Mutex<Vec<(usize, f64)>>,
    }

    impl Recorder {
        fn updates_for(&self, track: usize) -> Vec<f64> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| *t == track)
                .map(|(_, p)| *p)
                .collect()
        }
    }

    impl PlaybackListener for Recorder {
        fn on_metadata_loaded(&self, status: &TrackStatus) {
            self.titles.lock().unwrap().push(status.metadata.title.clone());
        }
        fn on_position_update(&self, status: &TrackStatus) {
            let track = self.titles.lock().unwrap().len().saturating_sub(1);
            self.updates.lock().unwrap().push((track, status.position));
        }
    }

    /// Queues `path` from inside the worker once the current track reaches `at` seconds.
    struct LateRequest {
        shared: OnceLock<Arc<Shared>>,
        at: f64,
        path: &'static str,
        queued: AtomicBool,
    }

    impl PlaybackListener for LateRequest {
        fn on_position_update(&self, status: &TrackStatus) {
            if status.position < self.at || self.queued.swap(true, Ordering::Relaxed) {
                return;
            }
            let Some(shared) = self.shared.get() else {
                return;
            };
            shared.state.lock().unwrap().requests.push_back(AudioRequest {
                id: shared.next_id.fetch_add(1, Ordering::Relaxed),
                path: PathBuf::from(self.path),
            });
            shared.changed.notify_all();
        }
    }

    /// Decoder whose `open` fails although its metadata loads.
    struct Unopenable(Box<dyn Decoder>);

    impl Decoder for Unopenable {
        fn path(&self) -> &Path {
            self.0.path()
        }
        fn load_metadata(&mut self) -> anyhow::Result<()> {
            self.0.load_metadata()
        }
        fn open(&mut self) -> anyhow::Result<()> {
            anyhow::bail!("device busy")
        }
        fn next_block(&mut self) -> AudioBlock {
            self.0.next_block()
        }
        fn is_done(&self) -> bool {
            self.0.is_done()
        }
        fn seek(&mut self, time: f64) -> bool {
            self.0.seek(time)
        }
        fn position(&self) -> f64 {
            self.0.position()
        }
        fn duration(&self) -> f64 {
            self.0.duration()
        }
        fn metadata(&self) -> &TrackMetadata {
            self.0.metadata()
        }
    }

    struct BrokenAt {
        inner: ToneFactory,
        broken: PathBuf,
    }

    impl DecoderFactory for BrokenAt {
        fn create(&self, path: &Path) -> Box<dyn Decoder> {
            let decoder = self.inner.create(path);
            if path == self.broken {
                Box::new(Unopenable(decoder))
            } else {
                decoder
            }
        }
    }

    /// Constant-level tracks, `(path, level, seconds)`.
    struct Levels(Vec<(&'static str, f32, f64)>);

    struct LevelDecoder {
        path: PathBuf,
        level: f32,
        frame: usize,
        total: usize,
        meta: TrackMetadata,
    }

    impl Decoder for LevelDecoder {
        fn path(&self) -> &Path {
            &self.path
        }
        fn load_metadata(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn open(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn next_block(&mut self) -> AudioBlock {
            let frames = (self.total - self.frame).min(1024);
            self.frame += frames;
            AudioBlock::from_channels(vec![vec![self.level; frames]; 2])
        }
        fn is_done(&self) -> bool {
            self.frame >= self.total
        }
        fn seek(&mut self, time: f64) -> bool {
            self.frame = ((time * RATE as f64).round() as usize).min(self.total);
            true
        }
        fn position(&self) -> f64 {
            self.frame as f64 / RATE as f64
        }
        fn duration(&self) -> f64 {
            self.total as f64 / RATE as f64
        }
        fn metadata(&self) -> &TrackMetadata {
            &self.meta
        }
    }

    impl DecoderFactory for Levels {
        fn create(&self, path: &Path) -> Box<dyn Decoder> {
            let (level, secs) = self
                .0
                .iter()
                .find(|(p, _, _)| Path::new(p) == path)
                .map(|(_, l, s)| (*l, *s))
                .unwrap_or((0.0, 0.0));
            Box::new(LevelDecoder {
                path: path.to_path_buf(),
                level,
                frame: 0,
                total: (secs * RATE as f64) as usize,
                meta: TrackMetadata::default(),
            })
        }
    }

    /// Play `files` to completion into memory; returns the left channel.
    fn render(
        factory: impl DecoderFactory + 'static,
        settings: CrossfadeSettings,
        files: &[&str],
        listener: Arc<dyn PlaybackListener>,
    ) -> Vec<f32> {
        render_with(factory, settings, files, listener, |_| {})
    }

    fn render_with(
        factory: impl DecoderFactory + 'static,
        settings: CrossfadeSettings,
        files: &[impl AsRef<Path>],
        listener: Arc<dyn PlaybackListener>,
        prepare: impl FnOnce(&RequestQueue),
    ) -> Vec<f32> {
        let output = MemoryOutput::new();
        let captured = output.captured();
        let mut sink = AudioSink::new(&sink_config(), Box::new(output));
        sink.start().unwrap();
        let handle = sink.handle();

        let mut queue = RequestQueue::new(handle.clone(), Arc::new(factory), listener, settings);
        prepare(&queue);
        for f in files {
            queue.play(f);
        }
        queue.start_request_processor();
        queue.wait_for_idle();
        assert!(handle.wait_until_drained(Duration::from_secs(10)));
        queue.stop_request_processor_and_sink(&mut sink);

        let samples = captured.lock().unwrap();
        samples.iter().step_by(2).copied().collect()
    }

    fn longest_zero_run(samples: &[f32]) -> usize {
        let mut longest = 0;
        let mut run = 0;
        for s in samples {
            if *s == 0.0 {
                run += 1;
                longest = longest.max(run);
            } else {
                run = 0;
            }
        }
        longest
    }

    #[test]
    fn linear_crossfade_overlaps_two_tones() {
        let factory = ToneFactory::new(RATE, 2)
            .with_tone("a", 440.0, 30.0)
            .with_tone("b", 660.0, 30.0);
        let settings = CrossfadeSettings {
            duration: 5.0,
            ..Default::default()
        };
        let listener = Arc::new(Recorder::default());
        let left = render(factory, settings, &["a", "b"], listener.clone());

        let expected = 55 * RATE as usize;
        let frames = left.len();
        assert!(frames.abs_diff(expected) <= 1024, "rendered {frames} frames");
        assert!(longest_zero_run(&left) < 16);
        assert_eq!(*listener.titles.lock().unwrap(), vec!["440 Hz", "660 Hz"]);
        assert!(!listener.updates_for(0).is_empty());
    }

    #[test]
    fn positions_are_reported_during_crossfade() {
        let factory = ToneFactory::new(RATE, 2)
            .with_tone("a", 440.0, 8.0)
            .with_tone("b", 660.0, 8.0);
        let settings = CrossfadeSettings {
            duration: 5.0,
            ..Default::default()
        };
        let listener = Arc::new(Recorder::default());
        render(factory, settings, &["a", "b"], listener.clone());

        let incoming = listener.updates_for(1);
        let during_fade = incoming.iter().filter(|p| **p <= 5.0 + 1e-6).count();
        // One update per 512-frame chunk of the five-second fade.
        assert!((78..=79).contains(&during_fade), "{during_fade} updates during the fade");
        assert!(incoming.windows(2).all(|w| w[0] < w[1]));
        assert!((incoming.last().copied().unwrap() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn disjoint_track_change_is_smoothed() {
        let factory = Levels(vec![("hi", 0.5, 1.0), ("lo", -0.5, 1.0)]);
        let settings = CrossfadeSettings {
            normal_enabled: false,
            ..Default::default()
        };
        let left = render(factory, settings, &["hi", "lo"], Arc::new(NullListener));

        assert_eq!(left.len(), 2 * RATE as usize);
        let largest_step = left
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0f32, f32::max);
        assert!(largest_step < 0.5, "step of {largest_step} at the track change");
        assert_eq!(left[0], 0.5);
        assert_eq!(*left.last().unwrap(), -0.5);
    }

    #[test]
    fn late_request_joins_the_fade_midway() {
        let factory = ToneFactory::new(RATE, 2)
            .with_tone("a", 440.0, 8.0)
            .with_tone("b", 660.0, 8.0);
        let settings = CrossfadeSettings {
            duration: 5.0,
            ..Default::default()
        };
        // "b" shows up one second after the fade should have started.
        let listener = Arc::new(LateRequest {
            shared: OnceLock::new(),
            at: 4.0,
            path: "b",
            queued: AtomicBool::new(false),
        });
        let left = render_with(factory, settings, &["a"], listener.clone(), |queue| {
            let _ = listener.shared.set(queue.shared.clone());
        });

        // The part of "b" that would have overlapped the missed second is skipped with it.
        let expected = 11 * RATE as usize;
        assert!(left.len().abs_diff(expected) <= 1024, "rendered {} frames", left.len());
        assert!(longest_zero_run(&left) < 16);
    }

    #[test]
    fn next_track_failing_to_open_keeps_current_playing() {
        let factory = BrokenAt {
            inner: ToneFactory::new(RATE, 2)
                .with_tone("a", 440.0, 8.0)
                .with_tone("b", 660.0, 8.0),
            broken: PathBuf::from("b"),
        };
        let settings = CrossfadeSettings {
            duration: 5.0,
            ..Default::default()
        };
        let listener = Arc::new(Recorder::default());
        let left = render(factory, settings, &["a", "b"], listener.clone());

        assert_eq!(left.len(), 8 * RATE as usize);
        assert_eq!(*listener.titles.lock().unwrap(), vec!["440 Hz"]);
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "xfade-{name}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let _ = std::fs::create_dir_all(&root);
        root
    }

    #[test]
    fn dj_crossfade_stretches_onto_the_next_beatgrid() {
        let root = scratch_dir("dj");
        let a = root.join("a.wav");
        let b = root.join("b.wav");
        std::fs::write(Beatgrid::path_for(&a), "[0.0]\n8@120\n[20.0]\n8@120 0@120\n").unwrap();
        std::fs::write(Beatgrid::path_for(&b), "[2.0]\n8@126 0@126\n").unwrap();
        let factory = ToneFactory::new(RATE, 2)
            .with_tone(&a, 440.0, 26.0)
            .with_tone(&b, 660.0, 10.0);
        let settings = CrossfadeSettings {
            normal_enabled: false,
            dj_enabled: true,
            ..Default::default()
        };
        let files = [a.clone(), b.clone()];

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let left = render_with(factory, settings, &files, Arc::new(NullListener), |_| {});
            let _ = done_tx.send(left);
        });
        let left = done_rx
            .recv_timeout(Duration::from_secs(120))
            .expect("dj crossfade did not finish");
        let _ = std::fs::remove_dir_all(&root);

        // 20 s of "a", eight beats blended from 120 to 126 BPM, then "b" from 2 s + 8 beats on.
        let fade = 8.0 * 60.0 * (126.0f64 / 120.0).ln() / 6.0;
        let rest_of_b = 10.0 - (2.0 + 8.0 * 60.0 / 126.0);
        let expected = (20.0 + fade + rest_of_b) * RATE as f64;
        let frames = left.len() as f64;
        assert!((frames - expected).abs() < 0.25 * RATE as f64, "rendered {frames} frames");
        // Back to back would be 36 s.
        assert!(frames < 30.0 * RATE as f64);

        let longest_quiet = left
            .split(|s| s.abs() >= 1e-4)
            .map(<[f32]>::len)
            .max()
            .unwrap_or(0);
        assert!(longest_quiet < 128, "{longest_quiet} silent frames");
    }

    #[test]
    fn disabled_crossfade_plays_back_to_back() {
        let factory = ToneFactory::new(RATE, 2)
            .with_tone("a", 440.0, 2.0)
            .with_tone("b", 660.0, 2.0);
        let settings = CrossfadeSettings {
            normal_enabled: false,
            ..Default::default()
        };
        let left = render(factory, settings, &["a", "b"], Arc::new(Recorder::default()));
        assert_eq!(left.len(), 4 * RATE as usize);
    }

    #[test]
    fn unplayable_request_is_skipped() {
        let factory = ToneFactory::new(RATE, 2)
            .with_tone("a", 440.0, 2.0)
            .with_tone("c", 550.0, 2.0);
        let listener = Arc::new(Recorder::default());
        let left = render(
            factory,
            CrossfadeSettings::default(),
            &["a", "missing", "c"],
            listener.clone(),
        );
        assert_eq!(left.len(), 4 * RATE as usize);
        assert_eq!(*listener.titles.lock().unwrap(), vec!["440 Hz", "550 Hz"]);
    }

    #[test]
    fn play_next_jumps_the_queue() {
        let sink = AudioSink::new(&sink_config(), Box::new(ManualOutput));
        let queue = RequestQueue::new(
            sink.handle(),
            Arc::new(ToneFactory::new(RATE, 2)),
            Arc::new(NullListener),
            CrossfadeSettings::default(),
        );
        let first = queue.play("a");
        let second = queue.play("a");
        let urgent = queue.play_next("b");
        let ids: Vec<u64> = queue.pending().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![urgent, first, second]);
        assert_ne!(first, second);
    }

    #[test]
    fn settings_are_adjustable() {
        let sink = AudioSink::new(&sink_config(), Box::new(ManualOutput));
        let queue = RequestQueue::new(
            sink.handle(),
            Arc::new(ToneFactory::new(RATE, 2)),
            Arc::new(NullListener),
            CrossfadeSettings::default(),
        );
        queue.set_xfade_duration(8.0);
        queue.set_dj_xfade_enabled(true);
        queue.set_fade_map(FadeMap::knee());
        let settings = queue.settings();
        assert_eq!(settings.duration, 8.0);
        assert!(settings.dj_enabled);
        assert_eq!(settings.fade_map, FadeMap::knee());
    }

    #[test]
    fn waits_return_when_not_running() {
        let sink = AudioSink::new(&sink_config(), Box::new(ManualOutput));
        let queue = RequestQueue::new(
            sink.handle(),
            Arc::new(ToneFactory::new(RATE, 2)),
            Arc::new(NullListener),
            CrossfadeSettings::default(),
        );
        queue.play("a");
        queue.wait_for_empty_queue();
        queue.wait_for_idle();
        assert_eq!(queue.pending().len(), 1);
    }
}
