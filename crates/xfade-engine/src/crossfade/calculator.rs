//! Crossfade curves as functions of "percent" progress through the fade.
//!
//! Both tracks of a crossfade share one progress variable `p` in `[0, 1]`. Each feeder advances
//! `p` by the amount of unstretched track time it just consumed, and reads back:
//! - the volume to apply to its next chunk
//! - the time ratio to hand the stretcher (output length / input length)
//!
//! Two calculators exist:
//! - [`LinearCalculator`]: `p` moves with wall time, no tempo change
//! - [`DjCalculator`]: `p` moves one beatgrid step per beat, and both tracks are stretched onto a
//!   blended tempo so that their beats land together

use std::path::Path;

use crate::crossfade::beatgrid::{Beatgrid, FadeRole};

/// Tolerance for "progress reached 1".
pub const EPSILON: f64 = 64.0 * f64::EPSILON;

/// Smallest time ratio the stretch engine is asked to produce.
pub const MIN_STRETCH_RATIO: f64 = 1.0 / 128.0;

/// Result of advancing a track's progress by some amount of track time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PercentStep {
    /// Increase of `p`.
    pub change: f64,
    /// Track-local time after the step.
    pub new_time: f64,
    /// `p + change` reached 1 within [`EPSILON`].
    pub done: bool,
}

/// Switches that decide which calculator (if any) a track pair gets.
#[derive(Clone, Copy, Debug)]
pub struct CalculatorChoice {
    pub normal_enabled: bool,
    pub dj_enabled: bool,
    pub crossfade_time: f64,
    pub optimistic_tempo: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CrossfadeCalculator {
    Linear(LinearCalculator),
    Dj(DjCalculator),
}

impl CrossfadeCalculator {
    /// Pick the calculator for a pair of tracks.
    ///
    /// DJ mode wins when it is enabled, both beatgrid files parse and the pair passes its
    /// feasibility checks; otherwise a linear fade is used when enabled and both tracks are long
    /// enough. `None` means the tracks play back to back.
    pub fn choose(
        choice: CalculatorChoice,
        fade_out_path: &Path,
        fade_out_duration: f64,
        fade_in_path: &Path,
        fade_in_duration: f64,
    ) -> Option<Self> {
        if choice.dj_enabled {
            let grids = Beatgrid::load(fade_out_path, FadeRole::FadeOut)
                .and_then(|out| Ok((out, Beatgrid::load(fade_in_path, FadeRole::FadeIn)?)));
            match grids {
                Ok((fade_out, fade_in)) => {
                    let dj = DjCalculator::new(fade_out, fade_in, choice.optimistic_tempo);
                    if dj.check_crossfade_condition(fade_out_duration, fade_in_duration) {
                        return Some(CrossfadeCalculator::Dj(dj));
                    }
                    tracing::info!(
                        from = %fade_out_path.display(),
                        to = %fade_in_path.display(),
                        "beat-synchronized crossfade not feasible"
                    );
                }
                Err(e) => tracing::debug!("no usable beatgrid: {e}"),
            }
        }

        if choice.normal_enabled {
            let linear = LinearCalculator::new(choice.crossfade_time, fade_out_duration);
            if linear.check_crossfade_condition(fade_out_duration, fade_in_duration) {
                return Some(CrossfadeCalculator::Linear(linear));
            }
            tracing::info!(
                crossfade_secs = choice.crossfade_time,
                fade_out_secs = fade_out_duration,
                fade_in_secs = fade_in_duration,
                "tracks too short for crossfade"
            );
        }
        None
    }

    pub fn label(&self) -> &'static str {
        match self {
            CrossfadeCalculator::Linear(_) => "linear",
            CrossfadeCalculator::Dj(_) => "dj",
        }
    }

    /// Whether chunks need a real time-stretch engine (ratios other than 1).
    pub fn uses_time_stretch(&self) -> bool {
        matches!(self, CrossfadeCalculator::Dj(_))
    }

    pub fn percentage_change(&self, role: FadeRole, percent: f64, time: f64, dt: f64) -> PercentStep {
        match self {
            CrossfadeCalculator::Linear(c) => c.percentage_change(percent, time, dt),
            CrossfadeCalculator::Dj(c) => c.percentage_change(role, percent, time, dt),
        }
    }

    /// Unstretched track time covered by moving from `percent` to `percent + change`.
    pub fn original_time_change(&self, role: FadeRole, percent: f64, change: f64) -> f64 {
        match self {
            CrossfadeCalculator::Linear(c) => c.original_time_change(change),
            CrossfadeCalculator::Dj(c) => c.original_time_change(role, percent, change),
        }
    }

    /// Linear volume in `[0, 1]`, before any fade map.
    pub fn volume(&self, role: FadeRole, percent: f64) -> f64 {
        let fade_in = match self {
            CrossfadeCalculator::Linear(_) => percent.clamp(0.0, 1.0),
            CrossfadeCalculator::Dj(c) => c.fade_in_volume(percent),
        };
        match role {
            FadeRole::FadeIn => fade_in,
            FadeRole::FadeOut => 1.0 - fade_in,
        }
    }

    pub fn stretch_factor(&self, role: FadeRole, percent: f64) -> f64 {
        match self {
            CrossfadeCalculator::Linear(_) => 1.0,
            CrossfadeCalculator::Dj(c) => c.stretch_factor(role, percent),
        }
    }

    /// Track time of the outgoing track where the crossfade begins.
    pub fn time_at_start_of_fade_out(&self) -> f64 {
        match self {
            CrossfadeCalculator::Linear(c) => c.fade_out_duration - c.crossfade_time,
            CrossfadeCalculator::Dj(c) => c.fade_out.fade_time,
        }
    }

    /// Track time of the incoming track where its part of the crossfade begins.
    pub fn time_at_start_of_fade_in(&self) -> f64 {
        match self {
            CrossfadeCalculator::Linear(_) => 0.0,
            CrossfadeCalculator::Dj(c) => c.fade_in.fade_time,
        }
    }

    /// Progress at which the outgoing track starts contributing.
    pub fn fade_out_percentage(&self) -> f64 {
        match self {
            CrossfadeCalculator::Linear(_) => 0.0,
            CrossfadeCalculator::Dj(c) => c.offset_percentage(FadeRole::FadeOut),
        }
    }

    /// Progress at which the incoming track starts contributing.
    pub fn fade_in_percentage(&self) -> f64 {
        match self {
            CrossfadeCalculator::Linear(_) => 0.0,
            CrossfadeCalculator::Dj(c) => c.offset_percentage(FadeRole::FadeIn),
        }
    }
}

/// Equal-length fade driven by elapsed time.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearCalculator {
    crossfade_time: f64,
    fade_out_duration: f64,
}

impl LinearCalculator {
    pub fn new(crossfade_time: f64, fade_out_duration: f64) -> Self {
        Self {
            crossfade_time,
            fade_out_duration,
        }
    }

    pub fn crossfade_time(&self) -> f64 {
        self.crossfade_time
    }

    pub fn percentage_change(&self, percent: f64, time: f64, dt: f64) -> PercentStep {
        let change = if self.crossfade_time > 0.0 {
            dt / self.crossfade_time
        } else {
            1.0 - percent
        };
        PercentStep {
            change,
            new_time: time + dt,
            done: percent + change >= 1.0 - EPSILON,
        }
    }

    pub fn original_time_change(&self, change: f64) -> f64 {
        change * self.crossfade_time
    }

    pub fn check_crossfade_condition(&self, fade_out_duration: f64, fade_in_duration: f64) -> bool {
        self.crossfade_time > 0.0
            && fade_out_duration >= self.crossfade_time
            && fade_in_duration >= self.crossfade_time
    }
}

/// Beat-synchronized fade over two beatgrids.
///
/// With `n_out`/`n_in` beats and `N = max(n_out, n_in)`, the outgoing grid covers global beats
/// `[0, n_out)` and the incoming grid `[N - n_in, N)`, so both end together when `n_out <= n_in`
/// and the outgoing track plays alone for the first beats otherwise. Progress is `beat / N`.
#[derive(Clone, Debug, PartialEq)]
pub struct DjCalculator {
    fade_out: Beatgrid,
    fade_in: Beatgrid,
    optimistic_tempo: bool,
}

impl DjCalculator {
    pub fn new(fade_out: Beatgrid, fade_in: Beatgrid, optimistic_tempo: bool) -> Self {
        Self {
            fade_out,
            fade_in,
            optimistic_tempo,
        }
    }

    fn grid(&self, role: FadeRole) -> &Beatgrid {
        match role {
            FadeRole::FadeOut => &self.fade_out,
            FadeRole::FadeIn => &self.fade_in,
        }
    }

    fn max_len(&self) -> usize {
        self.fade_out.len().max(self.fade_in.len())
    }

    fn min_len(&self) -> usize {
        self.fade_out.len().min(self.fade_in.len())
    }

    /// First global beat of `role`'s grid.
    pub fn beat_offset(&self, role: FadeRole) -> usize {
        match role {
            FadeRole::FadeOut => 0,
            FadeRole::FadeIn => self.max_len() - self.fade_in.len(),
        }
    }

    fn offset_percentage(&self, role: FadeRole) -> f64 {
        let n = self.max_len();
        if n == 0 {
            0.0
        } else {
            self.beat_offset(role) as f64 / n as f64
        }
    }

    /// Beat position inside `role`'s own grid at global progress `percent`.
    fn local_beat(&self, role: FadeRole, percent: f64) -> f64 {
        percent * self.max_len() as f64 - self.beat_offset(role) as f64
    }

    pub fn percentage_change(&self, role: FadeRole, percent: f64, time: f64, dt: f64) -> PercentStep {
        let grid = self.grid(role);
        let n = self.max_len() as f64;
        let local = self.local_beat(role, percent).max(0.0);
        let mut index = local.floor() as usize;
        let mut frac = local - index as f64;
        let mut remaining = dt;
        let mut beats = 0.0;

        while remaining > 0.0 && index < grid.len() {
            let beat_len = 60.0 / grid.beats[index];
            let left_in_beat = (1.0 - frac) * beat_len;
            if remaining <= left_in_beat {
                beats += remaining / beat_len;
                remaining = 0.0;
            } else {
                remaining -= left_in_beat;
                beats += 1.0 - frac;
                frac = 0.0;
                index += 1;
            }
        }

        let change = if remaining > 0.0 || n == 0.0 {
            // Ran off the end of the grid: this track's part of the fade is over.
            1.0 - percent
        } else {
            beats / n
        };
        PercentStep {
            change,
            new_time: time + dt,
            done: percent + change >= 1.0 - EPSILON,
        }
    }

    pub fn original_time_change(&self, role: FadeRole, percent: f64, change: f64) -> f64 {
        let grid = self.grid(role);
        let mut beat = self.local_beat(role, percent).max(0.0);
        let end = self.local_beat(role, percent + change).max(0.0);
        let mut time = 0.0;
        while beat < end {
            let index = beat.floor() as usize;
            let next = ((index + 1) as f64).min(end);
            time += (next - beat) * 60.0 / grid.tempo_at(index);
            beat = next;
        }
        time
    }

    pub fn fade_in_volume(&self, percent: f64) -> f64 {
        let global = percent * self.max_len() as f64;
        let start = self.beat_offset(FadeRole::FadeIn) as f64;
        let span = self.min_len() as f64;
        if global >= start + span {
            1.0
        } else if global >= start {
            (global - start) / span
        } else {
            0.0
        }
    }

    pub fn bpm_at_start(&self) -> f64 {
        self.fade_out
            .beats
            .first()
            .copied()
            .unwrap_or(self.fade_out.instantaneous_tempo)
    }

    pub fn bpm_at_end(&self) -> f64 {
        self.fade_in
            .beats
            .last()
            .copied()
            .unwrap_or(self.fade_in.instantaneous_tempo)
    }

    /// Tempo both tracks are stretched onto at `percent`.
    pub fn blended_bpm(&self, percent: f64) -> f64 {
        let start = self.bpm_at_start();
        let end = self.bpm_at_end();
        let percent = percent.clamp(0.0, 1.0);
        if self.optimistic_tempo {
            return start + (end - start) * percent;
        }

        // Pessimistic: only move while both grids overlap.
        let out_len = self.fade_out.len();
        let in_len = self.fade_in.len();
        if out_len > in_len {
            let overlap = in_len as f64 / out_len as f64;
            let begin = 1.0 - overlap;
            if percent < begin {
                start
            } else if overlap < EPSILON {
                end
            } else {
                start + (percent - begin) / overlap * (end - start)
            }
        } else if in_len == 0 {
            end
        } else {
            let overlap = out_len as f64 / in_len as f64;
            if percent > overlap {
                end
            } else if overlap < EPSILON {
                start
            } else {
                end + (overlap - percent) / overlap * (start - end)
            }
        }
    }

    pub fn stretch_factor(&self, role: FadeRole, percent: f64) -> f64 {
        let grid = self.grid(role);
        let local = self.local_beat(role, percent);
        if local < 0.0 || local >= grid.len() as f64 {
            return 1.0;
        }
        let index = local.floor() as usize;
        let alpha = local - index as f64;
        let bpm = (1.0 - alpha) * grid.beats[index] + alpha * grid.tempo_at(index + 1);
        bpm / self.blended_bpm(percent)
    }

    pub fn time_at_end_of_fade_out(&self) -> f64 {
        self.fade_out.fade_time + self.fade_out.duration()
    }

    pub fn time_at_end_of_fade_in(&self) -> f64 {
        self.fade_in.fade_time + self.fade_in.duration()
    }

    fn stretch_limits_hold(&self, role: FadeRole) -> bool {
        let grid = self.grid(role);
        let n = self.max_len() as f64;
        let offset = self.beat_offset(role);
        (0..grid.len()).all(|k| {
            let p1 = (offset + k) as f64 / n;
            let p2 = (offset + k + 1) as f64 / n;
            let f1 = grid.beats[k] / self.blended_bpm(p1);
            let f2 = grid.tempo_at(k + 1) / self.blended_bpm(p2);
            f1 >= MIN_STRETCH_RATIO && f2 >= MIN_STRETCH_RATIO
        })
    }

    /// Both sections end before their track does and every stretch ratio is achievable.
    pub fn check_crossfade_condition(&self, fade_out_duration: f64, fade_in_duration: f64) -> bool {
        !self.fade_out.is_empty()
            && !self.fade_in.is_empty()
            && self.fade_out.fade_time >= 0.0
            && self.time_at_end_of_fade_out() < fade_out_duration
            && self.time_at_end_of_fade_in() < fade_in_duration
            && self.stretch_limits_hold(FadeRole::FadeOut)
            && self.stretch_limits_hold(FadeRole::FadeIn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> CrossfadeCalculator {
        CrossfadeCalculator::Linear(LinearCalculator::new(5.0, 30.0))
    }

    fn grid(fade_time: f64, beats: Vec<f64>) -> Beatgrid {
        let instantaneous_tempo = *beats.last().unwrap();
        Beatgrid {
            fade_time,
            beats,
            instantaneous_tempo,
        }
    }

    fn dj(optimistic: bool) -> DjCalculator {
        DjCalculator::new(grid(100.0, vec![120.0; 8]), grid(2.0, vec![128.0; 4]), optimistic)
    }

    #[test]
    fn linear_advances_with_time() {
        let calc = linear();
        let step = calc.percentage_change(FadeRole::FadeOut, 0.0, 0.0, 1.0);
        assert!((step.change - 0.2).abs() < 1e-12);
        assert_eq!(step.new_time, 1.0);
        assert!(!step.done);

        let step = calc.percentage_change(FadeRole::FadeOut, 0.8, 4.0, 1.0);
        assert!(step.done);
    }

    #[test]
    fn done_when_within_64_epsilon_of_the_end() {
        let calc = linear();
        // `percent + change >= 1 - 64ε` counts as done, so 1 - 32ε is done and 1 - 128ε is not.
        let near = calc.percentage_change(FadeRole::FadeIn, 1.0 - 32.0 * f64::EPSILON, 0.0, 0.0);
        assert!(near.done);
        let far = calc.percentage_change(FadeRole::FadeIn, 1.0 - 128.0 * f64::EPSILON, 0.0, 0.0);
        assert!(!far.done);
    }

    #[test]
    fn linear_volumes_are_complementary() {
        let calc = linear();
        assert_eq!(calc.volume(FadeRole::FadeIn, 0.25), 0.25);
        assert_eq!(calc.volume(FadeRole::FadeOut, 0.25), 0.75);
        assert_eq!(calc.volume(FadeRole::FadeIn, 1.5), 1.0);
        assert_eq!(calc.stretch_factor(FadeRole::FadeOut, 0.5), 1.0);
        assert_eq!(calc.time_at_start_of_fade_out(), 25.0);
        assert_eq!(calc.time_at_start_of_fade_in(), 0.0);
        assert!((calc.original_time_change(FadeRole::FadeOut, 0.1, 0.2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn linear_requires_both_tracks_long_enough() {
        let calc = LinearCalculator::new(5.0, 30.0);
        assert!(calc.check_crossfade_condition(30.0, 5.0));
        assert!(!calc.check_crossfade_condition(4.9, 30.0));
        assert!(!calc.check_crossfade_condition(30.0, 4.9));
    }

    #[test]
    fn dj_offsets_align_grid_ends() {
        let calc = dj(true);
        assert_eq!(calc.beat_offset(FadeRole::FadeOut), 0);
        assert_eq!(calc.beat_offset(FadeRole::FadeIn), 4);
        let wrapped = CrossfadeCalculator::Dj(calc);
        assert_eq!(wrapped.fade_out_percentage(), 0.0);
        assert_eq!(wrapped.fade_in_percentage(), 0.5);
        assert_eq!(wrapped.time_at_start_of_fade_out(), 100.0);
        assert_eq!(wrapped.time_at_start_of_fade_in(), 2.0);
    }

    #[test]
    fn dj_progress_moves_one_step_per_beat() {
        let calc = dj(true);
        // One beat at 120 BPM lasts half a second.
        let step = calc.percentage_change(FadeRole::FadeOut, 0.0, 0.0, 0.5);
        assert!((step.change - 0.125).abs() < 1e-12);
        assert!(!step.done);
        let step = calc.percentage_change(FadeRole::FadeOut, 0.0625, 0.0, 0.5);
        assert!((step.change - 0.125).abs() < 1e-12);

        // Incoming grid starts at p = 0.5; beats at 128 BPM.
        let step = calc.percentage_change(FadeRole::FadeIn, 0.5, 0.0, 60.0 / 128.0);
        assert!((step.change - 0.125).abs() < 1e-12);

        // Past the end of the grid the fade completes.
        let step = calc.percentage_change(FadeRole::FadeIn, 0.9, 0.0, 10.0);
        assert!((step.change - 0.1).abs() < 1e-12);
        assert!(step.done);
    }

    #[test]
    fn dj_time_change_inverts_progress() {
        let calc = dj(true);
        let t = calc.original_time_change(FadeRole::FadeOut, 0.0, 0.125);
        assert!((t - 0.5).abs() < 1e-12);
        let step = calc.percentage_change(FadeRole::FadeIn, 0.55, 0.0, 0.3);
        let t = calc.original_time_change(FadeRole::FadeIn, 0.55, step.change);
        assert!((t - 0.3).abs() < 1e-9);
    }

    #[test]
    fn dj_volume_ramps_over_shorter_grid() {
        let calc = dj(true);
        assert_eq!(calc.fade_in_volume(0.25), 0.0);
        assert_eq!(calc.fade_in_volume(0.5), 0.0);
        assert!((calc.fade_in_volume(0.75) - 0.5).abs() < 1e-12);
        assert_eq!(calc.fade_in_volume(1.0), 1.0);
    }

    #[test]
    fn dj_tempo_blends_between_tracks() {
        let optimistic = dj(true);
        assert_eq!(optimistic.blended_bpm(0.0), 120.0);
        assert_eq!(optimistic.blended_bpm(0.5), 124.0);
        assert_eq!(optimistic.blended_bpm(1.0), 128.0);

        let pessimistic = dj(false);
        assert_eq!(pessimistic.blended_bpm(0.25), 120.0);
        assert_eq!(pessimistic.blended_bpm(0.75), 124.0);
        assert_eq!(pessimistic.blended_bpm(1.0), 128.0);
    }

    #[test]
    fn dj_stretch_factor_is_real_over_blended_tempo() {
        let calc = dj(true);
        assert!((calc.stretch_factor(FadeRole::FadeOut, 0.0) - 1.0).abs() < 1e-12);
        assert!((calc.stretch_factor(FadeRole::FadeOut, 0.5) - 120.0 / 124.0).abs() < 1e-12);
        assert!((calc.stretch_factor(FadeRole::FadeIn, 0.5) - 128.0 / 124.0).abs() < 1e-12);
        assert_eq!(calc.stretch_factor(FadeRole::FadeIn, 0.25), 1.0);
    }

    #[test]
    fn dj_condition_checks_track_ends() {
        let calc = dj(true);
        // Fade-out section: 100 s + 8 beats at 120 BPM = 104 s.
        assert!(calc.check_crossfade_condition(200.0, 60.0));
        assert!(!calc.check_crossfade_condition(104.0, 60.0));
        // Fade-in section: 2 s + 4 beats at 128 BPM = 3.875 s.
        assert!(!calc.check_crossfade_condition(200.0, 3.8));
    }

    #[test]
    fn dj_condition_rejects_extreme_stretch() {
        let calc = DjCalculator::new(grid(0.0, vec![1.0; 2]), grid(0.0, vec![200.0; 2]), true);
        assert!(!calc.check_crossfade_condition(1_000.0, 1_000.0));
    }

    #[test]
    fn choose_falls_back_to_linear_without_beatgrids() {
        let choice = CalculatorChoice {
            normal_enabled: true,
            dj_enabled: true,
            crossfade_time: 5.0,
            optimistic_tempo: true,
        };
        let missing = Path::new("/nonexistent/xfade-test-track.flac");
        let calc = CrossfadeCalculator::choose(choice, missing, 30.0, missing, 30.0);
        assert_eq!(calc.map(|c| c.label()), Some("linear"));

        let calc = CrossfadeCalculator::choose(
            CalculatorChoice {
                normal_enabled: false,
                ..choice
            },
            missing,
            30.0,
            missing,
            30.0,
        );
        assert!(calc.is_none());
    }
}
