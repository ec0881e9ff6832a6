//! Companion `.bpm` files describing the beats around a track's fade points.
//!
//! Format (plain text, next to the audio file as `<audio filename>.bpm`):
//! ```text
//! [12.5]          <- intro marker: seconds where the fade-in section starts
//! 16@124.0        <- 16 beats at 124 BPM
//! 0@124.0         <- instantaneous tempo used past the last listed beat
//! [301.0]         <- outro marker: seconds where the fade-out section starts
//! 32@124.0
//! ```
//! The fade-in role reads the entries after the first marker, the fade-out role the entries after
//! the second marker. Entries are whitespace separated `count@bpm` tokens; reading stops at the
//! first token that is not of that form. Non-positive tempos are skipped.

use std::path::{Path, PathBuf};

use crate::error::BeatgridError;

const MAX_BEATS: usize = 1 << 16;

/// Which section of a beatgrid file a track contributes to a crossfade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadeRole {
    /// Incoming track; first marker.
    FadeIn,
    /// Outgoing track; second marker.
    FadeOut,
}

impl FadeRole {
    fn marker_index(self) -> usize {
        match self {
            FadeRole::FadeIn => 0,
            FadeRole::FadeOut => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FadeRole::FadeIn => "fade-in",
            FadeRole::FadeOut => "fade-out",
        }
    }
}

/// One fade section: start time plus one tempo per beat.
#[derive(Clone, Debug, PartialEq)]
pub struct Beatgrid {
    /// Track time (seconds) of the first beat.
    pub fade_time: f64,
    /// Tempo of each beat, in BPM.
    pub beats: Vec<f64>,
    /// Tempo used for positions past the last beat.
    pub instantaneous_tempo: f64,
}

impl Beatgrid {
    /// `song.flac` -> `song.flac.bpm`.
    pub fn path_for(audio: &Path) -> PathBuf {
        let mut name = audio.as_os_str().to_os_string();
        name.push(".bpm");
        PathBuf::from(name)
    }

    pub fn load(audio: &Path, role: FadeRole) -> Result<Self, BeatgridError> {
        let path = Self::path_for(audio);
        let text = std::fs::read_to_string(&path).map_err(|source| BeatgridError::Io {
            path: path.clone(),
            source,
        })?;
        Self::parse(&text, role)
    }

    pub fn parse(text: &str, role: FadeRole) -> Result<Self, BeatgridError> {
        let mut lines = text.lines();
        let mut seen = 0usize;
        let mut fade_time = None;
        for line in lines.by_ref() {
            let Some(marker) = parse_marker(line)? else {
                continue;
            };
            if seen == role.marker_index() {
                fade_time = Some(marker);
                break;
            }
            seen += 1;
        }
        let fade_time = fade_time.ok_or(BeatgridError::MissingMarker(role.label()))?;

        let mut beats = Vec::new();
        let mut instantaneous = None;
        let mut last_bpm = None;
        'entries: for line in lines {
            for token in line.split_whitespace() {
                let Some((count, bpm)) = parse_entry(token) else {
                    break 'entries;
                };
                if bpm < 2.0 * f64::EPSILON {
                    continue;
                }
                last_bpm = Some(bpm);
                if count == 0 {
                    instantaneous = Some(bpm);
                    continue;
                }
                if beats.len() + count > MAX_BEATS {
                    return Err(BeatgridError::TooManyBeats(beats.len() + count));
                }
                beats.extend(std::iter::repeat_n(bpm, count));
            }
        }

        if beats.is_empty() {
            return Err(BeatgridError::NoEntries);
        }
        let instantaneous_tempo = instantaneous.or(last_bpm).unwrap_or(beats[beats.len() - 1]);

        Ok(Self {
            fade_time,
            beats,
            instantaneous_tempo,
        })
    }

    pub fn len(&self) -> usize {
        self.beats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }

    /// Tempo of beat `index`, or the instantaneous tempo past the end.
    pub fn tempo_at(&self, index: usize) -> f64 {
        self.beats
            .get(index)
            .copied()
            .unwrap_or(self.instantaneous_tempo)
    }

    /// Unstretched length of the whole section, in seconds.
    pub fn duration(&self) -> f64 {
        self.beats.iter().map(|bpm| 60.0 / bpm).sum()
    }
}

fn parse_marker(line: &str) -> Result<Option<f64>, BeatgridError> {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix('[') else {
        return Ok(None);
    };
    let Some(end) = rest.find(']') else {
        return Ok(None);
    };
    rest[..end]
        .trim()
        .parse::<f64>()
        .map(Some)
        .map_err(|_| BeatgridError::BadMarker(trimmed.to_string()))
}

fn parse_entry(token: &str) -> Option<(usize, f64)> {
    let (count, bpm) = token.split_once('@')?;
    let count = count.parse::<usize>().ok()?;
    let bpm = bpm.parse::<f64>().ok()?;
    bpm.is_finite().then_some((count, bpm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fade_in_section() {
        let grid = Beatgrid::parse("[10.0]\n4@120.0\n0@130.0\n", FadeRole::FadeIn).unwrap();
        assert_eq!(grid.fade_time, 10.0);
        assert_eq!(grid.beats, vec![120.0; 4]);
        assert_eq!(grid.instantaneous_tempo, 130.0);
    }

    #[test]
    fn fade_out_reads_second_marker() {
        let text = "[1.5]\n2@100\n[200.0]\n3@128.0 1@126.0\n";
        let grid = Beatgrid::parse(text, FadeRole::FadeOut).unwrap();
        assert_eq!(grid.fade_time, 200.0);
        assert_eq!(grid.beats, vec![128.0, 128.0, 128.0, 126.0]);
        assert_eq!(grid.instantaneous_tempo, 126.0);

        let grid = Beatgrid::parse(text, FadeRole::FadeIn).unwrap();
        assert_eq!(grid.beats, vec![100.0, 100.0]);
    }

    #[test]
    fn fade_out_without_second_marker_fails() {
        let err = Beatgrid::parse("[10.0]\n4@120.0\n", FadeRole::FadeOut).unwrap_err();
        assert!(matches!(err, BeatgridError::MissingMarker("fade-out")));
    }

    #[test]
    fn non_positive_tempos_are_skipped() {
        let grid = Beatgrid::parse("[0]\n2@0.0 1@-5 2@90\n", FadeRole::FadeIn).unwrap();
        assert_eq!(grid.beats, vec![90.0, 90.0]);
    }

    #[test]
    fn only_invalid_entries_is_an_error() {
        let err = Beatgrid::parse("[0]\n3@0\n0@120\n", FadeRole::FadeIn).unwrap_err();
        assert!(matches!(err, BeatgridError::NoEntries));
    }

    #[test]
    fn parsing_stops_at_first_foreign_token() {
        let grid = Beatgrid::parse("[ 4.0 ]\n2@120\nend\n2@60\n", FadeRole::FadeIn).unwrap();
        assert_eq!(grid.fade_time, 4.0);
        assert_eq!(grid.len(), 2);
        assert!((grid.duration() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn bad_marker_is_reported() {
        let err = Beatgrid::parse("[abc]\n2@120\n", FadeRole::FadeIn).unwrap_err();
        assert!(matches!(err, BeatgridError::BadMarker(_)));
    }

    #[test]
    fn path_appends_extension() {
        assert_eq!(
            Beatgrid::path_for(Path::new("/music/a.flac")),
            PathBuf::from("/music/a.flac.bpm")
        );
    }
}
