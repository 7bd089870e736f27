//! Time-indexed caption tracks.
//!
//! A chapter carries two tracks built from the same word-level captions: the
//! words themselves and the merged sentences. Both share one lookup
//! implementation; the display mode only decides which track is consulted.

use crate::caption::Caption;
use crate::sentences::merge_sentences;
use serde::{Deserialize, Serialize};

/// Which caption granularity is shown during playback.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    Word,
    #[default]
    Sentence,
}

impl DisplayMode {
    pub fn toggled(self) -> Self {
        match self {
            DisplayMode::Word => DisplayMode::Sentence,
            DisplayMode::Sentence => DisplayMode::Word,
        }
    }
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DisplayMode::Word => "word",
            DisplayMode::Sentence => "sentence",
        };
        write!(f, "{}", label)
    }
}

/// Captions sorted ascending by start time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptionTrack {
    captions: Vec<Caption>,
}

impl CaptionTrack {
    pub fn new(mut captions: Vec<Caption>) -> Self {
        if !captions.windows(2).all(|w| w[0].start <= w[1].start) {
            captions.sort_by(|a, b| a.start.total_cmp(&b.start));
        }
        Self { captions }
    }

    pub fn len(&self) -> usize {
        self.captions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captions.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Caption> {
        self.captions.get(idx)
    }

    pub fn captions(&self) -> &[Caption] {
        &self.captions
    }

    /// Index of the caption active at `t`.
    ///
    /// Returns the caption whose interval contains `t` when the probe path
    /// hits one; otherwise the last caption that started at or before `t`.
    /// `None` when `t` precedes every start.
    pub fn active_index(&self, t: f64) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = self.captions.len();
        let mut candidate = None;

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let caption = &self.captions[mid];
            if caption.contains(t) {
                return Some(mid);
            }
            if t < caption.start {
                hi = mid;
            } else {
                candidate = Some(mid);
                lo = mid + 1;
            }
        }

        candidate
    }

    pub fn active(&self, t: f64) -> Option<&Caption> {
        self.active_index(t).and_then(|idx| self.captions.get(idx))
    }
}

/// Word-level and sentence-level tracks for one chapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChapterCaptions {
    words: CaptionTrack,
    sentences: CaptionTrack,
}

impl ChapterCaptions {
    pub fn build(words: Vec<Caption>, anticipation: f64) -> Self {
        let words = CaptionTrack::new(words);
        let sentences = CaptionTrack::new(merge_sentences(words.captions(), anticipation));
        Self { words, sentences }
    }

    pub fn track(&self, mode: DisplayMode) -> &CaptionTrack {
        match mode {
            DisplayMode::Word => &self.words,
            DisplayMode::Sentence => &self.sentences,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(spans: &[(f64, f64)]) -> CaptionTrack {
        CaptionTrack::new(
            spans
                .iter()
                .enumerate()
                .map(|(idx, (start, end))| Caption::new(idx as u32 + 1, *start, *end, "w"))
                .collect(),
        )
    }

    /// Linear reference: containing caption, else the last one that started.
    fn reference_index(track: &CaptionTrack, t: f64) -> Option<usize> {
        let captions = track.captions();
        if let Some(idx) = captions.iter().position(|c| c.contains(t)) {
            return Some(idx);
        }
        captions.iter().rposition(|c| c.start <= t)
    }

    #[test]
    fn single_caption_lookup() {
        let track = track(&[(1.0, 2.5)]);
        assert_eq!(track.active_index(1.5), Some(0));
        assert_eq!(track.active_index(5.0), Some(0));
        assert_eq!(track.active_index(0.5), None);
        assert_eq!(track.active_index(1.0), Some(0));
        assert_eq!(track.active_index(2.5), Some(0));
    }

    #[test]
    fn gaps_resolve_to_most_recent_start() {
        let track = track(&[(0.0, 1.0), (2.0, 3.0), (5.0, 6.0)]);
        assert_eq!(track.active_index(1.5), Some(0));
        assert_eq!(track.active_index(3.5), Some(1));
        assert_eq!(track.active_index(4.99), Some(1));
        assert_eq!(track.active_index(5.0), Some(2));
        assert_eq!(track.active_index(100.0), Some(2));
    }

    #[test]
    fn empty_track_has_no_active_caption() {
        let track = CaptionTrack::default();
        assert_eq!(track.active_index(0.0), None);
        assert!(track.active(3.0).is_none());
    }

    #[test]
    fn agrees_with_linear_scan_on_non_overlapping_tracks() {
        let spans: Vec<(f64, f64)> = (0..37)
            .map(|i| {
                let start = i as f64 * 0.7 + if i % 3 == 0 { 0.2 } else { 0.0 };
                (start, start + 0.45)
            })
            .collect();
        let track = track(&spans);
        let mut t = -1.0;
        while t < 30.0 {
            assert_eq!(track.active_index(t), reference_index(&track, t), "t={t}");
            t += 0.05;
        }
    }

    #[test]
    fn unsorted_input_is_sorted_on_construction() {
        let track = CaptionTrack::new(vec![
            Caption::new(2, 3.0, 4.0, "b"),
            Caption::new(1, 1.0, 2.0, "a"),
        ]);
        assert_eq!(track.get(0).map(|c| c.id), Some(1));
        assert_eq!(track.active(3.5).map(|c| c.id), Some(2));
    }

    #[test]
    fn chapter_captions_route_by_mode() {
        let words = vec![
            Caption::new(1, 1.0, 1.4, "Hello"),
            Caption::new(2, 1.5, 2.0, "there."),
            Caption::new(3, 2.5, 3.0, "Bye"),
        ];
        let captions = ChapterCaptions::build(words, 0.3);
        assert_eq!(captions.track(DisplayMode::Word).len(), 3);
        assert_eq!(captions.track(DisplayMode::Sentence).len(), 2);
        assert_eq!(
            captions
                .track(DisplayMode::Sentence)
                .active(0.8)
                .map(|c| c.text.as_str()),
            Some("Hello there.")
        );
        assert_eq!(captions.track(DisplayMode::Word).active(0.8), None);
    }

    #[test]
    fn display_mode_toggles() {
        assert_eq!(DisplayMode::Word.toggled(), DisplayMode::Sentence);
        assert_eq!(DisplayMode::Sentence.toggled(), DisplayMode::Word);
    }
}
