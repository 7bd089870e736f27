//! Merge word-level captions into sentence-level captions.

use crate::caption::Caption;

/// Lead time subtracted from a sentence's start so it shows just before the
/// first word is spoken.
pub const DEFAULT_ANTICIPATION_SECS: f64 = 0.3;

const SENTENCE_TERMINALS: [char; 3] = ['.', '?', '!'];

pub fn is_sentence_terminal(text: &str) -> bool {
    text.trim_end().ends_with(SENTENCE_TERMINALS)
}

/// Group consecutive words until one ends a sentence.
///
/// Each group becomes a caption whose text is the space-joined words, whose
/// start is pulled earlier by `anticipation` (never below zero), and whose
/// end is the last word's end. A trailing group without terminal punctuation
/// is still emitted. Sentence ids start at 1.
pub fn merge_sentences(words: &[Caption], anticipation: f64) -> Vec<Caption> {
    let anticipation = if anticipation.is_finite() {
        anticipation.max(0.0)
    } else {
        0.0
    };
    let mut sentences = Vec::new();
    let mut pending: Vec<&Caption> = Vec::new();

    for word in words {
        pending.push(word);
        if is_sentence_terminal(&word.text) {
            let id = sentences.len() as u32 + 1;
            sentences.push(close_group(id, &pending, anticipation));
            pending.clear();
        }
    }

    if !pending.is_empty() {
        let id = sentences.len() as u32 + 1;
        sentences.push(close_group(id, &pending, anticipation));
    }

    sentences
}

fn close_group(id: u32, members: &[&Caption], anticipation: f64) -> Caption {
    let first = members[0];
    let last = members[members.len() - 1];
    let text = members
        .iter()
        .map(|word| word.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    Caption {
        id,
        start: (first.start - anticipation).max(0.0),
        end: last.end,
        text,
    }
}
