//! Caption records and the block-structured caption-track parser.
//!
//! A track is a sequence of blocks separated by blank lines:
//!
//! ```text
//! 1
//! 00:00:01,000 --> 00:00:02,500
//! Hello world
//! ```
//!
//! Blocks that do not follow this shape are dropped with a trace log; only
//! undecodable input is an error.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

static RE_TIMING_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d{2,}):(\d{2}):(\d{2}),(\d{3})\s*-->\s*(\d{2,}):(\d{2}):(\d{2}),(\d{3})\s*$")
        .unwrap()
});

/// One timed text unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caption {
    pub id: u32,
    /// Seconds from the start of the audio.
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl Caption {
    pub fn new(id: u32, start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            id,
            start,
            end,
            text: text.into(),
        }
    }

    /// Inclusive on both ends.
    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockSkip {
    TooFewLines,
    BadIndex,
    BadTiming,
}

/// Decode raw caption bytes as UTF-8 and parse them.
pub fn parse_captions(bytes: &[u8]) -> Result<Vec<Caption>> {
    let text = std::str::from_utf8(bytes).map_err(|err| Error::DecodeFailure(err.to_string()))?;
    Ok(parse_caption_text(text))
}

/// Parse caption text into captions sorted by start time.
///
/// Input order is not trusted; the output is re-sorted (stable for equal
/// start times).
pub fn parse_caption_text(text: &str) -> Vec<Caption> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut captions = Vec::new();
    let mut skipped = 0usize;

    for (block_idx, block) in split_blocks(text).iter().enumerate() {
        match parse_block(block) {
            Ok(caption) => captions.push(caption),
            Err(reason) => {
                skipped += 1;
                trace!(block = block_idx, ?reason, "Skipping malformed caption block");
            }
        }
    }

    captions.sort_by(|a, b| a.start.total_cmp(&b.start));
    debug!(
        parsed = captions.len(),
        skipped, "Parsed caption track"
    );
    captions
}

/// Render captions back into the block format.
pub fn format_captions(captions: &[Caption]) -> String {
    let mut out = String::new();
    for caption in captions {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n",
            caption.id,
            format_timestamp(caption.start),
            format_timestamp(caption.end),
            caption.text
        ));
    }
    out
}

pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_sec = total_ms / 1000;
    let s = total_sec % 60;
    let total_min = total_sec / 60;
    let m = total_min % 60;
    let h = total_min / 60;
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

fn split_blocks(text: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }

    if !current.is_empty() {
        blocks.push(current);
    }

    blocks
}

fn parse_block(lines: &[&str]) -> Result<Caption, BlockSkip> {
    if lines.len() < 3 {
        return Err(BlockSkip::TooFewLines);
    }
    let id = lines[0]
        .trim()
        .trim_start_matches('\u{feff}')
        .parse::<u32>()
        .map_err(|_| BlockSkip::BadIndex)?;
    let (start, end) = parse_timing_line(lines[1]).ok_or(BlockSkip::BadTiming)?;
    let text = lines[2..]
        .iter()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");

    Ok(Caption {
        id,
        start,
        end,
        text,
    })
}

fn parse_timing_line(line: &str) -> Option<(f64, f64)> {
    let caps = RE_TIMING_LINE.captures(line)?;
    let field = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u64>().ok());
    let start = timestamp_secs(field(1)?, field(2)?, field(3)?, field(4)?)?;
    let end = timestamp_secs(field(5)?, field(6)?, field(7)?, field(8)?)?;
    if end < start {
        return None;
    }
    Some((start, end))
}

fn timestamp_secs(hours: u64, minutes: u64, seconds: u64, millis: u64) -> Option<f64> {
    if minutes >= 60 || seconds >= 60 {
        return None;
    }
    let total_ms = ((hours * 60 + minutes) * 60 + seconds) * 1000 + millis;
    Some(total_ms as f64 / 1000.0)
}
