//! Playback clock: drives an audio transport and reports caption changes.
//!
//! The clock is ticked on a fixed interval by its owner. Each tick reads the
//! transport position, looks up the active caption in the current display
//! mode's track, and emits an event only when that caption's identity moves.

use crate::caption::Caption;
use crate::error::{Error, Result};
use crate::timeline::{ChapterCaptions, DisplayMode};
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper seek bound while the source duration is unknown (one week).
const MAX_UNKNOWN_DURATION_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Minimal control surface over an audio output.
pub trait AudioTransport {
    /// Prepare `path` paused at the start. Returns the total duration when known.
    fn load(&mut self, path: &Path) -> Result<Option<Duration>>;
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self);
    fn seek(&mut self, position: Duration) -> Result<()>;
    fn stop(&mut self);
    fn position(&self) -> Duration;
    /// True once the loaded source has played to its end.
    fn is_finished(&self) -> bool;
}

pub struct RodioTransport {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Sink,
    path: Option<PathBuf>,
    volume: f32,
    started_at: Option<Instant>,
    elapsed: Duration,
}

impl RodioTransport {
    pub fn new(volume: f32) -> Result<Self> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|err| Error::AudioOutput(err.to_string()))?;
        let sink = Sink::try_new(&handle).map_err(|err| Error::AudioOutput(err.to_string()))?;
        sink.pause();
        sink.set_volume(volume);
        info!(volume, "Opened audio output");
        Ok(Self {
            _stream: stream,
            handle,
            sink,
            path: None,
            volume,
            started_at: None,
            elapsed: Duration::ZERO,
        })
    }

    /// Replace the sink with a fresh paused one holding the loaded file.
    fn rebuild_sink(&mut self) -> Result<Option<Duration>> {
        let path = self.path.clone().ok_or(Error::NoAudio)?;
        let file = File::open(&path).map_err(|source| Error::LocalRead {
            path: path.clone(),
            source,
        })?;
        let decoder = Decoder::new(BufReader::new(file))
            .map_err(|err| Error::UnreadableResource(err.to_string()))?;
        let total = decoder.total_duration();

        let sink =
            Sink::try_new(&self.handle).map_err(|err| Error::AudioOutput(err.to_string()))?;
        sink.pause();
        sink.set_volume(self.volume);
        sink.append(decoder);
        self.sink = sink;
        self.started_at = None;
        self.elapsed = Duration::ZERO;
        Ok(total)
    }

    fn fold_elapsed(&mut self) {
        if let Some(started) = self.started_at.take() {
            self.elapsed += Instant::now().saturating_duration_since(started);
        }
    }
}

impl AudioTransport for RodioTransport {
    fn load(&mut self, path: &Path) -> Result<Option<Duration>> {
        self.sink.stop();
        self.path = Some(path.to_path_buf());
        let total = self.rebuild_sink()?;
        debug!(path = %path.display(), ?total, "Loaded audio");
        Ok(total)
    }

    fn play(&mut self) -> Result<()> {
        if self.sink.empty() {
            self.rebuild_sink()?;
        }
        self.sink.play();
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&mut self) {
        self.sink.pause();
        self.fold_elapsed();
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        let playing = self.started_at.is_some();
        if self.sink.empty() {
            self.rebuild_sink()?;
            if playing {
                self.sink.play();
            }
        }
        self.sink
            .try_seek(position)
            .map_err(|err| Error::AudioOutput(err.to_string()))?;
        self.elapsed = position;
        self.started_at = playing.then(Instant::now);
        Ok(())
    }

    fn stop(&mut self) {
        self.sink.stop();
        self.started_at = None;
        self.elapsed = Duration::ZERO;
    }

    fn position(&self) -> Duration {
        match self.started_at {
            Some(started) => self.elapsed + Instant::now().saturating_duration_since(started),
            None => self.elapsed,
        }
    }

    fn is_finished(&self) -> bool {
        self.path.is_some() && self.sink.empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockState {
    Stopped,
    Playing,
    Paused,
    /// A seek was issued; the next tick settles it.
    Seeking { resume: bool },
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClockEvent {
    CaptionChanged {
        mode: DisplayMode,
        index: Option<usize>,
        caption: Option<Caption>,
    },
    Completed,
}

pub struct PlaybackClock<T: AudioTransport> {
    transport: T,
    captions: ChapterCaptions,
    mode: DisplayMode,
    state: ClockState,
    duration: Option<Duration>,
    /// `None` until the first evaluation after a load or mode switch.
    last_signaled: Option<Option<usize>>,
}

impl<T: AudioTransport> PlaybackClock<T> {
    pub fn new(transport: T, mode: DisplayMode) -> Self {
        Self {
            transport,
            captions: ChapterCaptions::default(),
            mode,
            state: ClockState::Stopped,
            duration: None,
            last_signaled: None,
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Supply a duration learned after load, e.g. from a full decode, for
    /// sources whose header carries none.
    pub fn set_duration(&mut self, duration: Duration) {
        if self.duration.is_none() {
            debug!(?duration, "Duration learned after load");
            self.duration = Some(duration);
        }
    }

    pub fn captions(&self) -> &ChapterCaptions {
        &self.captions
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Load a chapter's audio and caption tracks, paused at the start.
    pub fn load(&mut self, audio: &Path, captions: ChapterCaptions) -> Result<()> {
        self.transport.stop();
        self.duration = self.transport.load(audio)?;
        self.captions = captions;
        self.state = ClockState::Paused;
        self.last_signaled = None;
        info!(
            path = %audio.display(),
            duration = ?self.duration,
            words = self.captions.track(DisplayMode::Word).len(),
            sentences = self.captions.track(DisplayMode::Sentence).len(),
            "Playback loaded"
        );
        Ok(())
    }

    /// Position in seconds, clamped to `[0, duration]`.
    pub fn position(&self) -> f64 {
        self.clamp_secs(self.transport.position().as_secs_f64())
    }

    pub fn current_caption(&self) -> Option<&Caption> {
        self.captions.track(self.mode).active(self.position())
    }

    pub fn play(&mut self) -> Result<()> {
        match self.state {
            ClockState::Playing => return Ok(()),
            ClockState::Seeking { .. } => {
                self.state = ClockState::Seeking { resume: true };
                return Ok(());
            }
            ClockState::Finished => {
                self.transport.seek(Duration::ZERO)?;
                self.last_signaled = None;
            }
            ClockState::Stopped | ClockState::Paused => {}
        }
        self.transport.play()?;
        self.state = ClockState::Playing;
        debug!("Playback started");
        Ok(())
    }

    pub fn pause(&mut self) {
        match self.state {
            ClockState::Playing => {
                self.transport.pause();
                self.state = ClockState::Paused;
                debug!(position = self.position(), "Playback paused");
            }
            ClockState::Seeking { resume: true } => {
                self.transport.pause();
                self.state = ClockState::Seeking { resume: false };
            }
            _ => {}
        }
    }

    pub fn toggle(&mut self) -> Result<()> {
        match self.state {
            ClockState::Playing | ClockState::Seeking { resume: true } => {
                self.pause();
                Ok(())
            }
            _ => self.play(),
        }
    }

    /// Seek to `seconds`, clamped into the loaded duration. Caption changes
    /// are re-evaluated immediately.
    pub fn seek(&mut self, seconds: f64) -> Result<Vec<ClockEvent>> {
        let target = self.clamp_secs(seconds);
        let resume = matches!(
            self.state,
            ClockState::Playing | ClockState::Seeking { resume: true }
        );
        let previous = self.state;
        self.state = ClockState::Seeking { resume };
        let result = Duration::try_from_secs_f64(target)
            .map_err(|err| Error::AudioOutput(format!("seek target {target}s: {err}")))
            .and_then(|position| self.transport.seek(position));
        if let Err(err) = result {
            warn!(target, "Seek failed: {err}");
            self.state = previous;
            return Err(err);
        }
        debug!(target, resume, "Seeking");
        Ok(self.evaluate().into_iter().collect())
    }

    pub fn seek_relative(&mut self, delta: f64) -> Result<Vec<ClockEvent>> {
        self.seek(self.position() + delta)
    }

    /// Stop without signaling completion.
    pub fn stop(&mut self) {
        self.transport.stop();
        self.state = ClockState::Stopped;
        self.last_signaled = None;
        debug!("Playback stopped");
    }

    /// Switch tracks and force a fresh lookup in the new one.
    pub fn set_display_mode(&mut self, mode: DisplayMode) -> Vec<ClockEvent> {
        self.mode = mode;
        self.last_signaled = None;
        debug!(%mode, "Display mode changed");
        self.evaluate().into_iter().collect()
    }

    pub fn toggle_display_mode(&mut self) -> Vec<ClockEvent> {
        self.set_display_mode(self.mode.toggled())
    }

    /// One clock step. Completion is only reported while actively playing,
    /// never on the tick that settles a seek.
    pub fn tick(&mut self) -> Vec<ClockEvent> {
        let mut events = Vec::new();
        let settling = match self.state {
            ClockState::Seeking { resume } => {
                self.state = if resume {
                    ClockState::Playing
                } else {
                    ClockState::Paused
                };
                true
            }
            _ => false,
        };
        if self.state == ClockState::Stopped {
            return events;
        }

        events.extend(self.evaluate());

        if !settling && self.state == ClockState::Playing && self.transport.is_finished() {
            self.state = ClockState::Finished;
            info!("Playback completed");
            events.push(ClockEvent::Completed);
        }
        events
    }

    fn evaluate(&mut self) -> Option<ClockEvent> {
        let t = self.position();
        let track = self.captions.track(self.mode);
        let index = track.active_index(t);
        if self.last_signaled == Some(index) {
            return None;
        }
        self.last_signaled = Some(index);
        Some(ClockEvent::CaptionChanged {
            mode: self.mode,
            index,
            caption: index.and_then(|idx| track.get(idx)).cloned(),
        })
    }

    fn clamp_secs(&self, seconds: f64) -> f64 {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        let upper = self
            .duration
            .map(|duration| duration.as_secs_f64())
            .unwrap_or(MAX_UNKNOWN_DURATION_SECS);
        seconds.min(upper)
    }
}

/// Fixed-rate ticker for the clock loop.
pub struct Ticker {
    interval: Duration,
    next: Instant,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now() + interval,
        }
    }

    /// Sleep until the next deadline. Missed deadlines are skipped, not queued.
    pub fn wait(&mut self) {
        let now = Instant::now();
        if self.next > now {
            thread::sleep(self.next - now);
            self.next += self.interval;
        } else {
            self.next = now + self.interval;
        }
    }
}
