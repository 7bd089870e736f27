//! Command layer for the narration player.
//!
//! Each command wires the core services together for one task: listing the
//! catalog, playing a chapter with live captions, or inspecting local files.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use narration_core::api::{BackendClient, Catalog};
use narration_core::cache::ResourceCache;
use narration_core::caption::{format_captions, format_timestamp, parse_captions};
use narration_core::config::{AppConfig, serialize_config};
use narration_core::library::{ChapterLibrary, Provenance};
use narration_core::playback::{ClockEvent, PlaybackClock, RodioTransport, Ticker};
use narration_core::remote::HttpTransport;
use narration_core::sentences::merge_sentences;
use narration_core::session::{ChapterRef, ChapterResolver, ChapterSession, ChapterState};
use narration_core::store::ChapterStateStore;
use narration_core::timeline::DisplayMode;
use narration_core::waveform::{Waveform, downsample_peaks, spawn_waveform_job};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::TryRecvError;
use tracing::{info, warn};

const WAVEFORM_COLUMNS: usize = 72;
const LEVELS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Narrated chapter player with live captions.
#[derive(Parser, Debug)]
#[command(name = "narration-player", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List books from the backend
    Books {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List chapters of a book (cached list when offline)
    Chapters {
        book_id: String,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Play a chapter with live captions
    Play {
        book_id: String,
        chapter_id: String,
        /// Show word-level captions
        #[arg(long, conflicts_with = "sentences")]
        words: bool,
        /// Show sentence-level captions
        #[arg(long)]
        sentences: bool,
    },
    /// Print an amplitude overview of an audio file
    Waveform {
        path: PathBuf,
        /// Number of peak buckets (defaults to config.waveform_buckets)
        #[arg(value_parser = parse_buckets)]
        buckets: Option<usize>,
    },
    /// Parse and print a caption file
    Captions {
        path: PathBuf,
        /// Merge words into sentences first
        #[arg(long)]
        sentences: bool,
    },
    /// Remove cached resources and chapter state
    ClearCache,
    /// Print the effective configuration
    Config,
}

fn parse_buckets(raw: &str) -> std::result::Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("`{raw}` is not a positive integer")),
    }
}

fn display_mode_override(words: bool, sentences: bool) -> Option<DisplayMode> {
    match (words, sentences) {
        (true, _) => Some(DisplayMode::Word),
        (false, true) => Some(DisplayMode::Sentence),
        (false, false) => None,
    }
}

/// Services shared by the networked commands.
struct Services {
    library: ChapterLibrary,
    resolver: Arc<ChapterResolver>,
    cache: Arc<ResourceCache>,
    store: Arc<ChapterStateStore>,
}

impl Services {
    fn open(config: &AppConfig) -> Result<Self> {
        let transport = Arc::new(
            HttpTransport::new(config.request_timeout()).context("Building HTTP client")?,
        );
        let catalog: Arc<dyn Catalog> =
            Arc::new(BackendClient::new(&config.api_base_url, transport.clone()));
        let cache = Arc::new(ResourceCache::new(config.cache_root(), transport));
        let store = Arc::new(ChapterStateStore::open_dir(config.state_root()));
        let resolver = Arc::new(ChapterResolver::new(
            catalog.clone(),
            cache.clone(),
            store.clone(),
            config.sentence_anticipation_secs,
        ));
        Ok(Self {
            library: ChapterLibrary::new(catalog, store.clone()),
            resolver,
            cache,
            store,
        })
    }
}

pub fn run_command(command: Command, config: &AppConfig) -> Result<()> {
    match command {
        Command::Books { json } => list_books(config, json),
        Command::Chapters { book_id, json } => list_chapters(config, &book_id, json),
        Command::Play {
            book_id,
            chapter_id,
            words,
            sentences,
        } => play(
            config,
            ChapterRef::new(book_id, chapter_id),
            display_mode_override(words, sentences),
        ),
        Command::Waveform { path, buckets } => {
            print_waveform(path, buckets.unwrap_or(config.waveform_buckets))
        }
        Command::Captions { path, sentences } => print_captions(config, &path, sentences),
        Command::ClearCache => clear_cache(config),
        Command::Config => {
            print!("{}", serialize_config(config).context("Serializing config")?);
            Ok(())
        }
    }
}

fn list_books(config: &AppConfig, json: bool) -> Result<()> {
    let services = Services::open(config)?;
    let books = services.library.books()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&books)?);
        return Ok(());
    }
    for book in &books {
        println!("{}\t{}", book.id, book.title);
    }
    Ok(())
}

fn list_chapters(config: &AppConfig, book_id: &str, json: bool) -> Result<()> {
    let services = Services::open(config)?;
    let listing = services.library.chapters(book_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&listing.chapters)?);
        return Ok(());
    }
    if let Provenance::Cached { resolved_at } = listing.provenance {
        println!("(offline: cached list from unix time {resolved_at})");
    }
    for chapter in &listing.chapters {
        let number = chapter
            .chapter_number
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut flags = Vec::new();
        if chapter.audio_available {
            flags.push("audio");
        }
        if chapter.subtitles_available {
            flags.push("subtitles");
        }
        println!(
            "{}\t{}\t{}\t[{}]",
            chapter.id,
            number,
            chapter.title,
            flags.join(",")
        );
    }
    Ok(())
}

fn play(config: &AppConfig, chapter: ChapterRef, mode: Option<DisplayMode>) -> Result<()> {
    let services = Services::open(config)?;
    let mut session = ChapterSession::new(services.resolver.clone());
    session.open(chapter.clone());

    let load_timeout = config.request_timeout() * 4;
    let ready = match session.wait(load_timeout) {
        ChapterState::Ready(ready) => ready.clone(),
        ChapterState::NoAudio => return Err(narration_core::Error::NoAudio.into()),
        ChapterState::Error(message) => bail!("{message}"),
        ChapterState::Loading { .. } | ChapterState::Idle => {
            bail!("Timed out loading chapter {chapter}")
        }
    };

    match ready.provenance {
        Provenance::Live => println!("{} (live)", ready.title),
        Provenance::Cached { resolved_at } => {
            println!("{} (offline: cached at unix time {resolved_at})", ready.title)
        }
    }
    if ready.subtitle_text.is_none() {
        println!("(no captions for this chapter)");
    }

    let waveform_job = spawn_waveform_job(ready.audio_path.clone(), config.waveform_buckets);
    let mut waveform_pending = true;

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        info!("Received Ctrl+C; stopping playback");
        flag.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to install Ctrl+C signal handler: {err}");
    }

    let transport = RodioTransport::new(config.volume)?;
    let mut clock = PlaybackClock::new(transport, mode.unwrap_or(config.display_mode));
    clock.load(&ready.audio_path, ready.captions.clone())?;
    clock.play()?;

    let mut ticker = Ticker::new(config.tick_interval());
    'playback: while running.load(Ordering::SeqCst) {
        for event in clock.tick() {
            match event {
                ClockEvent::CaptionChanged {
                    caption: Some(caption),
                    ..
                } => println!("[{}] {}", format_timestamp(caption.start), caption.text),
                ClockEvent::CaptionChanged { caption: None, .. } => {}
                ClockEvent::Completed => {
                    println!("(end of chapter)");
                    break 'playback;
                }
            }
        }
        if waveform_pending {
            match waveform_job.try_recv() {
                Ok(Ok(waveform)) => {
                    if !waveform.duration.is_zero() {
                        clock.set_duration(waveform.duration);
                    }
                    println!("{}", render_waveform(&waveform, WAVEFORM_COLUMNS));
                    waveform_pending = false;
                }
                Ok(Err(_)) | Err(TryRecvError::Disconnected) => waveform_pending = false,
                Err(TryRecvError::Empty) => {}
            }
        }
        ticker.wait();
    }
    clock.stop();
    info!(%chapter, "Playback finished");
    Ok(())
}

fn print_waveform(path: PathBuf, buckets: usize) -> Result<()> {
    let job = spawn_waveform_job(path.clone(), buckets);
    let waveform = job
        .recv()
        .map_err(|_| anyhow!("Waveform worker exited without a result"))?
        .with_context(|| format!("Extracting waveform from {}", path.display()))?;
    println!(
        "{} buckets over {}",
        waveform.samples.len(),
        format_timestamp(waveform.duration.as_secs_f64())
    );
    println!("{}", render_waveform(&waveform, WAVEFORM_COLUMNS));
    Ok(())
}

fn print_captions(config: &AppConfig, path: &Path, sentences: bool) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    let words = parse_captions(&bytes)?;
    let captions = if sentences {
        merge_sentences(&words, config.sentence_anticipation_secs)
    } else {
        words
    };
    print!("{}", format_captions(&captions));
    Ok(())
}

fn clear_cache(config: &AppConfig) -> Result<()> {
    let services = Services::open(config)?;
    services.cache.clear()?;
    services.store.clear_all();
    println!(
        "Cleared {} and chapter state in {}",
        services.cache.root().display(),
        config.state_root().display()
    );
    Ok(())
}

/// One line of block characters, one per column.
fn render_waveform(waveform: &Waveform, columns: usize) -> String {
    downsample_peaks(&waveform.samples, columns.max(1))
        .iter()
        .map(|peak| {
            let level = (peak.clamp(0.0, 1.0) * (LEVELS.len() - 1) as f32).round() as usize;
            LEVELS[level.min(LEVELS.len() - 1)]
        })
        .collect()
}
