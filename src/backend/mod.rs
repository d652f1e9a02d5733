use crate::model::{BackendKind, Settings};
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;

pub mod local;
pub mod mpv;
pub mod null;

pub use local::LocalBackend;
pub use mpv::{MpvBackend, MpvOptions};
pub use null::NullBackend;

/// Everything a backend can report back to the player.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    TimeUpdate { current: f64, duration: f64 },
    /// The current source finished and nothing was queued behind it.
    Ended,
    /// The engine moved to its preloaded next source on its own.
    AutoAdvanced,
    Playing,
    Paused,
    Loading,
    Ready,
    Error(String),
    /// The engine cannot continue; the player should switch to the in-process engine.
    FallbackRequested(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub generation: u64,
    /// Load epoch current when the event was emitted.
    pub load: u64,
    pub event: BackendEvent,
}

impl TaggedEvent {
    /// Engine-wide events stay relevant across track loads.
    pub fn outlives_load(&self) -> bool {
        matches!(self.event, BackendEvent::FallbackRequested(_))
    }
}

/// Handle a backend uses to emit events.
///
/// Events carry the backend instance's generation plus the load epoch the owner
/// bumps whenever it replaces the current source, so both retired engines and
/// superseded loads can be told apart on the receiving side.
#[derive(Debug, Clone)]
pub struct EventSender {
    generation: u64,
    load: Arc<AtomicU64>,
    tx: Sender<TaggedEvent>,
}

impl EventSender {
    pub fn new(generation: u64, tx: Sender<TaggedEvent>) -> Self {
        Self {
            generation,
            load: Arc::new(AtomicU64::new(0)),
            tx,
        }
    }

    pub fn with_load_epoch(mut self, load: Arc<AtomicU64>) -> Self {
        self.load = load;
        self
    }

    pub fn emit(&self, event: BackendEvent) {
        let _ = self.tx.send(TaggedEvent {
            generation: self.generation,
            load: self.load.load(Ordering::SeqCst),
            event,
        });
    }
}

/// Transport surface shared by both engines.
///
/// Commands are best effort: an `Err` means the request could not be issued, while
/// the actual outcome always arrives as a [`BackendEvent`].
pub trait PlaybackBackend {
    fn kind(&self) -> BackendKind;

    /// Engines that need a process or device handshake override this; failure is a
    /// plain `false` so the caller can fall back.
    fn initialize(&mut self) -> bool {
        true
    }

    fn play(&mut self, url: &str) -> Result<()>;
    fn set_queue(&mut self, current: &str, next: Option<&str>, start_paused: bool) -> Result<()>;
    fn set_queue_next(&mut self, next: Option<&str>) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn seek(&mut self, seconds: f64) -> Result<()>;
    fn set_volume(&mut self, volume: f32) -> Result<()>;

    /// Polls engine primitives; called from the player's loop.
    fn tick(&mut self) {}

    fn current_time(&self) -> f64;
    fn duration(&self) -> f64;
    fn volume(&self) -> f32;
    fn is_playing(&self) -> bool;

    /// Releases every resource and stops emitting events. Safe to call twice.
    fn destroy(&mut self);
}

pub trait BackendFactory {
    fn create(&mut self, kind: BackendKind, events: EventSender) -> Box<dyn PlaybackBackend>;
}

impl<F> BackendFactory for F
where
    F: FnMut(BackendKind, EventSender) -> Box<dyn PlaybackBackend>,
{
    fn create(&mut self, kind: BackendKind, events: EventSender) -> Box<dyn PlaybackBackend> {
        self(kind, events)
    }
}

/// Builds the real engines. The in-process engine degrades to a silent clock when
/// no audio output can be opened so that it is always available.
#[derive(Debug, Clone, Default)]
pub struct DefaultBackendFactory {
    mpv: MpvOptions,
}

impl DefaultBackendFactory {
    pub fn new(mpv: MpvOptions) -> Self {
        Self { mpv }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut mpv = MpvOptions::default();
        if let Some(path) = &settings.mpv_path {
            mpv.binary = path.clone();
        }
        mpv.extra_args = settings.mpv_args.clone();
        mpv.volume = settings.volume;
        Self::new(mpv)
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(&mut self, kind: BackendKind, events: EventSender) -> Box<dyn PlaybackBackend> {
        match kind {
            BackendKind::Local => match LocalBackend::new(events.clone()) {
                Ok(backend) => Box::new(backend),
                Err(err) => {
                    log::warn!("audio output unavailable, playing silently: {err:#}");
                    Box::new(NullBackend::new(events))
                }
            },
            BackendKind::Mpv => Box::new(MpvBackend::new(self.mpv.clone(), events)),
        }
    }
}
