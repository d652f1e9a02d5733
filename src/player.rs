use crate::backend::{BackendEvent, BackendFactory, EventSender, PlaybackBackend, TaggedEvent};
use crate::catalog::CatalogClient;
use crate::config::SettingsStore;
use crate::model::{BackendKind, RepeatMode, Settings, Track};
use crate::queue::{PlayQueue, QueueUndo};
use crate::scrobble::ScrobbleTracker;
use crate::sync::{self, QueueSync};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;

/// Going back within this many seconds moves to the previous track; later it restarts.
pub const RESTART_THRESHOLD_SECONDS: f64 = 3.0;
const COVER_ART_SIZE: u32 = 300;

/// Everything a front end needs to render the player.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub queue: Vec<Track>,
    pub current_index: Option<usize>,
    pub current: Option<Track>,
    pub cover_url: Option<String>,
    pub is_playing: bool,
    pub is_loading: bool,
    pub current_time: f64,
    pub duration: f64,
    pub volume: f32,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub backend: BackendKind,
    pub fallback_active: bool,
    pub sync_enabled: bool,
    pub status: String,
}

/// Playback and queue state machine.
///
/// All mutation happens through the methods below on the owning thread. Backend
/// events are buffered in a channel and applied by [`Player::tick`].
pub struct Player {
    queue: PlayQueue,
    is_playing: bool,
    is_loading: bool,
    current_time: f64,
    duration: f64,
    volume: f32,
    repeat: RepeatMode,
    settings: Settings,
    settings_store: Box<dyn SettingsStore>,
    catalog: Box<dyn CatalogClient>,
    factory: Box<dyn BackendFactory>,
    backend: Option<Box<dyn PlaybackBackend>>,
    generation: u64,
    load_epoch: Arc<AtomicU64>,
    events_tx: Sender<TaggedEvent>,
    events_rx: Receiver<TaggedEvent>,
    fallback_active: bool,
    source_loaded: bool,
    loading_track: Option<String>,
    scrobble: ScrobbleTracker,
    sync: QueueSync,
    rng: SmallRng,
    subscribers: Vec<Sender<PlayerSnapshot>>,
    status: String,
    dirty: bool,
}

impl Player {
    pub fn new(
        factory: Box<dyn BackendFactory>,
        catalog: Box<dyn CatalogClient>,
        settings_store: Box<dyn SettingsStore>,
    ) -> Self {
        let settings = match settings_store.load() {
            Ok(settings) => settings,
            Err(err) => {
                log::warn!("using default settings: {err:#}");
                Settings::default()
            }
        };
        let (events_tx, events_rx) = mpsc::channel();

        Self {
            queue: PlayQueue::new(),
            is_playing: false,
            is_loading: false,
            current_time: 0.0,
            duration: 0.0,
            volume: settings.volume.clamp(0.0, 1.0),
            repeat: settings.repeat,
            settings,
            settings_store,
            catalog,
            factory,
            backend: None,
            generation: 0,
            load_epoch: Arc::new(AtomicU64::new(0)),
            events_tx,
            events_rx,
            fallback_active: false,
            source_loaded: false,
            loading_track: None,
            scrobble: ScrobbleTracker::new(),
            sync: QueueSync::default(),
            rng: SmallRng::try_from_rng(&mut rand::rngs::SysRng).expect("OS RNG unavailable"),
            subscribers: Vec::new(),
            status: String::from("Ready"),
            dirty: false,
        }
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn queue(&self) -> &PlayQueue {
        &self.queue
    }

    pub fn catalog(&self) -> &dyn CatalogClient {
        self.catalog.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn fallback_active(&self) -> bool {
        self.fallback_active
    }

    pub fn active_backend(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|backend| backend.kind())
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        let current = self.queue.current().cloned();
        let cover_url = current
            .as_ref()
            .and_then(|track| track.cover_art.as_deref())
            .and_then(|cover| self.catalog.cover_art_url(cover, COVER_ART_SIZE).ok());

        PlayerSnapshot {
            queue: self.queue.to_vec(),
            current_index: self.queue.current_index(),
            current,
            cover_url,
            is_playing: self.is_playing,
            is_loading: self.is_loading,
            current_time: self.current_time,
            duration: self.duration,
            volume: self.volume,
            shuffle: self.queue.is_shuffled(),
            repeat: self.repeat,
            backend: self.active_backend().unwrap_or(self.settings.backend),
            fallback_active: self.fallback_active,
            sync_enabled: self.sync.is_enabled(),
            status: self.status.clone(),
        }
    }

    /// Receives a fresh snapshot after every change.
    pub fn subscribe(&mut self) -> Receiver<PlayerSnapshot> {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(self.snapshot());
        self.subscribers.push(tx);
        rx
    }

    pub fn play_track(&mut self, track: Track, queue: Option<Vec<Track>>, index: Option<usize>) {
        let (tracks, index) = match queue {
            Some(tracks) if !tracks.is_empty() => {
                let index = index
                    .filter(|index| *index < tracks.len())
                    .or_else(|| tracks.iter().position(|candidate| candidate.id == track.id))
                    .unwrap_or(0);
                (tracks, index)
            }
            _ => (vec![track], 0),
        };

        let shuffle = self.queue.is_shuffled();
        self.queue.replace(tracks, index, shuffle, &mut self.rng);
        self.start_current();
        self.publish();
    }

    /// Jumps to an existing queue position.
    pub fn play_index(&mut self, index: usize) -> bool {
        if !self.queue.set_current(index) {
            return false;
        }
        self.start_current();
        self.publish();
        true
    }

    pub fn play_next(&mut self) {
        let Some(current) = self.queue.current_index() else {
            return;
        };

        if self.repeat == RepeatMode::One {
            self.start_current();
        } else if current + 1 < self.queue.len() {
            self.queue.set_current(current + 1);
            self.start_current();
        } else if self.repeat == RepeatMode::All {
            self.queue.set_current(0);
            self.start_current();
        } else {
            self.reach_end_of_queue();
        }
        self.publish();
    }

    pub fn play_previous(&mut self) {
        let Some(current) = self.queue.current_index() else {
            return;
        };

        if self.current_time > RESTART_THRESHOLD_SECONDS {
            self.scrobble.reset();
            self.seek_backend(0.0);
            self.status = String::from("Restarted track");
        } else {
            let target = if current > 0 {
                current - 1
            } else if self.repeat == RepeatMode::All {
                self.queue.len() - 1
            } else {
                0
            };
            self.queue.set_current(target);
            self.start_current();
        }
        self.publish();
    }

    pub fn seek(&mut self, seconds: f64) {
        if self.queue.is_empty() {
            return;
        }
        self.seek_backend(seconds);
        self.publish();
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        if let Some(backend) = self.backend.as_mut()
            && let Err(err) = backend.set_volume(self.volume)
        {
            log::warn!("set volume failed: {err:#}");
        }
        self.settings.volume = self.volume;
        self.persist_settings();
        self.status = format!("Volume: {}%", (self.volume * 100.0).round() as u16);
        self.dirty = true;
        self.publish();
    }

    /// Returns the new shuffle state.
    pub fn toggle_shuffle(&mut self) -> bool {
        let enabled = self.queue.toggle_shuffle(&mut self.rng);
        self.status = String::from(if enabled { "Shuffle on" } else { "Shuffle off" });
        self.refresh_next_slot();
        self.queue_changed();
        self.publish();
        enabled
    }

    pub fn toggle_repeat(&mut self) -> RepeatMode {
        self.set_repeat(self.repeat.next());
        self.repeat
    }

    pub fn set_repeat(&mut self, repeat: RepeatMode) {
        self.repeat = repeat;
        self.settings.repeat = repeat;
        self.persist_settings();
        self.status = format!("Repeat: {}", repeat.label());
        self.refresh_next_slot();
        self.dirty = true;
        self.publish();
    }

    pub fn add_to_queue(&mut self, tracks: Vec<Track>) {
        if tracks.is_empty() {
            return;
        }
        let count = tracks.len();
        self.queue.append(tracks);
        self.status = format!("Added {count} track(s) to queue");
        self.refresh_next_slot();
        self.queue_changed();
        self.publish();
    }

    /// Inserts `track` right after the current one.
    pub fn play_next_in_queue(&mut self, track: Track) {
        self.status = format!("Playing next: {}", track.display_name());
        self.queue.insert_next(track);
        self.refresh_next_slot();
        self.queue_changed();
        self.publish();
    }

    /// `None` when `index` is out of range or is the current track.
    pub fn remove_from_queue(&mut self, index: usize) -> Option<Track> {
        let removed = self.queue.remove(index)?;
        self.status = format!("Removed {}", removed.display_name());
        self.refresh_next_slot();
        self.queue_changed();
        self.publish();
        Some(removed)
    }

    pub fn insert_into_queue(&mut self, track: Track, index: usize) -> usize {
        let at = self.queue.insert(track, index);
        self.refresh_next_slot();
        self.queue_changed();
        self.publish();
        at
    }

    pub fn clear_queue(&mut self) -> Option<QueueUndo> {
        let undo = self.queue.clear()?;
        if self.queue.is_empty() {
            self.stop_backend();
            self.current_time = 0.0;
            self.duration = 0.0;
            self.scrobble.reset();
            self.status = String::from("Queue cleared");
        } else {
            self.refresh_next_slot();
            self.status = String::from("Cleared upcoming tracks");
        }
        self.queue_changed();
        self.publish();
        Some(undo)
    }

    pub fn undo_clear(&mut self, undo: QueueUndo) {
        self.queue.restore(undo);
        self.refresh_next_slot();
        self.status = String::from("Queue restored");
        self.queue_changed();
        self.publish();
    }

    pub fn pause(&mut self) {
        if let Some(backend) = self.backend.as_mut()
            && let Err(err) = backend.pause()
        {
            log::warn!("pause failed: {err:#}");
        }
        self.is_playing = false;
        self.status = String::from("Paused");
        self.queue_changed();
        self.publish();
    }

    /// Reloads the current track at the current position when no source is loaded.
    pub fn resume(&mut self) {
        let Some(track_id) = self.queue.current().map(|track| track.id.clone()) else {
            return;
        };

        if self.source_loaded && self.backend.is_some() {
            if let Some(backend) = self.backend.as_mut()
                && let Err(err) = backend.resume()
            {
                log::warn!("resume failed: {err:#}");
            }
            self.is_playing = true;
            self.report_now_playing(&track_id);
        } else {
            self.load_current(false, self.current_time);
        }
        self.status = String::from("Playing");
        self.dirty = true;
        self.publish();
    }

    pub fn toggle_play_pause(&mut self) {
        if self.is_playing {
            self.pause();
        } else {
            self.resume();
        }
    }

    pub fn stop(&mut self) {
        self.stop_backend();
        self.current_time = 0.0;
        self.status = String::from("Stopped");
        self.publish();
    }

    /// Swaps the engine and resumes where the old one was.
    pub fn set_backend(&mut self, kind: BackendKind) {
        if self.settings.backend == kind && !self.fallback_active && self.backend.is_some() {
            self.status = format!("Already using {} backend", kind.label());
            self.dirty = true;
            self.publish();
            return;
        }

        let was_playing = self.is_playing;
        let position = self.current_time;
        self.teardown_backend();

        self.settings.backend = kind;
        self.persist_settings();
        self.fallback_active = false;
        self.ensure_backend();

        if self.queue.current().is_some() && was_playing {
            self.load_current(false, position);
        }
        if !self.fallback_active {
            self.status = format!("Switched to {} backend", kind.label());
        }
        self.dirty = true;
        self.publish();
    }

    /// Drives the cooperative loop: backend polling, event delivery, sync pushes.
    pub fn tick(&mut self, now: Instant) {
        if let Some(backend) = self.backend.as_mut() {
            backend.tick();
        }

        while let Ok(tagged) = self.events_rx.try_recv() {
            if tagged.generation != self.generation {
                log::debug!("dropping event from retired backend {}", tagged.generation);
                continue;
            }
            if tagged.load != self.load_epoch.load(Ordering::SeqCst) && !tagged.outlives_load() {
                log::debug!("dropping {:?} from superseded load", tagged.event);
                continue;
            }
            self.handle_event(tagged.event);
        }

        if self.sync.take_due(now) {
            self.push_queue();
        }
        self.publish();
    }

    pub fn enable_sync(&mut self) {
        self.sync.enable();
        self.dirty = true;
        self.publish();
    }

    /// Pulls the server play queue once per session without starting playback.
    pub fn restore_from_server(&mut self) -> bool {
        if !self.sync.begin_restore() {
            return false;
        }
        let remote = match self.catalog.get_play_queue() {
            Ok(Some(remote)) if !remote.tracks.is_empty() => remote,
            Ok(_) => return false,
            Err(err) => {
                log::warn!("failed to fetch saved play queue: {err:#}");
                self.status = String::from("Could not restore play queue");
                self.dirty = true;
                self.publish();
                return false;
            }
        };

        let index = remote
            .current_id
            .as_deref()
            .and_then(|id| remote.tracks.iter().position(|track| track.id == id))
            .unwrap_or(0);
        let position = remote.position_ms.map_or(0.0, |ms| ms as f64 / 1000.0);
        let count = remote.tracks.len();

        self.queue.replace(remote.tracks, index, false, &mut self.rng);
        self.scrobble.reset();
        self.load_current(true, position);
        self.current_time = position;
        self.status = format!("Restored {count} track(s) from server");
        self.dirty = true;
        self.publish();
        true
    }

    /// Flushes the queue to the server and releases the backend.
    pub fn shutdown(&mut self) {
        if self.sync.take_teardown(&self.queue) {
            self.push_queue();
        }
        self.teardown_backend();
        self.publish();
    }

    fn handle_event(&mut self, event: BackendEvent) {
        self.dirty = true;
        match event {
            BackendEvent::TimeUpdate { current, duration } => {
                self.current_time = current;
                if duration > 0.0 {
                    self.duration = duration;
                }
                self.maybe_submit_scrobble();
            }
            BackendEvent::Ended => {
                // The engine has nothing loaded any more; resuming must reload.
                self.source_loaded = false;
                self.current_time = 0.0;
                self.play_next();
            }
            BackendEvent::AutoAdvanced => self.follow_auto_advance(),
            BackendEvent::Playing if self.event_is_current() => {
                self.is_playing = true;
                self.is_loading = false;
            }
            BackendEvent::Paused => self.is_playing = false,
            BackendEvent::Loading if self.event_is_current() => self.is_loading = true,
            BackendEvent::Ready if self.event_is_current() => self.is_loading = false,
            BackendEvent::Error(message) => {
                log::warn!("playback error: {message}");
                self.is_loading = false;
                self.is_playing = false;
                self.status = format!("Playback error: {message}");
            }
            BackendEvent::FallbackRequested(reason) => self.fall_back(&reason),
            BackendEvent::Playing | BackendEvent::Loading | BackendEvent::Ready => {}
        }
    }

    /// Stale completions of a superseded load must not touch the newer state.
    fn event_is_current(&self) -> bool {
        self.loading_track.is_some()
            && self.loading_track.as_deref() == self.queue.current().map(|track| track.id.as_str())
    }

    fn follow_auto_advance(&mut self) {
        let Some(next) = self.queue.upcoming_index(self.repeat) else {
            return;
        };
        self.queue.set_current(next);
        let Some(track) = self.queue.current().cloned() else {
            return;
        };

        self.scrobble.reset();
        self.current_time = 0.0;
        self.duration = track.duration;
        self.loading_track = Some(track.id.clone());
        self.is_playing = true;
        self.report_now_playing(&track.id);
        self.refresh_next_slot();
        self.status = format!("Playing {}", track.display_name());
        self.queue_changed();
    }

    fn fall_back(&mut self, reason: &str) {
        log::warn!("backend failed ({reason}), switching to local playback");
        let was_playing = self.is_playing;
        let position = self.current_time;
        self.teardown_backend();

        self.fallback_active = true;
        self.ensure_backend();
        if self.queue.current().is_some() && was_playing {
            self.load_current(false, position);
        }
        self.status = String::from("Switched to local playback after backend failure");
    }

    fn start_current(&mut self) {
        self.scrobble.reset();
        self.load_current(false, 0.0);
        self.queue_changed();
    }

    fn reach_end_of_queue(&mut self) {
        if let Some(backend) = self.backend.as_mut()
            && let Err(err) = backend.pause()
        {
            log::warn!("pause at end of queue failed: {err:#}");
        }
        self.is_playing = false;
        self.is_loading = false;
        self.status = String::from("Reached end of queue");
        self.dirty = true;
    }

    fn load_current(&mut self, start_paused: bool, start_at: f64) {
        let Some(track) = self.queue.current().cloned() else {
            return;
        };
        self.retire_pending_events();
        let url = match self.catalog.stream_url(&track.id) {
            Ok(url) => url,
            Err(err) => {
                log::warn!("no stream for {}: {err:#}", track.id);
                self.is_loading = false;
                self.is_playing = false;
                self.status = format!("Cannot play {}", track.display_name());
                self.dirty = true;
                return;
            }
        };
        let next_url = self.upcoming_url();

        self.ensure_backend();
        let Some(backend) = self.backend.as_mut() else {
            return;
        };

        self.loading_track = Some(track.id.clone());
        self.current_time = start_at;
        self.duration = track.duration;
        self.is_loading = true;
        self.dirty = true;

        let start_at = start_at.max(0.0);
        let result = backend
            .set_queue(&url, next_url.as_deref(), start_paused)
            .and_then(|()| {
                if start_at > 0.0 {
                    backend.seek(start_at)
                } else {
                    Ok(())
                }
            });

        if let Err(err) = result {
            log::warn!("failed to start {}: {err:#}", track.id);
            self.source_loaded = false;
            self.is_loading = false;
            self.is_playing = false;
            self.status = format!("Playback failed: {err:#}");
            return;
        }

        self.source_loaded = true;
        self.is_playing = !start_paused;
        if !start_paused {
            self.report_now_playing(&track.id);
            self.status = format!("Playing {}", track.display_name());
        }
    }

    fn seek_backend(&mut self, seconds: f64) {
        let seconds = seconds.max(0.0);
        self.current_time = seconds;
        if self.source_loaded
            && let Some(backend) = self.backend.as_mut()
            && let Err(err) = backend.seek(seconds)
        {
            log::warn!("seek failed: {err:#}");
        }
        self.queue_changed();
    }

    /// Events already queued for the previous source must not touch the next one.
    fn retire_pending_events(&self) {
        self.load_epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_backend(&mut self) {
        self.retire_pending_events();
        if let Some(backend) = self.backend.as_mut()
            && let Err(err) = backend.stop()
        {
            log::warn!("stop failed: {err:#}");
        }
        self.source_loaded = false;
        self.loading_track = None;
        self.is_playing = false;
        self.is_loading = false;
        self.dirty = true;
    }

    fn upcoming_url(&self) -> Option<String> {
        let index = self.queue.upcoming_index(self.repeat)?;
        let track = self.queue.get(index)?;
        match self.catalog.stream_url(&track.id) {
            Ok(url) => Some(url),
            Err(err) => {
                log::debug!("no stream for upcoming {}: {err:#}", track.id);
                None
            }
        }
    }

    /// Keeps the engine's preloaded slot in step with the queue.
    fn refresh_next_slot(&mut self) {
        if !self.source_loaded {
            return;
        }
        let next_url = self.upcoming_url();
        if let Some(backend) = self.backend.as_mut()
            && let Err(err) = backend.set_queue_next(next_url.as_deref())
        {
            log::warn!("failed to preload next track: {err:#}");
        }
    }

    fn ensure_backend(&mut self) {
        if self.backend.is_some() {
            return;
        }
        let kind = if self.fallback_active {
            BackendKind::Local
        } else {
            self.settings.backend
        };

        let mut backend = self.create_backend(kind);
        if !backend.initialize() && kind != BackendKind::Local {
            log::warn!("{} backend failed to start, using local", kind.label());
            backend.destroy();
            self.fallback_active = true;
            self.status = format!("{} unavailable, using local playback", kind.label());
            backend = self.create_backend(BackendKind::Local);
            backend.initialize();
        }
        if let Err(err) = backend.set_volume(self.volume) {
            log::warn!("failed to apply volume: {err:#}");
        }
        log::info!("using {} backend", backend.kind().label());
        self.backend = Some(backend);
    }

    fn create_backend(&mut self, kind: BackendKind) -> Box<dyn PlaybackBackend> {
        self.generation += 1;
        let events = EventSender::new(self.generation, self.events_tx.clone())
            .with_load_epoch(Arc::clone(&self.load_epoch));
        self.factory.create(kind, events)
    }

    fn teardown_backend(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            if let Err(err) = backend.stop() {
                log::debug!("stop before teardown failed: {err:#}");
            }
            backend.destroy();
            log::info!("released {} backend", backend.kind().label());
        }
        // Anything still queued belongs to the retired instance.
        self.generation += 1;
        self.source_loaded = false;
        self.is_loading = false;
    }

    fn report_now_playing(&mut self, track_id: &str) {
        if self.scrobble.take_now_playing(track_id)
            && let Err(err) = self.catalog.scrobble(track_id, false)
        {
            log::warn!("now playing report failed: {err:#}");
        }
    }

    fn maybe_submit_scrobble(&mut self) {
        let Some(track_id) = self.queue.current().map(|track| track.id.clone()) else {
            return;
        };
        if self
            .scrobble
            .take_submission(&track_id, self.current_time, self.duration)
            && let Err(err) = self.catalog.scrobble(&track_id, true)
        {
            log::warn!("scrobble failed: {err:#}");
        }
    }

    fn push_queue(&mut self) {
        let saved = sync::snapshot(&self.queue, self.current_time);
        if saved.track_ids.is_empty() {
            return;
        }
        if let Err(err) = self.catalog.save_play_queue(&saved) {
            log::warn!("failed to save play queue: {err:#}");
        }
    }

    fn persist_settings(&mut self) {
        if let Err(err) = self.settings_store.save(&self.settings) {
            log::warn!("failed to save settings: {err:#}");
        }
    }

    fn queue_changed(&mut self) {
        self.sync.schedule(Instant::now());
        self.dirty = true;
    }

    fn publish(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        if self.subscribers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        self.subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.teardown_backend();
    }
}
