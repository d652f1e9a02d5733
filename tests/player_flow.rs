use anyhow::Result;
use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use subtune::backend::{BackendEvent, EventSender, NullBackend, PlaybackBackend};
use subtune::catalog::CatalogClient;
use subtune::config::{JsonSettingsStore, MemorySettingsStore};
use subtune::model::{BackendKind, RemotePlayQueue, RepeatMode, SavedPlayQueue, Track};
use subtune::player::Player;

#[derive(Default)]
struct Server {
    saved: Option<SavedPlayQueue>,
    scrobbles: Vec<(String, bool)>,
}

#[derive(Clone, Default)]
struct FakeServer(Rc<RefCell<Server>>);

impl CatalogClient for FakeServer {
    fn stream_url(&self, track_id: &str) -> Result<String> {
        Ok(format!("https://music.test/stream/{track_id}"))
    }

    fn cover_art_url(&self, cover_id: &str, size: u32) -> Result<String> {
        Ok(format!("https://music.test/cover/{cover_id}?size={size}"))
    }

    fn scrobble(&self, track_id: &str, submission: bool) -> Result<()> {
        self.0
            .borrow_mut()
            .scrobbles
            .push((track_id.to_string(), submission));
        Ok(())
    }

    fn get_play_queue(&self) -> Result<Option<RemotePlayQueue>> {
        Ok(self.0.borrow().saved.as_ref().map(|saved| RemotePlayQueue {
            tracks: saved
                .track_ids
                .iter()
                .map(|id| song(id))
                .collect(),
            current_id: saved.current_id.clone(),
            position_ms: saved.position_ms,
        }))
    }

    fn save_play_queue(&self, queue: &SavedPlayQueue) -> Result<()> {
        self.0.borrow_mut().saved = Some(queue.clone());
        Ok(())
    }

    fn get_song(&self, track_id: &str) -> Result<Track> {
        Ok(song(track_id))
    }
}

fn song(id: &str) -> Track {
    Track::new(id, format!("Song {id}")).with_duration(180.0)
}

fn songs(ids: &[&str]) -> Vec<Track> {
    ids.iter().map(|id| song(id)).collect()
}

/// Stands in for the external engine: keeps a two-slot playlist and lets the
/// test drive its push events.
#[derive(Default)]
struct EngineScript {
    commands: Vec<String>,
    events: Option<EventSender>,
}

struct ScriptedEngine {
    script: Rc<RefCell<EngineScript>>,
}

impl ScriptedEngine {
    fn record(&self, command: String) {
        self.script.borrow_mut().commands.push(command);
    }
}

impl PlaybackBackend for ScriptedEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Mpv
    }

    fn play(&mut self, url: &str) -> Result<()> {
        self.set_queue(url, None, false)
    }

    fn set_queue(&mut self, current: &str, next: Option<&str>, start_paused: bool) -> Result<()> {
        self.record(format!("queue {current} | {}", next.unwrap_or("-")));
        if let Some(events) = &self.script.borrow().events {
            events.emit(BackendEvent::Loading);
            events.emit(BackendEvent::Ready);
            events.emit(if start_paused {
                BackendEvent::Paused
            } else {
                BackendEvent::Playing
            });
        }
        Ok(())
    }

    fn set_queue_next(&mut self, next: Option<&str>) -> Result<()> {
        self.record(format!("next {}", next.unwrap_or("-")));
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.record(String::from("pause"));
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.record(String::from("resume"));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.record(String::from("stop"));
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        self.record(format!("seek {seconds}"));
        Ok(())
    }

    fn set_volume(&mut self, _volume: f32) -> Result<()> {
        Ok(())
    }

    fn current_time(&self) -> f64 {
        0.0
    }

    fn duration(&self) -> f64 {
        0.0
    }

    fn volume(&self) -> f32 {
        1.0
    }

    fn is_playing(&self) -> bool {
        false
    }

    fn destroy(&mut self) {
        self.record(String::from("destroy"));
        self.script.borrow_mut().events = None;
    }
}

fn silent_factory(
    track_length: Duration,
) -> impl FnMut(BackendKind, EventSender) -> Box<dyn PlaybackBackend> {
    move |_kind: BackendKind, events: EventSender| -> Box<dyn PlaybackBackend> {
        Box::new(NullBackend::new(events).with_track_length(track_length))
    }
}

fn scripted_player(server: &FakeServer) -> (Player, Rc<RefCell<EngineScript>>) {
    let script = Rc::new(RefCell::new(EngineScript::default()));
    let factory_script = Rc::clone(&script);
    let factory = move |kind: BackendKind, events: EventSender| -> Box<dyn PlaybackBackend> {
        match kind {
            BackendKind::Mpv => {
                factory_script.borrow_mut().events = Some(events);
                Box::new(ScriptedEngine {
                    script: Rc::clone(&factory_script),
                })
            }
            BackendKind::Local => Box::new(NullBackend::new(events)),
        }
    };
    let mut player = Player::new(
        Box::new(factory),
        Box::new(server.clone()),
        Box::new(MemorySettingsStore::default()),
    );
    player.set_backend(BackendKind::Mpv);
    (player, script)
}

fn push(script: &Rc<RefCell<EngineScript>>, event: BackendEvent) {
    let events = script.borrow().events.clone().expect("engine is live");
    events.emit(event);
}

fn tick_until(player: &mut Player, mut done: impl FnMut(&Player) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        player.tick(Instant::now());
        if done(player) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn silent_engine_plays_queue_to_the_end() {
    let server = FakeServer::default();
    let mut player = Player::new(
        Box::new(silent_factory(Duration::from_millis(30))),
        Box::new(server.clone()),
        Box::new(MemorySettingsStore::default()),
    );

    let queue = songs(&["a", "b", "c"]);
    player.play_track(queue[0].clone(), Some(queue), Some(0));

    let finished = tick_until(&mut player, |player| {
        player.queue().current_index() == Some(2) && !player.is_playing()
    });
    assert!(finished, "playback should reach the end of the queue");
    assert_eq!(player.snapshot().status, "Reached end of queue");

    let now_playing: Vec<String> = server
        .0
        .borrow()
        .scrobbles
        .iter()
        .filter(|(_, submission)| !submission)
        .map(|(id, _)| id.clone())
        .collect();
    assert_eq!(now_playing, vec!["a", "b", "c"]);
}

#[test]
fn repeat_all_keeps_cycling_on_silent_engine() {
    let server = FakeServer::default();
    let mut player = Player::new(
        Box::new(silent_factory(Duration::from_millis(20))),
        Box::new(server),
        Box::new(MemorySettingsStore::default()),
    );
    player.set_repeat(RepeatMode::All);
    let queue = songs(&["a", "b"]);
    player.play_track(queue[1].clone(), Some(queue), Some(1));

    assert!(tick_until(&mut player, |player| {
        player.queue().current_index() == Some(0)
    }));
    assert!(player.is_playing());
}

#[test]
fn external_engine_gapless_sequence_stays_in_step() {
    let server = FakeServer::default();
    let (mut player, script) = scripted_player(&server);

    let queue = songs(&["a", "b", "c"]);
    player.play_track(queue[0].clone(), Some(queue), Some(0));
    player.tick(Instant::now());

    push(&script, BackendEvent::AutoAdvanced);
    player.tick(Instant::now());
    push(&script, BackendEvent::AutoAdvanced);
    player.tick(Instant::now());
    assert_eq!(player.queue().current_index(), Some(2));
    assert!(player.is_playing());

    push(&script, BackendEvent::Ended);
    player.tick(Instant::now());
    assert_eq!(player.queue().current_index(), Some(2));
    assert!(!player.is_playing());

    let commands = script.borrow().commands.clone();
    assert_eq!(
        commands,
        vec![
            "queue https://music.test/stream/a | https://music.test/stream/b",
            "next https://music.test/stream/c",
            "next -",
            "pause",
        ]
    );
}

#[test]
fn engine_crash_falls_back_to_local_playback() {
    let server = FakeServer::default();
    let (mut player, script) = scripted_player(&server);

    let queue = songs(&["a", "b"]);
    player.play_track(queue[1].clone(), Some(queue), Some(1));
    player.tick(Instant::now());
    push(
        &script,
        BackendEvent::TimeUpdate {
            current: 75.0,
            duration: 180.0,
        },
    );
    push(&script, BackendEvent::FallbackRequested(String::from("socket closed")));
    player.tick(Instant::now());

    let snapshot = player.snapshot();
    assert!(snapshot.fallback_active);
    assert_eq!(snapshot.backend, BackendKind::Local);
    assert_eq!(snapshot.current_index, Some(1));
    assert_eq!(snapshot.queue.len(), 2);
    assert!(snapshot.is_playing);
    assert!(snapshot.current_time >= 75.0);
    assert!(script.borrow().commands.contains(&String::from("destroy")));
}

#[test]
fn settings_survive_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("settings.json");

    {
        let mut player = Player::new(
            Box::new(silent_factory(Duration::from_secs(60))),
            Box::new(FakeServer::default()),
            Box::new(JsonSettingsStore::new(path.clone())),
        );
        player.set_volume(0.35);
        player.set_repeat(RepeatMode::One);
    }

    let player = Player::new(
        Box::new(silent_factory(Duration::from_secs(60))),
        Box::new(FakeServer::default()),
        Box::new(JsonSettingsStore::new(path)),
    );
    let snapshot = player.snapshot();
    assert_eq!(snapshot.volume, 0.35);
    assert_eq!(snapshot.repeat, RepeatMode::One);
}

#[test]
fn play_queue_resumes_on_another_device() {
    let server = FakeServer::default();

    let mut first = Player::new(
        Box::new(silent_factory(Duration::from_secs(600))),
        Box::new(server.clone()),
        Box::new(MemorySettingsStore::default()),
    );
    first.enable_sync();
    let queue = songs(&["a", "b", "c"]);
    first.play_track(queue[2].clone(), Some(queue), Some(2));
    first.seek(95.25);
    first.shutdown();

    let saved = server.0.borrow().saved.clone().expect("pushed on teardown");
    assert_eq!(saved.track_ids, vec!["a", "b", "c"]);
    assert_eq!(saved.current_id.as_deref(), Some("c"));
    assert_eq!(saved.position_ms, Some(95_250));

    let mut second = Player::new(
        Box::new(silent_factory(Duration::from_secs(600))),
        Box::new(server.clone()),
        Box::new(MemorySettingsStore::default()),
    );
    assert!(second.restore_from_server());
    second.tick(Instant::now());

    let snapshot = second.snapshot();
    assert_eq!(snapshot.current_index, Some(2));
    assert!(!snapshot.is_playing);
    assert!((snapshot.current_time - 95.25).abs() < 0.01);
}
