#![no_main]

use anyhow::{Result, bail};
use libfuzzer_sys::fuzz_target;
use std::time::Instant;
use subtune::backend::{EventSender, NullBackend, PlaybackBackend};
use subtune::catalog::CatalogClient;
use subtune::config::MemorySettingsStore;
use subtune::model::{BackendKind, RemotePlayQueue, SavedPlayQueue, Track};
use subtune::player::Player;

struct OfflineCatalog;

impl CatalogClient for OfflineCatalog {
    fn stream_url(&self, track_id: &str) -> Result<String> {
        Ok(format!("stream://{track_id}"))
    }

    fn cover_art_url(&self, cover_id: &str, _size: u32) -> Result<String> {
        Ok(format!("cover://{cover_id}"))
    }

    fn scrobble(&self, _track_id: &str, _submission: bool) -> Result<()> {
        Ok(())
    }

    fn get_play_queue(&self) -> Result<Option<RemotePlayQueue>> {
        Ok(None)
    }

    fn save_play_queue(&self, _queue: &SavedPlayQueue) -> Result<()> {
        Ok(())
    }

    fn get_song(&self, track_id: &str) -> Result<Track> {
        bail!("offline: {track_id}")
    }
}

fn track(id: u8) -> Track {
    Track::new(format!("t{id}"), format!("Track {id}")).with_duration(f64::from(id) + 1.0)
}

fuzz_target!(|data: &[u8]| {
    let factory = |_kind: BackendKind, events: EventSender| -> Box<dyn PlaybackBackend> {
        Box::new(NullBackend::new(events))
    };
    let mut player = Player::new(
        Box::new(factory),
        Box::new(OfflineCatalog),
        Box::new(MemorySettingsStore::default()),
    )
    .with_rng_seed(u64::from(data.first().copied().unwrap_or_default()));
    let len = (data.len() % 16).max(1) as u8;
    let queue: Vec<Track> = (0..len).map(track).collect();
    player.play_track(queue[0].clone(), Some(queue), Some(0));

    let mut undo = None;
    for pair in data.chunks(2) {
        let arg = pair.get(1).copied().unwrap_or_default();
        match pair[0] % 14 {
            0 => player.play_next(),
            1 => player.play_previous(),
            2 => {
                let _ = player.play_index(usize::from(arg));
            }
            3 => {
                let _ = player.toggle_shuffle();
            }
            4 => {
                let _ = player.toggle_repeat();
            }
            5 => player.add_to_queue(vec![track(arg)]),
            6 => player.play_next_in_queue(track(arg)),
            7 => {
                let _ = player.remove_from_queue(usize::from(arg));
            }
            8 => {
                let _ = player.insert_into_queue(track(arg), usize::from(arg));
            }
            9 => undo = player.clear_queue().or(undo),
            10 => {
                if let Some(saved) = undo.take() {
                    player.undo_clear(saved);
                }
            }
            11 => player.toggle_play_pause(),
            12 => player.seek(f64::from(arg)),
            _ => player.set_volume(f32::from(arg) / 255.0),
        }
        player.tick(Instant::now());

        let snapshot = player.snapshot();
        assert_eq!(snapshot.current_index.is_some(), !snapshot.queue.is_empty());
        if let Some(index) = snapshot.current_index {
            assert!(index < snapshot.queue.len());
        }
        assert!((0.0..=1.0).contains(&snapshot.volume));
    }
});
