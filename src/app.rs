use crate::backend::DefaultBackendFactory;
use crate::catalog::{CatalogClient, ServerConfig, SubsonicClient};
use crate::config::{JsonSettingsStore, SettingsStore};
use crate::model::{BackendKind, RepeatMode, Track};
use crate::player::{Player, PlayerSnapshot};
use crate::queue::QueueUndo;
use anyhow::Result;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const TICK_INTERVAL: Duration = Duration::from_millis(50);
const SEEK_USAGE: &str = "Usage: seek <seconds>";

#[derive(Debug, Clone)]
pub struct AppStartupOptions {
    pub server: ServerConfig,
    pub backend: Option<BackendKind>,
    pub mpv_path: Option<PathBuf>,
    pub resume: bool,
    pub song_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play(Vec<String>),
    Add(Vec<String>),
    Next,
    Previous,
    Pause,
    Resume,
    Toggle,
    Seek(f64),
    Volume(f32),
    Shuffle,
    Repeat(Option<RepeatMode>),
    Queue,
    Jump(usize),
    Remove(usize),
    Clear,
    Undo,
    Backend(BackendKind),
    Status,
    Help,
    Quit,
}

pub fn run_with_startup(options: AppStartupOptions) -> Result<()> {
    let store = JsonSettingsStore::from_env()?;
    let mut settings = match store.load() {
        Ok(settings) => settings,
        Err(err) => {
            log::warn!("ignoring unreadable settings: {err:#}");
            Default::default()
        }
    };
    if options.mpv_path.is_some() {
        settings.mpv_path = options.mpv_path.clone();
    }
    log::info!("settings file: {}", store.path().display());

    let factory = DefaultBackendFactory::from_settings(&settings);
    let catalog = SubsonicClient::new(options.server.clone());
    let mut player = Player::new(Box::new(factory), Box::new(catalog), Box::new(store));
    let updates = player.subscribe();

    if let Some(kind) = options.backend {
        player.set_backend(kind);
    }
    player.enable_sync();
    if options.resume && !player.restore_from_server() {
        println!("No saved play queue on the server");
    }
    if !options.song_ids.is_empty() {
        play_ids(&mut player, &options.song_ids);
    }

    let lines = spawn_stdin_reader();
    let mut undo: Option<QueueUndo> = None;
    let mut last_status = String::new();
    println!("Type `help` for commands.");

    loop {
        player.tick(Instant::now());
        print_status_changes(&updates, &mut last_status);

        match lines.recv_timeout(TICK_INTERVAL) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => run_command(&mut player, &mut undo, command),
                    Err(usage) => println!("{usage}"),
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    player.shutdown();
    print_status_changes(&updates, &mut last_status);
    Ok(())
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut reader = BufReader::new(stdin.lock());
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(line.trim_end().to_string()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    log::warn!("stdin read failed: {err}");
                    break;
                }
            }
        }
    });
    rx
}

fn print_status_changes(updates: &Receiver<PlayerSnapshot>, last_status: &mut String) {
    for snapshot in updates.try_iter() {
        if snapshot.status != *last_status {
            println!("{}", snapshot.status);
            last_status.clone_from(&snapshot.status);
        }
    }
}

pub fn parse_command(raw: &str) -> Result<Command, String> {
    let input = raw.trim();
    let mut split = input.splitn(2, char::is_whitespace);
    let command = split.next().unwrap_or_default();
    let rest = split.next().unwrap_or("").trim();
    let ids = || -> Vec<String> { rest.split_whitespace().map(String::from).collect() };

    let parsed = match command {
        "play" | "p" if !rest.is_empty() => Command::Play(ids()),
        "play" | "p" => Command::Resume,
        "add" | "a" if !rest.is_empty() => Command::Add(ids()),
        "add" | "a" => return Err(String::from("Usage: add <id>...")),
        "next" | "n" => Command::Next,
        "prev" | "previous" => Command::Previous,
        "pause" => Command::Pause,
        "resume" => Command::Resume,
        "toggle" | "t" => Command::Toggle,
        "seek" => {
            let seconds = rest
                .parse::<f64>()
                .ok()
                .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
                .ok_or_else(|| String::from(SEEK_USAGE))?;
            Command::Seek(seconds)
        }
        "vol" | "volume" => {
            let percent = rest
                .parse::<f32>()
                .ok()
                .filter(|percent| (0.0..=100.0).contains(percent))
                .ok_or_else(|| String::from("Usage: vol <0-100>"))?;
            Command::Volume(percent / 100.0)
        }
        "shuffle" => Command::Shuffle,
        "repeat" if rest.is_empty() => Command::Repeat(None),
        "repeat" => Command::Repeat(Some(
            RepeatMode::parse(rest).ok_or_else(|| String::from("Usage: repeat [off|all|one]"))?,
        )),
        "queue" | "q" => Command::Queue,
        "jump" => Command::Jump(parse_position(rest, "Usage: jump <n>")?),
        "remove" | "rm" => Command::Remove(parse_position(rest, "Usage: remove <n>")?),
        "clear" => Command::Clear,
        "undo" => Command::Undo,
        "backend" => Command::Backend(
            BackendKind::parse(rest).ok_or_else(|| String::from("Usage: backend <local|mpv>"))?,
        ),
        "status" | "s" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => return Err(String::from("Unknown command. Use help")),
    };
    Ok(parsed)
}

/// Queue positions are shown and typed 1-based.
fn parse_position(raw: &str, usage: &str) -> Result<usize, String> {
    raw.parse::<usize>()
        .ok()
        .and_then(|position| position.checked_sub(1))
        .ok_or_else(|| usage.to_string())
}

pub fn run_command(player: &mut Player, undo: &mut Option<QueueUndo>, command: Command) {
    match command {
        Command::Play(ids) => play_ids(player, &ids),
        Command::Add(ids) => {
            let tracks = resolve_tracks(player.catalog(), &ids);
            player.add_to_queue(tracks);
        }
        Command::Next => player.play_next(),
        Command::Previous => player.play_previous(),
        Command::Pause => player.pause(),
        Command::Resume => player.resume(),
        Command::Toggle => player.toggle_play_pause(),
        Command::Seek(seconds) => player.seek(seconds),
        Command::Volume(volume) => player.set_volume(volume),
        Command::Shuffle => {
            player.toggle_shuffle();
        }
        Command::Repeat(Some(mode)) => player.set_repeat(mode),
        Command::Repeat(None) => {
            player.toggle_repeat();
        }
        Command::Queue => print_queue(&player.snapshot()),
        Command::Jump(index) => {
            if !player.play_index(index) {
                println!("No track at position {}", index + 1);
            }
        }
        Command::Remove(index) => match player.remove_from_queue(index) {
            Some(track) => println!("Removed {}", track.display_name()),
            None => println!("Cannot remove position {}", index + 1),
        },
        Command::Clear => match player.clear_queue() {
            Some(previous) => *undo = Some(previous),
            None => println!("Queue is already empty"),
        },
        Command::Undo => match undo.take() {
            Some(previous) => player.undo_clear(previous),
            None => println!("Nothing to undo"),
        },
        Command::Backend(kind) => player.set_backend(kind),
        Command::Status => println!("{}", describe(&player.snapshot())),
        Command::Help => print_help(),
        Command::Quit => {}
    }
}

fn play_ids(player: &mut Player, ids: &[String]) {
    let tracks = resolve_tracks(player.catalog(), ids);
    let Some(first) = tracks.first().cloned() else {
        println!("No playable tracks");
        return;
    };
    player.play_track(first, Some(tracks), Some(0));
}

fn resolve_tracks(catalog: &dyn CatalogClient, ids: &[String]) -> Vec<Track> {
    ids.iter()
        .filter_map(|id| match catalog.get_song(id) {
            Ok(track) => Some(track),
            Err(err) => {
                log::warn!("skipping {id}: {err:#}");
                None
            }
        })
        .collect()
}

fn print_queue(snapshot: &PlayerSnapshot) {
    if snapshot.queue.is_empty() {
        println!("Queue is empty");
        return;
    }
    for (index, track) in snapshot.queue.iter().enumerate() {
        let marker = if snapshot.current_index == Some(index) { '>' } else { ' ' };
        println!(
            "{marker} {:>3}. {} [{}]",
            index + 1,
            track.display_name(),
            format_time(track.duration)
        );
    }
}

pub fn describe(snapshot: &PlayerSnapshot) -> String {
    let Some(track) = &snapshot.current else {
        return String::from("Nothing playing");
    };

    let state = if snapshot.is_loading {
        "loading"
    } else if snapshot.is_playing {
        "playing"
    } else {
        "paused"
    };
    let mut flags = vec![
        format!("vol {}%", (snapshot.volume * 100.0).round() as u16),
        format!("repeat {}", snapshot.repeat.label()),
        snapshot.backend.label().to_string(),
    ];
    if snapshot.shuffle {
        flags.push(String::from("shuffle"));
    }
    if snapshot.fallback_active {
        flags.push(String::from("fallback"));
    }

    format!(
        "[{state}] {} {}/{} ({})",
        track.display_name(),
        format_time(snapshot.current_time),
        format_time(snapshot.duration),
        flags.join(", ")
    )
}

pub fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0).floor() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

fn print_help() {
    println!("Commands:");
    println!("  play <id>...        play songs (no ids: resume)");
    println!("  add <id>...         append songs to the queue");
    println!("  next | prev         skip forward or back");
    println!("  pause | resume      transport control (toggle flips)");
    println!("  seek <seconds>      jump within the current song");
    println!("  vol <0-100>         set volume");
    println!("  shuffle             toggle shuffle");
    println!("  repeat [off|all|one]");
    println!("  queue | jump <n> | remove <n> | clear | undo");
    println!("  backend <local|mpv> switch playback engine");
    println!("  status | help | quit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transport_commands() {
        assert_eq!(parse_command("next"), Ok(Command::Next));
        assert_eq!(parse_command("  seek 12.5 "), Ok(Command::Seek(12.5)));
        assert_eq!(parse_command("vol 40"), Ok(Command::Volume(0.4)));
        assert_eq!(parse_command("play"), Ok(Command::Resume));
        assert_eq!(
            parse_command("play 1 2"),
            Ok(Command::Play(vec![String::from("1"), String::from("2")]))
        );
    }

    #[test]
    fn parses_queue_positions_one_based() {
        assert_eq!(parse_command("remove 2"), Ok(Command::Remove(1)));
        assert_eq!(parse_command("jump 1"), Ok(Command::Jump(0)));
        assert!(parse_command("remove 0").is_err());
        assert!(parse_command("remove x").is_err());
    }

    #[test]
    fn parses_modes_and_backends() {
        assert_eq!(parse_command("repeat"), Ok(Command::Repeat(None)));
        assert_eq!(
            parse_command("repeat one"),
            Ok(Command::Repeat(Some(RepeatMode::One)))
        );
        assert_eq!(
            parse_command("backend mpv"),
            Ok(Command::Backend(BackendKind::Mpv))
        );
        assert!(parse_command("backend vlc").is_err());
        assert!(parse_command("vol 150").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn formats_minutes_and_seconds() {
        assert_eq!(format_time(0.0), "0:00");
        assert_eq!(format_time(61.9), "1:01");
        assert_eq!(format_time(-3.0), "0:00");
    }
}
