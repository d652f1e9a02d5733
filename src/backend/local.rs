use super::{BackendEvent, EventSender, PlaybackBackend};
use crate::model::BackendKind;
use anyhow::{Context, Result};
use rodio::{Decoder, DeviceSinkBuilder, MixerDeviceSink, Player, Source};
#[cfg(unix)]
use std::ffi::CString;
use std::io::{Cursor, Read};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

const TIME_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

struct LoadedStream {
    id: u64,
    result: Result<Vec<u8>>,
}

/// Fetch, seek and end-of-source bookkeeping, kept apart from the output device.
struct LoadState {
    tx: Sender<LoadedStream>,
    rx: Receiver<LoadedStream>,
    id: u64,
    loading: bool,
    start_paused: bool,
    pending_seek: Option<f64>,
    ended: bool,
}

impl LoadState {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            id: 0,
            loading: false,
            start_paused: false,
            pending_seek: None,
            ended: false,
        }
    }

    /// Starts a new load; completions carrying any earlier id are discarded.
    fn begin(&mut self, start_paused: bool) -> (u64, Sender<LoadedStream>) {
        self.id += 1;
        self.loading = true;
        self.start_paused = start_paused;
        self.pending_seek = None;
        self.ended = false;
        (self.id, self.tx.clone())
    }

    fn cancel(&mut self) {
        self.id += 1;
        self.loading = false;
        self.pending_seek = None;
    }

    fn next_completed(&mut self) -> Option<Result<Vec<u8>>> {
        while let Ok(loaded) = self.rx.try_recv() {
            if loaded.id != self.id {
                log::debug!("dropping superseded stream load {}", loaded.id);
                continue;
            }
            self.loading = false;
            return Some(loaded.result);
        }
        None
    }

    /// Holds the target while nothing is attached; true when the seek was deferred.
    fn defer_seek(&mut self, seconds: f64, attached: bool) -> bool {
        if attached && !self.loading {
            return false;
        }
        self.pending_seek = Some(seconds);
        true
    }

    fn take_pending_seek(&mut self) -> Option<f64> {
        self.pending_seek.take()
    }

    fn rearm(&mut self) {
        self.ended = false;
    }

    /// True exactly once per source when the output has run dry.
    fn mark_drained(&mut self) -> bool {
        !std::mem::replace(&mut self.ended, true)
    }
}

/// In-process engine: fetches the whole stream, decodes it with rodio.
pub struct LocalBackend {
    device: MixerDeviceSink,
    player: Option<Player>,
    events: Option<EventSender>,
    loads: LoadState,
    duration: f64,
    volume: f32,
    last_time_update: Option<Instant>,
}

impl LocalBackend {
    pub fn new(events: EventSender) -> Result<Self> {
        let mut device = with_silenced_stderr(DeviceSinkBuilder::open_default_sink)
            .map_err(|err| anyhow::anyhow!("failed to open default audio output: {err}"))?;
        device.log_on_drop(false);

        Ok(Self {
            device,
            player: None,
            events: Some(events),
            loads: LoadState::new(),
            duration: 0.0,
            volume: 1.0,
            last_time_update: None,
        })
    }

    fn emit(&self, event: BackendEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    fn position(&self) -> f64 {
        self.player
            .as_ref()
            .map(|player| player.get_pos().as_secs_f64())
            .or(self.loads.pending_seek)
            .unwrap_or(0.0)
    }

    fn emit_time(&mut self) {
        self.last_time_update = Some(Instant::now());
        self.emit(BackendEvent::TimeUpdate {
            current: self.position(),
            duration: self.duration,
        });
    }

    fn drop_player(&mut self) {
        if let Some(player) = self.player.take() {
            player.stop();
        }
    }

    fn attach(&mut self, bytes: Vec<u8>) -> Result<()> {
        let sniffed = sniff_duration(&bytes);
        let byte_len = bytes.len() as u64;
        let source = Decoder::builder()
            .with_data(Cursor::new(bytes))
            .with_byte_len(byte_len)
            .with_seekable(true)
            .build()
            .map_err(|err| anyhow::anyhow!("failed to decode stream: {err}"))?;
        self.duration = sniffed
            .or_else(|| source.total_duration().map(|total| total.as_secs_f64()))
            .unwrap_or(0.0);

        let player = Player::connect_new(self.device.mixer());
        player.set_volume(self.volume);
        if self.loads.start_paused {
            player.pause();
        }
        player.append(source);
        if let Some(seconds) = self.loads.take_pending_seek()
            && let Err(err) = player.try_seek(Duration::from_secs_f64(seconds.max(0.0)))
        {
            log::warn!("deferred seek to {seconds:.1}s failed: {err}");
        }
        self.player = Some(player);
        self.loads.rearm();
        Ok(())
    }

    fn receive_loads(&mut self) {
        while let Some(result) = self.loads.next_completed() {
            match result.and_then(|bytes| self.attach(bytes)) {
                Ok(()) => {
                    self.emit(BackendEvent::Ready);
                    self.emit(if self.loads.start_paused {
                        BackendEvent::Paused
                    } else {
                        BackendEvent::Playing
                    });
                    self.emit_time();
                }
                Err(err) => self.emit(BackendEvent::Error(format!("{err:#}"))),
            }
        }
    }
}

impl PlaybackBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn play(&mut self, url: &str) -> Result<()> {
        self.set_queue(url, None, false)
    }

    fn set_queue(&mut self, current: &str, _next: Option<&str>, start_paused: bool) -> Result<()> {
        self.drop_player();
        let (id, tx) = self.loads.begin(start_paused);
        self.duration = 0.0;
        self.emit(BackendEvent::Loading);

        let url = current.to_string();
        thread::Builder::new()
            .name(String::from("subtune-fetch"))
            .spawn(move || {
                let result = fetch_stream(&url);
                let _ = tx.send(LoadedStream { id, result });
            })
            .context("failed to spawn stream fetch thread")?;
        Ok(())
    }

    fn set_queue_next(&mut self, _next: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.loads.start_paused = true;
        if let Some(player) = &self.player {
            player.pause();
        }
        self.emit(BackendEvent::Paused);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.loads.start_paused = false;
        if let Some(player) = &self.player {
            player.play();
        }
        if !self.loads.loading {
            self.emit(BackendEvent::Playing);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.loads.cancel();
        self.duration = 0.0;
        self.drop_player();
        self.emit(BackendEvent::Paused);
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        let seconds = seconds.max(0.0);
        if self.loads.defer_seek(seconds, self.player.is_some()) {
            return Ok(());
        }
        let Some(player) = &self.player else {
            return Ok(());
        };

        player
            .try_seek(Duration::from_secs_f64(seconds))
            .map_err(|err| anyhow::anyhow!("failed to seek current stream: {err}"))?;
        self.loads.rearm();
        self.emit_time();
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.volume = volume.clamp(0.0, 1.0);
        if let Some(player) = &self.player {
            player.set_volume(self.volume);
        }
        Ok(())
    }

    fn tick(&mut self) {
        self.receive_loads();

        let Some(player) = &self.player else {
            return;
        };
        if player.empty() {
            if self.loads.mark_drained() {
                self.emit_time();
                self.emit(BackendEvent::Ended);
            }
            return;
        }
        let due = self
            .last_time_update
            .is_none_or(|last| last.elapsed() >= TIME_UPDATE_INTERVAL);
        if !player.is_paused() && due {
            self.emit_time();
        }
    }

    fn current_time(&self) -> f64 {
        self.position()
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn volume(&self) -> f32 {
        self.volume
    }

    fn is_playing(&self) -> bool {
        self.player
            .as_ref()
            .is_some_and(|player| !player.is_paused() && !player.empty())
    }

    fn destroy(&mut self) {
        self.loads.cancel();
        self.drop_player();
        self.events = None;
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn fetch_stream(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url).call().context("stream request failed")?;
    let mut reader = response.into_body().into_reader();
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .context("failed to read stream body")?;
    if bytes.is_empty() {
        anyhow::bail!("stream returned no audio data");
    }
    Ok(bytes)
}

fn sniff_duration(data: &[u8]) -> Option<f64> {
    use symphonia::core::io::MediaSourceStream;

    let cursor = Cursor::new(data.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());
    let detected = symphonia::default::get_probe()
        .format(&Default::default(), mss, &Default::default(), &Default::default())
        .ok()?;
    let track = detected.format.default_track()?;
    let frames = track.codec_params.n_frames?;
    let sample_rate = track.codec_params.sample_rate?;
    (sample_rate > 0).then(|| frames as f64 / f64::from(sample_rate))
}

#[cfg(unix)]
fn with_silenced_stderr<T>(operation: impl FnOnce() -> T) -> T {
    let saved = unsafe { libc::dup(libc::STDERR_FILENO) };
    if saved < 0 {
        return operation();
    }

    let devnull = CString::new("/dev/null")
        .ok()
        .map(|path| unsafe { libc::open(path.as_ptr(), libc::O_WRONLY) })
        .unwrap_or(-1);

    if devnull >= 0 {
        unsafe {
            libc::dup2(devnull, libc::STDERR_FILENO);
            libc::close(devnull);
        }
    }

    let result = operation();

    unsafe {
        libc::dup2(saved, libc::STDERR_FILENO);
        libc::close(saved);
    }

    result
}

#[cfg(not(unix))]
fn with_silenced_stderr<T>(operation: impl FnOnce() -> T) -> T {
    operation()
}
