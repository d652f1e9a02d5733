use super::{BackendEvent, EventSender, PlaybackBackend};
use crate::model::BackendKind;
use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const QUIT_GRACE: Duration = Duration::from_secs(1);
const TERM_GRACE: Duration = Duration::from_millis(500);
const TIME_UPDATE_STEP: f64 = 0.25;

const OBSERVED_PROPERTIES: [(u64, &str); 5] = [
    (1, "time-pos"),
    (2, "duration"),
    (3, "pause"),
    (4, "playlist-pos"),
    (5, "playlist-count"),
];

#[derive(Debug, Clone)]
pub struct MpvOptions {
    pub binary: PathBuf,
    pub extra_args: Vec<String>,
    pub volume: f32,
}

impl Default for MpvOptions {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("mpv"),
            extra_args: Vec::new(),
            volume: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MpvMessage {
    Event(BackendEvent),
    Reply {
        request_id: u64,
        outcome: Result<Value, String>,
    },
}

/// Turns mpv IPC lines into backend events while tracking the observed properties.
///
/// The playlist holds at most two entries: slot 0 is playing, slot 1 is the
/// preloaded next source. A `playlist-pos` move from 0 to 1 is an auto-advance.
#[derive(Debug, Clone, PartialEq)]
pub struct MpvEventDecoder {
    time_pos: f64,
    duration: f64,
    paused: bool,
    playlist_pos: i64,
    playlist_count: i64,
    loaded: bool,
    pending_seek: Option<f64>,
    last_reported_time: Option<f64>,
}

impl Default for MpvEventDecoder {
    fn default() -> Self {
        Self {
            time_pos: 0.0,
            duration: 0.0,
            paused: false,
            playlist_pos: -1,
            playlist_count: 0,
            loaded: false,
            pending_seek: None,
            last_reported_time: None,
        }
    }
}

impl MpvEventDecoder {
    pub fn decode(&mut self, message: &Value) -> Vec<MpvMessage> {
        if let Some(event) = message.get("event").and_then(Value::as_str) {
            return self
                .decode_event(event, message)
                .into_iter()
                .map(MpvMessage::Event)
                .collect();
        }

        let Some(request_id) = message.get("request_id").and_then(Value::as_u64) else {
            return Vec::new();
        };
        let outcome = match message.get("error").and_then(Value::as_str) {
            Some("success") => Ok(message.get("data").cloned().unwrap_or(Value::Null)),
            Some(error) => Err(error.to_string()),
            None => Err(String::from("malformed reply")),
        };
        vec![MpvMessage::Reply {
            request_id,
            outcome,
        }]
    }

    fn decode_event(&mut self, event: &str, message: &Value) -> Vec<BackendEvent> {
        match event {
            "property-change" => {
                let name = message.get("name").and_then(Value::as_str).unwrap_or("");
                let data = message.get("data").unwrap_or(&Value::Null);
                self.property_changed(name, data)
            }
            "start-file" => {
                self.loaded = false;
                self.last_reported_time = None;
                vec![BackendEvent::Loading]
            }
            "file-loaded" => {
                self.loaded = true;
                vec![BackendEvent::Ready, self.transport_event()]
            }
            "end-file" => self.file_ended(message),
            _ => Vec::new(),
        }
    }

    fn property_changed(&mut self, name: &str, data: &Value) -> Vec<BackendEvent> {
        match name {
            "time-pos" => {
                // Positions between a new load and its file-loaded belong to the old file.
                let Some(time_pos) = data.as_f64().filter(|_| self.loaded) else {
                    return Vec::new();
                };
                self.time_pos = time_pos;
                let due = self.last_reported_time.is_none_or(|last| {
                    time_pos < last || time_pos - last >= TIME_UPDATE_STEP
                });
                if !due {
                    return Vec::new();
                }
                self.last_reported_time = Some(time_pos);
                vec![self.time_event()]
            }
            "duration" => {
                self.duration = data.as_f64().unwrap_or(0.0);
                vec![self.time_event()]
            }
            "pause" => {
                let Some(paused) = data.as_bool() else {
                    return Vec::new();
                };
                let changed = paused != self.paused;
                self.paused = paused;
                if changed && self.loaded {
                    vec![self.transport_event()]
                } else {
                    Vec::new()
                }
            }
            "playlist-pos" => {
                let previous = self.playlist_pos;
                self.playlist_pos = data.as_i64().unwrap_or(-1);
                if previous == 0 && self.playlist_pos == 1 {
                    self.time_pos = 0.0;
                    self.last_reported_time = None;
                    vec![BackendEvent::AutoAdvanced]
                } else {
                    Vec::new()
                }
            }
            "playlist-count" => {
                self.playlist_count = data.as_i64().unwrap_or(0);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn file_ended(&mut self, message: &Value) -> Vec<BackendEvent> {
        let reason = message.get("reason").and_then(Value::as_str).unwrap_or("");
        match reason {
            "eof" if !self.loaded => Vec::new(),
            "eof" => {
                self.loaded = false;
                let last_slot = self.playlist_count <= 1
                    || self.playlist_pos < 0
                    || self.playlist_pos + 1 >= self.playlist_count;
                if last_slot {
                    vec![BackendEvent::Ended]
                } else {
                    Vec::new()
                }
            }
            "error" => {
                self.loaded = false;
                let detail = message
                    .get("file_error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                vec![BackendEvent::Error(format!("mpv failed to play: {detail}"))]
            }
            _ => Vec::new(),
        }
    }

    fn time_event(&self) -> BackendEvent {
        BackendEvent::TimeUpdate {
            current: self.time_pos,
            duration: self.duration,
        }
    }

    fn transport_event(&self) -> BackendEvent {
        if self.paused {
            BackendEvent::Paused
        } else {
            BackendEvent::Playing
        }
    }

    pub fn begin_load(&mut self, start_paused: bool) {
        self.loaded = false;
        self.paused = start_paused;
        self.time_pos = 0.0;
        self.duration = 0.0;
        self.pending_seek = None;
        self.last_reported_time = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn defer_seek(&mut self, seconds: f64) {
        self.pending_seek = Some(seconds);
    }

    pub fn take_pending_seek(&mut self) -> Option<f64> {
        self.pending_seek.take()
    }
}

type ReplySender = Sender<Result<Value, String>>;

/// Command side of the IPC socket: JSON lines out, replies matched by `request_id`.
pub struct MpvIpc {
    writer: Mutex<Box<dyn Write + Send>>,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, ReplySender>>,
}

impl MpvIpc {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn write_line(&self, command: Value, request_id: u64) -> Result<()> {
        let mut bytes = serde_json::to_vec(&json!({ "command": command, "request_id": request_id }))
            .context("serialize failed")?;
        bytes.push(b'\n');
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&bytes).context("write failed")?;
        writer.flush().context("flush failed")?;
        Ok(())
    }

    /// Fire and forget; mpv's reply is dropped by the reader.
    pub fn send(&self, command: Value) -> Result<()> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.write_line(command, request_id)
    }

    pub fn request(&self, command: Value, timeout: Duration) -> Result<Value> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, tx);

        if let Err(err) = self.write_line(command, request_id) {
            self.forget(request_id);
            return Err(err);
        }

        let outcome = rx.recv_timeout(timeout);
        self.forget(request_id);
        match outcome {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(error)) => anyhow::bail!("mpv rejected request: {error}"),
            Err(_) => anyhow::bail!("mpv did not answer request {request_id}"),
        }
    }

    pub fn resolve(&self, request_id: u64, outcome: Result<Value, String>) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);
        match (waiter, outcome) {
            (Some(waiter), outcome) => {
                let _ = waiter.send(outcome);
            }
            (None, Err(error)) => log::debug!("mpv command {request_id} failed: {error}"),
            (None, Ok(_)) => {}
        }
    }

    fn forget(&self, request_id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);
    }

    fn fail_pending(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Reader side: runs until the socket closes.
pub fn read_events<R: BufRead>(
    reader: R,
    decoder: &Mutex<MpvEventDecoder>,
    ipc: &MpvIpc,
    events: &EventSender,
    shutting_down: &AtomicBool,
) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::debug!("mpv socket read failed: {err}");
                break;
            }
        };
        let message = match serde_json::from_str::<Value>(line.trim_end()) {
            Ok(message) => message,
            Err(err) => {
                log::debug!("ignoring malformed mpv line: {err}");
                continue;
            }
        };

        let messages = decoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decode(&message);
        for message in messages {
            match message {
                MpvMessage::Reply {
                    request_id,
                    outcome,
                } => ipc.resolve(request_id, outcome),
                MpvMessage::Event(event) => {
                    after_event(&event, decoder, ipc);
                    if !shutting_down.load(Ordering::SeqCst) {
                        events.emit(event);
                    }
                }
            }
        }
    }

    ipc.fail_pending();
    if !shutting_down.load(Ordering::SeqCst) {
        log::warn!("lost connection to mpv");
        events.emit(BackendEvent::FallbackRequested(String::from(
            "mpv connection lost",
        )));
    }
}

fn after_event(event: &BackendEvent, decoder: &Mutex<MpvEventDecoder>, ipc: &MpvIpc) {
    let outcome = match event {
        BackendEvent::AutoAdvanced => ipc.send(json!(["playlist-remove", 0])),
        BackendEvent::Ready => {
            let pending = decoder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take_pending_seek();
            match pending {
                Some(seconds) => ipc.send(json!(["seek", seconds, "absolute"])),
                None => Ok(()),
            }
        }
        _ => Ok(()),
    };
    if let Err(err) = outcome {
        log::warn!("mpv follow-up command failed: {err:#}");
    }
}

static SOCKET_COUNTER: AtomicU64 = AtomicU64::new(0);

/// External-process engine: an `mpv --idle` child driven over its JSON IPC socket.
pub struct MpvBackend {
    options: MpvOptions,
    events: EventSender,
    decoder: Arc<Mutex<MpvEventDecoder>>,
    shutting_down: Arc<AtomicBool>,
    ipc: Option<Arc<MpvIpc>>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    socket_path: Option<PathBuf>,
    volume: f32,
}

impl MpvBackend {
    pub fn new(options: MpvOptions, events: EventSender) -> Self {
        let volume = options.volume.clamp(0.0, 1.0);
        Self {
            options,
            events,
            decoder: Arc::new(Mutex::new(MpvEventDecoder::default())),
            shutting_down: Arc::new(AtomicBool::new(false)),
            ipc: None,
            child: None,
            reader: None,
            socket_path: None,
            volume,
        }
    }

    fn ipc(&self) -> Result<&MpvIpc> {
        self.ipc.as_deref().context("mpv is not running")
    }

    fn decoder(&self) -> std::sync::MutexGuard<'_, MpvEventDecoder> {
        self.decoder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn socket_path() -> PathBuf {
        let counter = SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "subtune-mpv-{}-{counter}.sock",
            std::process::id()
        ))
    }

    fn launch_args(&self, socket: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            String::from("--idle=yes"),
            String::from("--no-video"),
            String::from("--no-terminal"),
            String::from("--gapless-audio=yes"),
            String::from("--prefetch-playlist=yes"),
            format!("--input-ipc-server={}", socket.display()),
            format!("--volume={}", (self.volume * 100.0).round()),
        ];
        args.extend(self.options.extra_args.iter().cloned());
        args
    }

    #[cfg(unix)]
    fn launch(&mut self) -> Result<()> {
        use std::io::BufReader;
        use std::os::unix::net::UnixStream;
        use std::process::{Command, Stdio};
        use std::time::Instant;

        let socket = Self::socket_path();
        let _ = std::fs::remove_file(&socket);
        self.socket_path = Some(socket.clone());

        let child = Command::new(&self.options.binary)
            .args(self.launch_args(&socket))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.options.binary.display()))?;
        log::info!("spawned mpv (pid {})", child.id());
        let child = self.child.insert(child);

        let started = Instant::now();
        let stream = loop {
            match UnixStream::connect(&socket) {
                Ok(stream) => break stream,
                Err(err) => {
                    if let Some(status) = child.try_wait().context("failed to poll mpv")? {
                        anyhow::bail!("mpv exited during startup ({status})");
                    }
                    if started.elapsed() >= CONNECT_TIMEOUT {
                        return Err(err).context("timed out waiting for mpv IPC socket");
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            }
        };

        let read_half = stream.try_clone().context("failed to clone mpv socket")?;
        let ipc = Arc::new(MpvIpc::new(Box::new(stream)));
        let reader = {
            let ipc = Arc::clone(&ipc);
            let decoder = Arc::clone(&self.decoder);
            let events = self.events.clone();
            let shutting_down = Arc::clone(&self.shutting_down);
            thread::Builder::new()
                .name(String::from("subtune-mpv-ipc"))
                .spawn(move || {
                    read_events(
                        BufReader::new(read_half),
                        &decoder,
                        &ipc,
                        &events,
                        &shutting_down,
                    );
                })
                .context("failed to spawn mpv reader thread")?
        };
        self.reader = Some(reader);

        let version = ipc
            .request(json!(["get_property", "mpv-version"]), REQUEST_TIMEOUT)
            .context("mpv handshake failed")?;
        log::info!("connected to {}", version.as_str().unwrap_or("mpv"));

        for (id, name) in OBSERVED_PROPERTIES {
            ipc.send(json!(["observe_property", id, name]))?;
        }
        self.ipc = Some(ipc);
        Ok(())
    }

    #[cfg(not(unix))]
    fn launch(&mut self) -> Result<()> {
        anyhow::bail!("mpv IPC needs a Unix domain socket on this platform")
    }

    fn wait_for_exit(child: &mut Child, grace: Duration) -> bool {
        let deadline = std::time::Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) if std::time::Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(25));
                }
                Ok(None) => return false,
                Err(err) => {
                    log::warn!("failed to poll mpv: {err}");
                    return false;
                }
            }
        }
    }

    fn terminate(child: &mut Child) {
        if Self::wait_for_exit(child, QUIT_GRACE) {
            return;
        }

        #[cfg(unix)]
        if let Ok(pid) = libc::pid_t::try_from(child.id()) {
            log::warn!("mpv ignored quit, sending SIGTERM");
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            if Self::wait_for_exit(child, TERM_GRACE) {
                return;
            }
        }

        log::warn!("killing mpv (pid {})", child.id());
        if let Err(err) = child.kill() {
            log::warn!("failed to kill mpv: {err}");
        }
        let _ = child.wait();
    }
}

impl PlaybackBackend for MpvBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mpv
    }

    fn initialize(&mut self) -> bool {
        if self.ipc.is_some() {
            return true;
        }
        self.shutting_down.store(false, Ordering::SeqCst);
        match self.launch() {
            Ok(()) => true,
            Err(err) => {
                log::warn!("mpv unavailable: {err:#}");
                self.destroy();
                false
            }
        }
    }

    fn play(&mut self, url: &str) -> Result<()> {
        self.set_queue(url, None, false)
    }

    fn set_queue(&mut self, current: &str, next: Option<&str>, start_paused: bool) -> Result<()> {
        self.decoder().begin_load(start_paused);
        let ipc = self.ipc()?;
        ipc.send(json!(["set_property", "pause", start_paused]))?;
        ipc.send(json!(["loadfile", current, "replace"]))?;
        if let Some(next) = next {
            ipc.send(json!(["loadfile", next, "append"]))?;
        }
        Ok(())
    }

    fn set_queue_next(&mut self, next: Option<&str>) -> Result<()> {
        let ipc = self.ipc()?;
        ipc.send(json!(["playlist-clear"]))?;
        if let Some(next) = next {
            ipc.send(json!(["loadfile", next, "append"]))?;
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.ipc()?.send(json!(["set_property", "pause", true]))
    }

    fn resume(&mut self) -> Result<()> {
        self.ipc()?.send(json!(["set_property", "pause", false]))
    }

    fn stop(&mut self) -> Result<()> {
        self.decoder().begin_load(false);
        self.ipc()?.send(json!(["stop"]))
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        let seconds = seconds.max(0.0);
        {
            let mut decoder = self.decoder();
            if !decoder.is_loaded() {
                decoder.defer_seek(seconds);
                return Ok(());
            }
        }
        self.ipc()?.send(json!(["seek", seconds, "absolute"]))
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.volume = volume.clamp(0.0, 1.0);
        let percent = f64::from(self.volume) * 100.0;
        self.ipc()?.send(json!(["set_property", "volume", percent]))
    }

    fn current_time(&self) -> f64 {
        self.decoder().time_pos
    }

    fn duration(&self) -> f64 {
        self.decoder().duration
    }

    fn volume(&self) -> f32 {
        self.volume
    }

    fn is_playing(&self) -> bool {
        let decoder = self.decoder();
        decoder.loaded && !decoder.paused
    }

    fn destroy(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(ipc) = self.ipc.take()
            && let Err(err) = ipc.send(json!(["quit"]))
        {
            log::debug!("mpv quit command failed: {err:#}");
        }
        if let Some(mut child) = self.child.take() {
            Self::terminate(&mut child);
            log::info!("mpv stopped");
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(socket) = self.socket_path.take() {
            let _ = std::fs::remove_file(socket);
        }
    }
}

impl Drop for MpvBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}
