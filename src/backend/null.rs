use super::{BackendEvent, EventSender, PlaybackBackend};
use crate::model::BackendKind;
use anyhow::Result;
use std::time::{Duration, Instant};

const TIME_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Silent in-process engine driven by a wall clock. Stands in for the local
/// engine when no audio output can be opened.
pub struct NullBackend {
    events: Option<EventSender>,
    current: Option<String>,
    paused: bool,
    volume: f32,
    started_at: Option<Instant>,
    position_offset: Duration,
    track_length: Option<Duration>,
    ended: bool,
    last_time_update: Option<Instant>,
}

impl NullBackend {
    pub fn new(events: EventSender) -> Self {
        Self {
            events: Some(events),
            current: None,
            paused: false,
            volume: 1.0,
            started_at: None,
            position_offset: Duration::ZERO,
            track_length: None,
            ended: false,
            last_time_update: None,
        }
    }

    /// Every source is treated as this long; without it sources never end.
    pub fn with_track_length(mut self, length: Duration) -> Self {
        self.track_length = Some(length).filter(|length| !length.is_zero());
        self
    }

    fn emit(&self, event: BackendEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    fn current_position(&self) -> Duration {
        let mut position = self.position_offset;
        if !self.paused
            && self.current.is_some()
            && let Some(started_at) = self.started_at
        {
            position = position.saturating_add(started_at.elapsed());
        }
        if let Some(length) = self.track_length {
            return position.min(length);
        }
        position
    }

    fn is_finished(&self) -> bool {
        let Some(length) = self.track_length else {
            return false;
        };
        self.current.is_some() && !self.paused && self.current_position() >= length
    }

    fn emit_time(&mut self) {
        self.last_time_update = Some(Instant::now());
        self.emit(BackendEvent::TimeUpdate {
            current: self.current_time(),
            duration: self.duration(),
        });
    }
}

impl PlaybackBackend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn play(&mut self, url: &str) -> Result<()> {
        self.set_queue(url, None, false)
    }

    fn set_queue(&mut self, current: &str, _next: Option<&str>, start_paused: bool) -> Result<()> {
        self.current = Some(current.to_string());
        self.paused = start_paused;
        self.started_at = (!start_paused).then(Instant::now);
        self.position_offset = Duration::ZERO;
        self.ended = false;

        self.emit(BackendEvent::Loading);
        self.emit(BackendEvent::Ready);
        self.emit(if start_paused {
            BackendEvent::Paused
        } else {
            BackendEvent::Playing
        });
        self.emit_time();
        Ok(())
    }

    fn set_queue_next(&mut self, _next: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.position_offset = self.current_position();
        self.started_at = None;
        self.paused = true;
        self.emit(BackendEvent::Paused);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        if self.current.is_some() {
            self.started_at = Some(Instant::now());
        }
        self.paused = false;
        self.emit(BackendEvent::Playing);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.current = None;
        self.paused = false;
        self.started_at = None;
        self.position_offset = Duration::ZERO;
        self.emit(BackendEvent::Paused);
        Ok(())
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        if self.current.is_none() {
            return Err(anyhow::anyhow!("no active source"));
        }

        let target = Duration::from_secs_f64(seconds.max(0.0));
        self.position_offset = self
            .track_length
            .map_or(target, |length| target.min(length));
        self.started_at = if self.paused {
            None
        } else {
            Some(Instant::now())
        };
        self.ended = false;
        self.emit_time();
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn tick(&mut self) {
        if self.current.is_none() || self.ended {
            return;
        }
        if self.is_finished() {
            self.ended = true;
            self.emit_time();
            self.emit(BackendEvent::Ended);
            return;
        }
        let due = self
            .last_time_update
            .is_none_or(|last| last.elapsed() >= TIME_UPDATE_INTERVAL);
        if !self.paused && due {
            self.emit_time();
        }
    }

    fn current_time(&self) -> f64 {
        if self.current.is_none() {
            return 0.0;
        }
        self.current_position().as_secs_f64()
    }

    fn duration(&self) -> f64 {
        self.track_length.map_or(0.0, |length| length.as_secs_f64())
    }

    fn volume(&self) -> f32 {
        self.volume
    }

    fn is_playing(&self) -> bool {
        self.current.is_some() && !self.paused && !self.ended
    }

    fn destroy(&mut self) {
        self.current = None;
        self.started_at = None;
        self.events = None;
    }
}
