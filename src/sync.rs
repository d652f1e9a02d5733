use crate::model::SavedPlayQueue;
use crate::queue::PlayQueue;
use std::time::{Duration, Instant};

pub const PUSH_DEBOUNCE: Duration = Duration::from_secs(2);

/// Single-slot timer: scheduling again replaces the pending deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Debounce {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn schedule(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Fires at most once per schedule.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Cross-device play queue mirror. Disabled until the session is authenticated.
#[derive(Debug, Clone)]
pub struct QueueSync {
    enabled: bool,
    restored: bool,
    timer: Debounce,
}

impl Default for QueueSync {
    fn default() -> Self {
        Self::new(PUSH_DEBOUNCE)
    }
}

impl QueueSync {
    pub fn new(delay: Duration) -> Self {
        Self {
            enabled: false,
            restored: false,
            timer: Debounce::new(delay),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn schedule(&mut self, now: Instant) {
        if self.enabled {
            self.timer.schedule(now);
        }
    }

    pub fn take_due(&mut self, now: Instant) -> bool {
        self.enabled && self.timer.take_due(now)
    }

    /// Consumes the pending push for a teardown flush; true if one should be sent.
    pub fn take_teardown(&mut self, queue: &PlayQueue) -> bool {
        self.timer.cancel();
        self.enabled && !queue.is_empty()
    }

    /// True only the first time; the startup pull happens once per session.
    pub fn begin_restore(&mut self) -> bool {
        !std::mem::replace(&mut self.restored, true)
    }
}

pub fn snapshot(queue: &PlayQueue, current_time: f64) -> SavedPlayQueue {
    let current_id = queue.current().map(|track| track.id.clone());
    SavedPlayQueue {
        track_ids: queue.track_ids(),
        position_ms: current_id
            .as_ref()
            .map(|_| (current_time.max(0.0) * 1000.0).round() as u64),
        current_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Track;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    #[test]
    fn debounce_coalesces_rapid_schedules() {
        let start = Instant::now();
        let mut timer = Debounce::new(Duration::from_secs(2));
        timer.schedule(start);
        timer.schedule(start + Duration::from_millis(1500));

        assert!(!timer.take_due(start + Duration::from_millis(2100)));
        assert!(timer.take_due(start + Duration::from_millis(3500)));
        assert!(!timer.take_due(start + Duration::from_secs(10)));
    }

    #[test]
    fn disabled_sync_never_schedules() {
        let start = Instant::now();
        let mut sync = QueueSync::default();
        sync.schedule(start);
        assert!(!sync.take_due(start + Duration::from_secs(5)));

        sync.enable();
        sync.schedule(start);
        assert!(sync.take_due(start + PUSH_DEBOUNCE));
    }

    #[test]
    fn teardown_requires_enabled_and_non_empty_queue() {
        let mut queue = PlayQueue::new();
        let mut sync = QueueSync::default();
        sync.enable();
        assert!(!sync.take_teardown(&queue));

        queue.append(vec![Track::new("a", "a")]);
        assert!(sync.take_teardown(&queue));
        assert!(!QueueSync::default().take_teardown(&queue));
    }

    #[test]
    fn restore_happens_once() {
        let mut sync = QueueSync::default();
        assert!(sync.begin_restore());
        assert!(!sync.begin_restore());
    }

    #[test]
    fn snapshot_reports_position_in_milliseconds() {
        let mut queue = PlayQueue::new();
        queue.replace(
            vec![Track::new("a", "a"), Track::new("b", "b")],
            1,
            false,
            &mut SmallRng::seed_from_u64(1),
        );
        let saved = snapshot(&queue, 12.3456);
        assert_eq!(saved.track_ids, vec!["a", "b"]);
        assert_eq!(saved.current_id.as_deref(), Some("b"));
        assert_eq!(saved.position_ms, Some(12_346));

        assert_eq!(snapshot(&PlayQueue::new(), 5.0), SavedPlayQueue::default());
    }
}
