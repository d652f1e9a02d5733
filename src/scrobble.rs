/// Elapsed playback after which a track always counts as listened.
pub const SUBMIT_AFTER_SECONDS: f64 = 240.0;
/// Fraction of the duration after which a track counts as listened.
pub const SUBMIT_AFTER_FRACTION: f64 = 0.5;

/// Per-session bookkeeping for "now playing" and "completed" reports.
///
/// Both slots are cleared whenever a track becomes current, so a replay of the
/// same track is eligible again.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScrobbleTracker {
    now_playing: Option<String>,
    submitted: Option<String>,
}

impl ScrobbleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.now_playing = None;
        self.submitted = None;
    }

    /// Returns true the first time it is asked about `track_id` since the last reset.
    pub fn take_now_playing(&mut self, track_id: &str) -> bool {
        if self.now_playing.as_deref() == Some(track_id) {
            return false;
        }
        self.now_playing = Some(track_id.to_string());
        true
    }

    /// Returns true once per play when `elapsed` crosses the listen threshold.
    pub fn take_submission(&mut self, track_id: &str, elapsed: f64, duration: f64) -> bool {
        if duration <= 0.0 || self.submitted.as_deref() == Some(track_id) {
            return false;
        }
        if elapsed < SUBMIT_AFTER_SECONDS && elapsed < duration * SUBMIT_AFTER_FRACTION {
            return false;
        }
        self.submitted = Some(track_id.to_string());
        true
    }

    pub fn last_now_playing(&self) -> Option<&str> {
        self.now_playing.as_deref()
    }

    pub fn last_submitted(&self) -> Option<&str> {
        self.submitted.as_deref()
    }
}
