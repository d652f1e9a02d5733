use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    All,
    One,
}

impl RepeatMode {
    pub fn next(self) -> Self {
        match self {
            Self::Off => Self::All,
            Self::All => Self::One,
            Self::One => Self::Off,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::All => "all",
            Self::One => "one",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Some(Self::Off),
            "all" | "loop" => Some(Self::All),
            "one" | "single" => Some(Self::One),
            _ => None,
        }
    }
}

/// Which playback engine renders audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process decoder.
    #[default]
    Local,
    /// External mpv process.
    Mpv,
}

impl BackendKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Mpv => "mpv",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "web" | "internal" => Some(Self::Local),
            "mpv" | "external" => Some(Self::Mpv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Track {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub album_id: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub artist_id: Option<String>,
    #[serde(default)]
    pub cover_art: Option<String>,
    /// Seconds; zero when the server did not report one.
    #[serde(default)]
    pub duration: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub starred: Option<OffsetDateTime>,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            album: None,
            album_id: None,
            artist: None,
            artist_id: None,
            cover_art: None,
            duration: 0.0,
            starred: None,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = seconds.max(0.0);
        self
    }

    pub fn display_name(&self) -> String {
        match &self.artist {
            Some(artist) => format!("{artist} - {}", self.title),
            None => self.title.clone(),
        }
    }
}

/// Server-held play queue used for cross-device resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedPlayQueue {
    pub track_ids: Vec<String>,
    pub current_id: Option<String>,
    pub position_ms: Option<u64>,
}

/// Play queue as pulled from the server, with full entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemotePlayQueue {
    pub tracks: Vec<Track>,
    pub current_id: Option<String>,
    pub position_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub mpv_path: Option<PathBuf>,
    #[serde(default)]
    pub mpv_args: Vec<String>,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub repeat: RepeatMode,
}

fn default_volume() -> f32 {
    1.0
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            mpv_path: None,
            mpv_args: Vec::new(),
            volume: default_volume(),
            repeat: RepeatMode::default(),
        }
    }
}
