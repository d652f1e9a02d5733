use crate::model::{RemotePlayQueue, SavedPlayQueue, Track};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const API_VERSION: &str = "1.16.1";
const CLIENT_NAME: &str = "subtune";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_NOT_FOUND: i64 = 70;

/// Remote catalog calls the player depends on.
pub trait CatalogClient {
    fn stream_url(&self, track_id: &str) -> Result<String>;
    fn cover_art_url(&self, cover_id: &str, size: u32) -> Result<String>;
    /// `submission == false` reports "now playing", `true` a completed listen.
    fn scrobble(&self, track_id: &str, submission: bool) -> Result<()>;
    fn get_play_queue(&self) -> Result<Option<RemotePlayQueue>>;
    fn save_play_queue(&self, queue: &SavedPlayQueue) -> Result<()>;
    fn get_song(&self, track_id: &str) -> Result<Track>;
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

pub struct SubsonicClient {
    server: ServerConfig,
    agent: ureq::Agent,
}

impl SubsonicClient {
    pub fn new(server: ServerConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into();
        Self { server, agent }
    }

    pub fn endpoint(&self, method: &str, params: &[(&str, &str)]) -> String {
        let base = self.server.base_url.trim_end_matches('/');
        let password = format!("enc:{}", hex_encode(self.server.password.as_bytes()));
        let mut url = format!(
            "{base}/rest/{method}.view?u={}&p={}&v={API_VERSION}&c={CLIENT_NAME}&f=json",
            encode_component(&self.server.username),
            encode_component(&password),
        );
        for (key, value) in params {
            url.push('&');
            url.push_str(&encode_component(key));
            url.push('=');
            url.push_str(&encode_component(value));
        }
        url
    }

    fn call(&self, method: &str, params: &[(&str, &str)]) -> Result<ResponseBody> {
        let url = self.endpoint(method, params);
        let mut response = self
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("{method} request failed"))?;
        let raw = response
            .body_mut()
            .read_to_string()
            .with_context(|| format!("failed to read {method} response"))?;
        parse_response(method, &raw)
    }
}

impl CatalogClient for SubsonicClient {
    fn stream_url(&self, track_id: &str) -> Result<String> {
        Ok(self.endpoint("stream", &[("id", track_id)]))
    }

    fn cover_art_url(&self, cover_id: &str, size: u32) -> Result<String> {
        let size = size.to_string();
        Ok(self.endpoint("getCoverArt", &[("id", cover_id), ("size", &size)]))
    }

    fn scrobble(&self, track_id: &str, submission: bool) -> Result<()> {
        let millis = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).to_string();
        let submission = if submission { "true" } else { "false" };
        self.call(
            "scrobble",
            &[("id", track_id), ("submission", submission), ("time", &millis)],
        )?;
        Ok(())
    }

    fn get_play_queue(&self) -> Result<Option<RemotePlayQueue>> {
        let body = match self.call("getPlayQueue", &[]) {
            Ok(body) => body,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(body.play_queue.map(WirePlayQueue::into_remote))
    }

    fn save_play_queue(&self, queue: &SavedPlayQueue) -> Result<()> {
        let position = queue.position_ms.map(|ms| ms.to_string());
        let mut params: Vec<(&str, &str)> = queue
            .track_ids
            .iter()
            .map(|id| ("id", id.as_str()))
            .collect();
        if let Some(current) = &queue.current_id {
            params.push(("current", current));
        }
        if let Some(position) = &position {
            params.push(("position", position));
        }
        self.call("savePlayQueue", &params)?;
        Ok(())
    }

    fn get_song(&self, track_id: &str) -> Result<Track> {
        let body = self.call("getSong", &[("id", track_id)])?;
        let song = body
            .song
            .with_context(|| format!("server returned no song for {track_id}"))?;
        song.into_track()
            .with_context(|| format!("song {track_id} has no id"))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("server error {code}: {message}")]
struct SubsonicError {
    code: i64,
    message: String,
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SubsonicError>()
        .is_some_and(|err| err.code == ERROR_NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "subsonic-response")]
    response: ResponseBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseBody {
    status: String,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    play_queue: Option<WirePlayQueue>,
    #[serde(default)]
    song: Option<WireSong>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePlayQueue {
    #[serde(default)]
    entry: Vec<WireSong>,
    #[serde(default)]
    current: Option<Value>,
    #[serde(default)]
    position: Option<u64>,
}

impl WirePlayQueue {
    fn into_remote(self) -> RemotePlayQueue {
        RemotePlayQueue {
            tracks: self
                .entry
                .into_iter()
                .filter_map(WireSong::into_track)
                .collect(),
            current_id: self.current.as_ref().and_then(id_string),
            position_ms: self.position,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSong {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    album: Option<String>,
    #[serde(default)]
    album_id: Option<Value>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    artist_id: Option<Value>,
    #[serde(default)]
    cover_art: Option<Value>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    starred: Option<String>,
}

impl WireSong {
    fn into_track(self) -> Option<Track> {
        let id = id_string(&self.id)?;
        Some(Track {
            title: self.title.unwrap_or_else(|| id.clone()),
            id,
            album: self.album,
            album_id: self.album_id.as_ref().and_then(id_string),
            artist: self.artist,
            artist_id: self.artist_id.as_ref().and_then(id_string),
            cover_art: self.cover_art.as_ref().and_then(id_string),
            duration: self.duration.unwrap_or(0.0).max(0.0),
            starred: self
                .starred
                .as_deref()
                .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok()),
        })
    }
}

fn parse_response(method: &str, raw: &str) -> Result<ResponseBody> {
    let envelope: Envelope = serde_json::from_str(raw)
        .with_context(|| format!("failed to parse {method} response"))?;
    let body = envelope.response;
    if body.status != "ok" {
        let (code, message) = body
            .error
            .map(|err| (err.code, err.message.unwrap_or_default()))
            .unwrap_or((0, String::from("unknown error")));
        return Err(anyhow::Error::new(SubsonicError { code, message })
            .context(format!("{method} rejected by server")));
    }
    Ok(body)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn encode_component(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SubsonicClient {
        SubsonicClient::new(ServerConfig {
            base_url: String::from("https://music.example.com/"),
            username: String::from("me@home"),
            password: String::from("pw"),
        })
    }

    #[test]
    fn stream_url_carries_auth_and_id() {
        let url = client().stream_url("song 1").expect("url");
        assert_eq!(
            url,
            "https://music.example.com/rest/stream.view?u=me%40home&p=enc%3A7077&v=1.16.1&c=subtune&f=json&id=song%201"
        );
    }

    #[test]
    fn cover_art_url_includes_size() {
        let url = client().cover_art_url("al-9", 300).expect("url");
        assert!(url.contains("/rest/getCoverArt.view?"));
        assert!(url.ends_with("&id=al-9&size=300"));
    }

    #[test]
    fn play_queue_maps_entries_and_numeric_ids() {
        let raw = r#"{"subsonic-response":{"status":"ok","version":"1.16.1","playQueue":{
            "current":2,"position":61500,
            "entry":[
                {"id":1,"title":"One","artist":"A","albumId":"al1","coverArt":"al1","duration":200},
                {"id":"2","title":"Two","starred":"2023-05-01T08:00:00.000Z"},
                {"title":"no id"}
            ]}}}"#;
        let body = parse_response("getPlayQueue", raw).expect("parse");
        let queue = body.play_queue.expect("queue").into_remote();

        assert_eq!(queue.tracks.len(), 2);
        assert_eq!(queue.tracks[0].id, "1");
        assert_eq!(queue.tracks[0].duration, 200.0);
        assert_eq!(queue.tracks[0].album_id.as_deref(), Some("al1"));
        assert!(queue.tracks[1].starred.is_some());
        assert_eq!(queue.current_id.as_deref(), Some("2"));
        assert_eq!(queue.position_ms, Some(61_500));
    }

    #[test]
    fn failed_status_surfaces_server_message() {
        let raw = r#"{"subsonic-response":{"status":"failed","error":{"code":70,"message":"No play queue"}}}"#;
        let err = parse_response("getPlayQueue", raw).expect_err("should fail");
        assert!(is_not_found(&err));
        assert!(format!("{err:#}").contains("No play queue"));
    }

    #[test]
    fn encode_component_escapes_reserved_bytes() {
        assert_eq!(encode_component("a b&c=d/é"), "a%20b%26c%3Dd%2F%C3%A9");
        assert_eq!(hex_encode(b"sesame"), "736573616d65");
    }
}
