//! SoundCloud api-v2 client used by the bot's play/search commands.
//!
//! Thin HTTP glue: resolve a track URL, search for one track, exchange a
//! transcoding reference for a streamable URL. Resolved tracks are cached in
//! memory for fifteen minutes keyed by permalink URL.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use regex::Regex;

const API_BASE: &str = "https://api-v2.soundcloud.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const CACHE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, thiserror::Error)]
pub enum SoundCloudError {
    #[error("not a soundcloud track url")]
    InvalidUrl,

    #[error("sound does not exist")]
    NotFound,

    #[error("not a track (kind: {kind})")]
    NotATrack { kind: String },

    #[error("no search results")]
    NoResults,

    #[error("unexpected response shape: {0}")]
    Shape(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// `https://soundcloud.com/<artist>/<sound>`, scheme optional.
pub fn is_track_url(url: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(https://)?soundcloud\.com/.+/[^/]+$").expect("track url regex")
    })
    .is_match(url)
}

#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub title: String,
    pub duration_ms: u64,
    pub permalink_url: String,
    pub artwork_url: Option<String>,
    /// Transcoding reference, exchanged for a stream URL via [`SoundCloud::stream_url`].
    pub transcoding_url: String,
    pub user: TrackUser,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackUser {
    pub username: String,
    pub avatar_url: Option<String>,
    pub permalink_url: String,
}

struct CacheEntry {
    track: Track,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct SoundCloud {
    http: reqwest::Client,
    client_id: String,
    cache: Arc<tokio::sync::Mutex<HashMap<String, CacheEntry>>>,
}

impl SoundCloud {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client build"),
            client_id: client_id.into(),
            cache: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Resolve a track page URL to its metadata.
    pub async fn resolve(&self, url: &str) -> Result<Track, SoundCloudError> {
        if !is_track_url(url) {
            return Err(SoundCloudError::InvalidUrl);
        }
        let url = url.split('?').next().unwrap_or(url);

        if let Some(track) = self.cached(url).await {
            return Ok(track);
        }

        let body: serde_json::Value = self
            .http
            .get(format!("{API_BASE}/resolve"))
            .query(&[("url", url), ("client_id", &self.client_id)])
            .send()
            .await?
            .json()
            .await?;

        if let Some(errors) = body.get("errors").and_then(|v| v.as_array()) {
            let not_found = errors.iter().any(|e| {
                e.get("error_message")
                    .and_then(|m| m.as_str())
                    .map(|m| m.contains("404"))
                    .unwrap_or(false)
            });
            if not_found {
                return Err(SoundCloudError::NotFound);
            }
        }

        let kind = body.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        if kind != "track" {
            return Err(SoundCloudError::NotATrack {
                kind: kind.to_string(),
            });
        }

        let track = parse_track(&body)?;
        self.remember(track.clone()).await;
        Ok(track)
    }

    /// Search for a song; only the top hit is ever used.
    pub async fn search(&self, term: &str) -> Result<Track, SoundCloudError> {
        let body: serde_json::Value = self
            .http
            .get(format!("{API_BASE}/search/tracks"))
            .query(&[
                ("q", term),
                ("limit", "1"),
                ("client_id", &self.client_id),
            ])
            .send()
            .await?
            .json()
            .await?;

        let first = body
            .get("collection")
            .and_then(|v| v.as_array())
            .and_then(|c| c.first())
            .ok_or(SoundCloudError::NoResults)?;

        let track = parse_track(first)?;
        self.remember(track.clone()).await;
        Ok(track)
    }

    /// Exchange a track's transcoding reference for the actual stream URL.
    pub async fn stream_url(&self, transcoding_url: &str) -> Result<String, SoundCloudError> {
        let body: serde_json::Value = self
            .http
            .get(transcoding_url)
            .query(&[("client_id", &self.client_id)])
            .send()
            .await?
            .json()
            .await?;

        body.get("url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| SoundCloudError::Shape("stream response missing url".to_string()))
    }

    async fn cached(&self, permalink_url: &str) -> Option<Track> {
        let cache = self.cache.lock().await;
        cache
            .get(permalink_url)
            .filter(|e| Instant::now() < e.expires_at)
            .map(|e| e.track.clone())
    }

    async fn remember(&self, track: Track) {
        self.cache.lock().await.insert(
            track.permalink_url.clone(),
            CacheEntry {
                track,
                expires_at: Instant::now() + CACHE_TTL,
            },
        );
    }
}

fn parse_track(v: &serde_json::Value) -> Result<Track, SoundCloudError> {
    let str_field = |v: &serde_json::Value, key: &str| {
        v.get(key)
            .and_then(|x| x.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| SoundCloudError::Shape(format!("missing {key}")))
    };

    // The second transcoding is the progressive stream the player wants.
    let transcoding_url = v
        .get("media")
        .and_then(|m| m.get("transcodings"))
        .and_then(|t| t.as_array())
        .and_then(|t| t.get(1))
        .and_then(|t| t.get("url"))
        .and_then(|u| u.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| SoundCloudError::Shape("missing media.transcodings[1].url".to_string()))?;

    let user = v
        .get("user")
        .ok_or_else(|| SoundCloudError::Shape("missing user".to_string()))?;

    Ok(Track {
        title: str_field(v, "title")?,
        duration_ms: v.get("duration").and_then(|d| d.as_u64()).unwrap_or(0),
        permalink_url: str_field(v, "permalink_url")?,
        artwork_url: v
            .get("artwork_url")
            .and_then(|a| a.as_str())
            .map(|s| s.to_string()),
        transcoding_url,
        user: TrackUser {
            username: str_field(user, "username")?,
            avatar_url: user
                .get("avatar_url")
                .and_then(|a| a.as_str())
                .map(|s| s.to_string()),
            permalink_url: str_field(user, "permalink_url")?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_track() -> serde_json::Value {
        json!({
            "kind": "track",
            "title": "Nightcall",
            "duration": 258_000,
            "permalink_url": "https://soundcloud.com/kavinsky/nightcall",
            "artwork_url": "https://i1.sndcdn.com/artworks-xyz-large.jpg",
            "media": {
                "transcodings": [
                    {"url": "https://api-v2.soundcloud.com/media/1/hls"},
                    {"url": "https://api-v2.soundcloud.com/media/1/progressive"}
                ]
            },
            "user": {
                "username": "Kavinsky",
                "avatar_url": "https://i1.sndcdn.com/avatars-abc-large.jpg",
                "permalink_url": "https://soundcloud.com/kavinsky"
            }
        })
    }

    #[test]
    fn track_url_matching() {
        assert!(is_track_url("https://soundcloud.com/kavinsky/nightcall"));
        assert!(is_track_url("soundcloud.com/kavinsky/nightcall"));
        assert!(!is_track_url("https://soundcloud.com/kavinsky"));
        assert!(!is_track_url("https://example.com/kavinsky/nightcall"));
        assert!(!is_track_url("https://soundcloud.com/kavinsky/sets/album"));
    }

    #[test]
    fn parse_track_picks_the_progressive_transcoding() {
        let track = parse_track(&sample_track()).unwrap();
        assert_eq!(track.title, "Nightcall");
        assert_eq!(track.duration_ms, 258_000);
        assert_eq!(
            track.transcoding_url,
            "https://api-v2.soundcloud.com/media/1/progressive"
        );
        assert_eq!(track.user.username, "Kavinsky");
    }

    #[test]
    fn parse_track_rejects_missing_transcodings() {
        let mut v = sample_track();
        v["media"]["transcodings"] = json!([]);
        assert!(matches!(
            parse_track(&v),
            Err(SoundCloudError::Shape(_))
        ));
    }

    #[tokio::test]
    async fn cache_expires_after_ttl() {
        let sc = SoundCloud::new("client-id");
        let track = parse_track(&sample_track()).unwrap();
        let url = track.permalink_url.clone();

        sc.remember(track.clone()).await;
        assert_eq!(sc.cached(&url).await, Some(track));

        // Age the entry past its deadline.
        {
            let mut cache = sc.cache.lock().await;
            let entry = cache.get_mut(&url).unwrap();
            entry.expires_at = Instant::now()
                .checked_sub(Duration::from_secs(1))
                .unwrap_or_else(Instant::now);
        }
        assert_eq!(sc.cached(&url).await, None);
    }

    #[tokio::test]
    async fn resolve_rejects_non_track_urls_before_any_request() {
        let sc = SoundCloud::new("client-id");
        assert!(matches!(
            sc.resolve("https://soundcloud.com/kavinsky").await,
            Err(SoundCloudError::InvalidUrl)
        ));
    }
}
