//! External metadata lookup.
//!
//! `LookupService` is the seam the fetcher talks to. `SpotifySession` is the
//! production implementation: a client-credentials session built once per
//! run and handed to the fetcher, never stored in a global.

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::models::{LookupOutcome, MetadataRecord};

/// One lookup per call, strictly sequential.
pub trait LookupService {
    fn lookup(&mut self, track: &str, artist: &str) -> LookupOutcome;
}

const DEFAULT_API_BASE: &str = "https://api.spotify.com";
const DEFAULT_ACCOUNTS_BASE: &str = "https://accounts.spotify.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Refresh the token this long before it actually expires
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const ENRICHMENT_SOURCE: &str = "spotify_api";

#[derive(Clone)]
pub struct SpotifyCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for SpotifyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifyCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct SpotifyEndpoints {
    pub api_base: String,
    pub accounts_base: String,
}

impl Default for SpotifyEndpoints {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            accounts_base: DEFAULT_ACCOUNTS_BASE.to_string(),
        }
    }
}

// ============================================================================
// Wire Models
// ============================================================================

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct SearchResponse {
    tracks: Option<TrackPage>,
}

#[derive(Deserialize)]
struct TrackPage {
    #[serde(default)]
    items: Vec<TrackItem>,
}

#[derive(Deserialize)]
struct TrackItem {
    id: Option<String>,
    uri: Option<String>,
    popularity: Option<i64>,
    duration_ms: Option<i64>,
    explicit: Option<bool>,
    preview_url: Option<String>,
    album: Option<AlbumItem>,
    #[serde(default)]
    artists: Vec<ArtistRef>,
}

#[derive(Deserialize)]
struct AlbumItem {
    name: Option<String>,
    release_date: Option<String>,
    release_date_precision: Option<String>,
    total_tracks: Option<i64>,
    album_type: Option<String>,
}

#[derive(Deserialize)]
struct ArtistRef {
    id: Option<String>,
}

#[derive(Deserialize)]
struct ArtistResponse {
    popularity: Option<i64>,
    followers: Option<Followers>,
    #[serde(default)]
    genres: Vec<String>,
}

#[derive(Deserialize)]
struct Followers {
    total: Option<i64>,
}

fn to_metadata(track: TrackItem, artist: Option<ArtistResponse>) -> MetadataRecord {
    let album = track.album.unwrap_or(AlbumItem {
        name: None,
        release_date: None,
        release_date_precision: None,
        total_tracks: None,
        album_type: None,
    });
    let genres = artist
        .as_ref()
        .map(|a| a.genres.join(", "))
        .filter(|g| !g.is_empty());

    MetadataRecord {
        spotify_id: track.id,
        spotify_uri: track.uri,
        track_popularity: track.popularity,
        track_duration_ms: track.duration_ms,
        track_explicit: track.explicit,
        track_preview_url: track.preview_url,
        album_name: album.name,
        album_release_date: album.release_date,
        album_release_date_precision: album.release_date_precision,
        album_total_tracks: album.total_tracks,
        album_type: album.album_type,
        artist_popularity: artist.as_ref().and_then(|a| a.popularity),
        artist_followers: artist.as_ref().and_then(|a| a.followers.as_ref()).and_then(|f| f.total),
        api_genres: genres,
        enrichment_source: Some(ENRICHMENT_SOURCE.to_string()),
    }
}

// ============================================================================
// Status Classification
// ============================================================================

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success response to the outcome the fetcher acts on.
/// `None` means the response is usable.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> Option<LookupOutcome> {
    if status.is_success() {
        return None;
    }
    let outcome = match status.as_u16() {
        401 => LookupOutcome::Fatal(format!("request rejected with {}", status)),
        429 => LookupOutcome::Transient {
            reason: "rate limited (429)".to_string(),
            retry_after: retry_after(headers),
        },
        403 => LookupOutcome::Transient {
            reason: "forbidden (403), treated as rate limiting".to_string(),
            retry_after: retry_after(headers),
        },
        400 | 404 => LookupOutcome::NotFound,
        _ => LookupOutcome::Transient {
            reason: format!("service returned {}", status),
            retry_after: None,
        },
    };
    Some(outcome)
}

// ============================================================================
// Session
// ============================================================================

enum TokenError {
    Rejected(String),
    Unreachable(String),
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

pub struct SpotifySession {
    client: Client,
    credentials: SpotifyCredentials,
    endpoints: SpotifyEndpoints,
    token: Option<AccessToken>,
}

impl SpotifySession {
    /// Build the HTTP client and authenticate once. A rejected token exchange
    /// is `PipelineError::Authentication`.
    pub fn connect(credentials: SpotifyCredentials, endpoints: SpotifyEndpoints) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("history-enrich/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        let mut session = Self {
            client,
            credentials,
            endpoints,
            token: None,
        };

        match session.request_token() {
            Ok(token) => session.token = Some(token),
            Err(TokenError::Rejected(reason)) => return Err(PipelineError::Authentication(reason).into()),
            Err(TokenError::Unreachable(reason)) => {
                anyhow::bail!("Could not reach the accounts service: {}", reason)
            }
        }
        info!("Authenticated with client id {}", session.credentials.client_id);
        Ok(session)
    }

    fn request_token(&self) -> std::result::Result<AccessToken, TokenError> {
        let url = format!("{}/api/token", self.endpoints.accounts_base);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .map_err(|e| TokenError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = response.text().unwrap_or_default();
            return Err(TokenError::Rejected(format!("token exchange returned {}: {}", status, body)));
        }
        if !status.is_success() {
            return Err(TokenError::Unreachable(format!("token exchange returned {}", status)));
        }

        let body: TokenResponse = response
            .json()
            .map_err(|e| TokenError::Unreachable(format!("unreadable token response: {}", e)))?;
        Ok(AccessToken {
            value: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        })
    }

    /// Current bearer token, refreshed when close to expiry.
    fn bearer(&mut self) -> std::result::Result<String, LookupOutcome> {
        let fresh = self
            .token
            .as_ref()
            .is_some_and(|t| Instant::now() + TOKEN_REFRESH_MARGIN < t.expires_at);
        if !fresh {
            debug!("Refreshing access token");
            match self.request_token() {
                Ok(token) => self.token = Some(token),
                Err(TokenError::Rejected(reason)) => return Err(LookupOutcome::Fatal(reason)),
                Err(TokenError::Unreachable(reason)) => {
                    return Err(LookupOutcome::Transient {
                        reason,
                        retry_after: None,
                    })
                }
            }
        }
        self.token
            .as_ref()
            .map(|t| t.value.clone())
            .ok_or_else(|| LookupOutcome::Fatal("no access token".to_string()))
    }

    /// GET a JSON resource. A 401 triggers one token refresh before giving up.
    fn get_json<T: DeserializeOwned>(
        &mut self,
        url: &str,
        query: &[(&str, &str)],
    ) -> std::result::Result<T, LookupOutcome> {
        for attempt in 0..2 {
            let token = self.bearer()?;
            let response = self
                .client
                .get(url)
                .bearer_auth(&token)
                .query(query)
                .send()
                .map_err(|e| LookupOutcome::Transient {
                    reason: format!("request failed: {}", e),
                    retry_after: None,
                })?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                self.token = None;
                continue;
            }
            if let Some(outcome) = classify_status(status, response.headers()) {
                return Err(outcome);
            }
            return response.json::<T>().map_err(|e| LookupOutcome::Transient {
                reason: format!("unreadable response: {}", e),
                retry_after: None,
            });
        }
        Err(LookupOutcome::Fatal(
            "access token rejected after refresh".to_string(),
        ))
    }
}

impl LookupService for SpotifySession {
    fn lookup(&mut self, track: &str, artist: &str) -> LookupOutcome {
        let search_url = format!("{}/v1/search", self.endpoints.api_base);
        let query = format!("track:{} artist:{}", track, artist);
        let search: SearchResponse =
            match self.get_json(&search_url, &[("q", query.as_str()), ("type", "track"), ("limit", "1")]) {
                Ok(body) => body,
                Err(outcome) => return outcome,
            };

        let Some(item) = search.tracks.and_then(|page| page.items.into_iter().next()) else {
            return LookupOutcome::NotFound;
        };

        // Artist details are optional enrichment: only an auth failure aborts
        let artist_id = item.artists.first().and_then(|a| a.id.clone());
        let artist_meta = match artist_id {
            Some(id) => {
                let url = format!("{}/v1/artists/{}", self.endpoints.api_base, id);
                match self.get_json::<ArtistResponse>(&url, &[]) {
                    Ok(body) => Some(body),
                    Err(LookupOutcome::Fatal(reason)) => return LookupOutcome::Fatal(reason),
                    Err(other) => {
                        warn!("Artist fetch failed for {}: {:?}", artist, other);
                        None
                    }
                }
            }
            None => None,
        };

        LookupOutcome::Found(to_metadata(item, artist_meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_status() {
        let empty = HeaderMap::new();
        assert_eq!(classify_status(StatusCode::OK, &empty), None);
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, &empty),
            Some(LookupOutcome::Fatal(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &empty),
            Some(LookupOutcome::Transient { .. })
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &empty),
            Some(LookupOutcome::Transient { .. })
        ));
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, &empty),
            Some(LookupOutcome::NotFound)
        );
    }

    #[test]
    fn test_rate_limit_honours_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        match classify_status(StatusCode::TOO_MANY_REQUESTS, &headers) {
            Some(LookupOutcome::Transient { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_search_payload_to_metadata() {
        let search: SearchResponse = serde_json::from_str(
            r#"{"tracks": {"items": [{
                "id": "4uLU6hMCjMI75M1A2tKUQC",
                "uri": "spotify:track:4uLU6hMCjMI75M1A2tKUQC",
                "popularity": 77,
                "duration_ms": 213573,
                "explicit": false,
                "preview_url": null,
                "album": {"name": "Whenever You Need Somebody", "release_date": "1987-11-12",
                          "release_date_precision": "day", "total_tracks": 10, "album_type": "album"},
                "artists": [{"id": "0gxyHStUsqpMadRV0Di1Qt", "name": "Rick Astley"}]
            }]}}"#,
        )
        .unwrap();
        let artist: ArtistResponse = serde_json::from_str(
            r#"{"popularity": 70, "followers": {"total": 4000000}, "genres": ["dance rock", "new wave pop"]}"#,
        )
        .unwrap();

        let item = search.tracks.unwrap().items.into_iter().next().unwrap();
        let meta = to_metadata(item, Some(artist));
        assert_eq!(meta.spotify_id.as_deref(), Some("4uLU6hMCjMI75M1A2tKUQC"));
        assert_eq!(meta.track_preview_url, None);
        assert_eq!(meta.album_total_tracks, Some(10));
        assert_eq!(meta.artist_followers, Some(4_000_000));
        assert_eq!(meta.api_genres.as_deref(), Some("dance rock, new wave pop"));
        assert_eq!(meta.enrichment_source.as_deref(), Some("spotify_api"));
    }

    #[test]
    fn test_metadata_without_artist_details() {
        let item: TrackItem = serde_json::from_str(r#"{"id": "abc"}"#).unwrap();
        let meta = to_metadata(item, None);
        assert!(meta.has_primary_id());
        assert_eq!(meta.api_genres, None);
        assert_eq!(meta.artist_popularity, None);
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = SpotifyCredentials {
            client_id: "id".to_string(),
            client_secret: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
