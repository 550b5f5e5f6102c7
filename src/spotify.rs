use crate::{Error, Result, CONFIG};

const ACCOUNTS_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";

/// Token payload returned by the accounts service for both the initial
/// code exchange and later refreshes. Refresh responses usually omit the
/// refresh_token, but spotify reserves the right to rotate it.
#[derive(serde::Deserialize, Debug)]
pub struct TokenGrant {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
}

#[derive(serde::Serialize)]
struct AccessParams {
    grant_type: String,
    code: String,
    redirect_uri: String,
}

impl AccessParams {
    fn from_code(code: &str) -> Self {
        AccessParams {
            grant_type: "authorization_code".to_string(),
            code: code.to_string(),
            redirect_uri: CONFIG.spotify_redirect_url(),
        }
    }
}

#[derive(serde::Serialize)]
struct RefreshParams {
    grant_type: String,
    refresh_token: String,
}

impl RefreshParams {
    fn from_token(token: &str) -> Self {
        RefreshParams {
            grant_type: "refresh_token".to_string(),
            refresh_token: token.to_string(),
        }
    }
}

async fn token_request<P: serde::Serialize>(params: &P) -> Result<TokenGrant> {
    let auth = base64::encode(
        format!("{}:{}", CONFIG.spotify_client_id, CONFIG.spotify_client_secret).as_bytes(),
    );
    let body = surf::Body::from_form(params)
        .map_err(|e| Error::Internal(format!("form encode error {:?}", e)))?;
    let mut resp = surf::post(ACCOUNTS_TOKEN_URL)
        .body(body)
        .header("authorization", format!("Basic {}", auth))
        .send()
        .await
        .map_err(|e| Error::Upstream(format!("token request error {:?}", e)))?;
    if !resp.status().is_success() {
        return Err(Error::Upstream(format!(
            "token endpoint returned {}",
            resp.status()
        )));
    }
    resp.body_json()
        .await
        .map_err(|e| Error::Upstream(format!("token response parse error {:?}", e)))
}

/// Trade the single-use authorization code from the login redirect for
/// an access/refresh token pair.
pub async fn exchange_code(code: &str) -> Result<TokenGrant> {
    token_request(&AccessParams::from_code(code)).await
}

pub async fn refresh_access_token(refresh_token: &str) -> Result<TokenGrant> {
    token_request(&RefreshParams::from_token(refresh_token)).await
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct Image {
    pub url: String,
}

#[derive(serde::Deserialize, Debug)]
pub struct PrivateUser {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub country: Option<String>,
    #[serde(default)]
    pub images: Vec<Image>,
}

impl PrivateUser {
    pub fn image_url(&self) -> String {
        self.images
            .first()
            .map(|i| i.url.clone())
            .unwrap_or_default()
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct ArtistRef {
    pub name: String,
}

#[derive(serde::Deserialize, Debug, Clone, Default)]
pub struct ExternalUrls {
    pub spotify: Option<String>,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct AlbumRef {
    pub name: String,
    #[serde(default)]
    pub images: Vec<Image>,
}

/// A track as spotify reports it. Local files come back with a null id,
/// which callers must skip since there's nothing to key them on.
#[derive(serde::Deserialize, Debug, Clone)]
pub struct TrackObject {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    pub album: AlbumRef,
    pub preview_url: Option<String>,
    #[serde(default)]
    pub external_urls: ExternalUrls,
    #[serde(default)]
    pub duration_ms: i64,
}

impl TrackObject {
    pub fn artist_names(&self) -> Vec<String> {
        self.artists.iter().map(|a| a.name.clone()).collect()
    }

    pub fn album_image_url(&self) -> String {
        self.album
            .images
            .first()
            .map(|i| i.url.clone())
            .unwrap_or_default()
    }

    pub fn open_url(&self) -> String {
        self.external_urls.spotify.clone().unwrap_or_default()
    }
}

#[derive(serde::Deserialize, Debug)]
pub struct PlayHistoryItem {
    pub track: TrackObject,
    pub played_at: String,
}

#[derive(serde::Deserialize, Debug)]
struct RecentlyPlayedResponse {
    items: Vec<PlayHistoryItem>,
}

#[derive(serde::Deserialize, Debug)]
struct TopTracksResponse {
    items: Vec<TrackObject>,
}

/// The four audio descriptors we average into recommendation targets.
#[derive(serde::Deserialize, Debug, Clone)]
pub struct AudioFeatures {
    pub id: String,
    pub danceability: f64,
    pub energy: f64,
    pub valence: f64,
    pub tempo: f64,
}

#[derive(serde::Deserialize, Debug)]
struct AudioFeaturesResponse {
    // spotify returns a literal null for ids it has no analysis for
    audio_features: Vec<Option<AudioFeatures>>,
}

#[derive(serde::Deserialize, Debug)]
struct RecommendationsResponse {
    tracks: Vec<TrackObject>,
}

/// Target values passed to the recommendation endpoint.
#[derive(Debug, PartialEq)]
pub struct FeatureTargets {
    pub danceability: f64,
    pub energy: f64,
    pub valence: f64,
    pub tempo: f64,
}

#[derive(Debug, Clone, Copy)]
pub enum TimeRange {
    ShortTerm,
    MediumTerm,
    LongTerm,
}

impl TimeRange {
    fn as_param(&self) -> &'static str {
        match self {
            TimeRange::ShortTerm => "short_term",
            TimeRange::MediumTerm => "medium_term",
            TimeRange::LongTerm => "long_term",
        }
    }
}

fn recommendations_url(seed_ids: &[String], targets: &FeatureTargets, limit: u32) -> String {
    format!(
        "{base}/recommendations?limit={limit}&seed_tracks={seeds}&target_danceability={danceability}&target_energy={energy}&target_valence={valence}&target_tempo={tempo}",
        base = API_BASE,
        limit = limit,
        seeds = seed_ids.join(","),
        danceability = targets.danceability,
        energy = targets.energy,
        valence = targets.valence,
        tempo = targets.tempo,
    )
}

/// A web api client pre-configured with a valid access token. Always
/// obtained through the token manager so the token is known to be fresh.
pub struct Client {
    access_token: String,
}

impl Client {
    pub fn new(access_token: String) -> Self {
        Self { access_token }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut resp = surf::get(url)
            .header("authorization", format!("Bearer {}", self.access_token))
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("request error {:?}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "unexpected status {} from {}",
                resp.status(),
                url
            )));
        }
        resp.body_json()
            .await
            .map_err(|e| Error::Upstream(format!("response parse error {:?}", e)))
    }

    pub async fn me(&self) -> Result<PrivateUser> {
        self.get_json(&format!("{}/me", API_BASE)).await
    }

    pub async fn recently_played(&self, limit: u32) -> Result<Vec<PlayHistoryItem>> {
        let resp: RecentlyPlayedResponse = self
            .get_json(&format!(
                "{}/me/player/recently-played?limit={}",
                API_BASE, limit
            ))
            .await?;
        Ok(resp.items)
    }

    pub async fn top_tracks(&self, range: TimeRange, limit: u32) -> Result<Vec<TrackObject>> {
        let resp: TopTracksResponse = self
            .get_json(&format!(
                "{}/me/top/tracks?time_range={}&limit={}",
                API_BASE,
                range.as_param(),
                limit
            ))
            .await?;
        Ok(resp.items)
    }

    pub async fn audio_features(&self, ids: &[String]) -> Result<Vec<Option<AudioFeatures>>> {
        let resp: AudioFeaturesResponse = self
            .get_json(&format!("{}/audio-features?ids={}", API_BASE, ids.join(",")))
            .await?;
        Ok(resp.audio_features)
    }

    pub async fn recommendations(
        &self,
        seed_ids: &[String],
        targets: &FeatureTargets,
        limit: u32,
    ) -> Result<Vec<TrackObject>> {
        let resp: RecommendationsResponse = self
            .get_json(&recommendations_url(seed_ids, targets, limit))
            .await?;
        Ok(resp.tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recently_played_payload() {
        let raw = r#"{
            "items": [
                {
                    "track": {
                        "id": "11dFghVXANMlKmJXsNCbNl",
                        "name": "Cut To The Feeling",
                        "artists": [{"name": "Carly Rae Jepsen"}],
                        "album": {
                            "name": "Cut To The Feeling",
                            "images": [{"url": "https://i.scdn.co/image/ab67616d"}]
                        },
                        "preview_url": null,
                        "external_urls": {"spotify": "https://open.spotify.com/track/11dFghVXANMlKmJXsNCbNl"},
                        "duration_ms": 207959
                    },
                    "played_at": "2024-03-01T12:34:56.789Z"
                }
            ]
        }"#;
        let resp: RecentlyPlayedResponse = serde_json::from_str(raw).expect("parse error");
        assert_eq!(resp.items.len(), 1);
        let track = &resp.items[0].track;
        assert_eq!(track.id.as_deref(), Some("11dFghVXANMlKmJXsNCbNl"));
        assert_eq!(track.artist_names(), vec!["Carly Rae Jepsen".to_string()]);
        assert_eq!(track.album_image_url(), "https://i.scdn.co/image/ab67616d");
        assert_eq!(
            track.open_url(),
            "https://open.spotify.com/track/11dFghVXANMlKmJXsNCbNl"
        );
    }

    #[test]
    fn parses_local_track_with_null_id_and_missing_fields() {
        let raw = r#"{
            "id": null,
            "name": "Bootleg Recording",
            "album": {"name": "Unknown"}
        }"#;
        let track: TrackObject = serde_json::from_str(raw).expect("parse error");
        assert!(track.id.is_none());
        assert!(track.artist_names().is_empty());
        assert_eq!(track.album_image_url(), "");
        assert_eq!(track.open_url(), "");
        assert_eq!(track.duration_ms, 0);
    }

    #[test]
    fn parses_audio_features_with_null_entries() {
        let raw = r#"{
            "audio_features": [
                {"id": "a1", "danceability": 0.5, "energy": 0.8, "valence": 0.3, "tempo": 120.0},
                null
            ]
        }"#;
        let resp: AudioFeaturesResponse = serde_json::from_str(raw).expect("parse error");
        assert_eq!(resp.audio_features.len(), 2);
        assert!(resp.audio_features[0].is_some());
        assert!(resp.audio_features[1].is_none());
    }

    #[test]
    fn parses_token_grant_without_refresh_token() {
        let raw = r#"{
            "access_token": "BQD000",
            "token_type": "Bearer",
            "scope": "user-top-read",
            "expires_in": 3600
        }"#;
        let grant: TokenGrant = serde_json::from_str(raw).expect("parse error");
        assert_eq!(grant.expires_in, 3600);
        assert!(grant.refresh_token.is_none());
    }

    #[test]
    fn recommendations_url_carries_seeds_and_targets() {
        let targets = FeatureTargets {
            danceability: 0.5,
            energy: 0.75,
            valence: 0.25,
            tempo: 118.5,
        };
        let seeds = vec!["a1".to_string(), "b2".to_string()];
        let url = recommendations_url(&seeds, &targets, 20);
        assert!(url.starts_with("https://api.spotify.com/v1/recommendations?limit=20"));
        assert!(url.contains("seed_tracks=a1,b2"));
        assert!(url.contains("target_danceability=0.5"));
        assert!(url.contains("target_energy=0.75"));
        assert!(url.contains("target_valence=0.25"));
        assert!(url.contains("target_tempo=118.5"));
    }
}
