use serde_json::Value;
use sqlx::SqlitePool;

use crate::{crypto, db, models, se, Error, Result, CONFIG, LOG};

#[derive(serde::Deserialize, Debug)]
pub struct Access {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    // client-credentials grants come back without a scope
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

#[derive(serde::Serialize)]
struct ClientCredentialsParams {
    grant_type: String,
}

impl ClientCredentialsParams {
    fn new() -> Self {
        ClientCredentialsParams {
            grant_type: "client_credentials".to_string(),
        }
    }
}

/// The spotify consent page url the login endpoint redirects to.
pub fn authorize_url(state: &str) -> Result<String> {
    let (client_id, _) = CONFIG.spotify_credentials()?;
    Ok(format!(
        "{base}/authorize?client_id={id}&response_type=code&redirect_uri={redirect}&scope={scope}&state={state}",
        base = CONFIG.spotify_accounts_url,
        id = client_id,
        redirect = CONFIG.spotify_redirect_url(),
        scope = CONFIG.spotify_scopes.replace(' ', "%20"),
        state = state,
    ))
}

/// Validate a token endpoint response. Non-success statuses and
/// responses without an access token are both token exchange failures.
pub fn access_from_response(status: surf::StatusCode, body: Value) -> Result<Access> {
    if !status.is_success() {
        let detail = body["error_description"]
            .as_str()
            .or_else(|| body["error"].as_str())
            .unwrap_or("no detail");
        return Err(Error::token_exchange(format!(
            "token endpoint returned {}: {}",
            status, detail
        )));
    }
    if body["access_token"]
        .as_str()
        .map(str::is_empty)
        .unwrap_or(true)
    {
        return Err(Error::token_exchange("token response missing access_token"));
    }
    serde_json::from_value(body)
        .map_err(|e| Error::token_exchange(format!("unexpected token response shape: {}", e)))
}

async fn token_request<P: serde::Serialize>(params: &P) -> Result<Access> {
    let (client_id, client_secret) = CONFIG.spotify_credentials()?;
    let auth = base64::encode(format!("{}:{}", client_id, client_secret).as_bytes());
    let mut resp = surf::post(format!("{}/api/token", CONFIG.spotify_accounts_url))
        .body(surf::Body::from_form(params).map_err(|e| se!("form error {}", e))?)
        .header("authorization", format!("Basic {}", auth))
        .send()
        .await
        .map_err(|e| Error::token_exchange(format!("token request error: {}", e)))?;
    let status = resp.status();
    let body: Value = resp
        .body_json()
        .await
        .map_err(|e| Error::token_exchange(format!("token response parse error: {}", e)))?;
    access_from_response(status, body)
}

/// Exchange an authorization code for access and refresh tokens.
pub async fn exchange_code(code: &str) -> Result<Access> {
    if code.is_empty() {
        return Err(Error::token_exchange("empty authorization code"));
    }
    token_request(&AccessParams::from_code(code)).await
}

pub async fn refresh_access(refresh_token: &str) -> Result<Access> {
    token_request(&RefreshParams::from_token(refresh_token)).await
}

/// App-scoped token for public endpoints when nobody has logged in.
pub async fn client_credentials() -> Result<Access> {
    token_request(&ClientCredentialsParams::new()).await
}

#[derive(serde::Deserialize, Debug)]
pub struct Profile {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

pub async fn get_profile(access_token: &str) -> Result<Profile> {
    let url = format!("{}/me", CONFIG.spotify_api_url);
    let mut resp = surf::get(&url)
        .header("authorization", format!("Bearer {}", access_token))
        .send()
        .await
        .map_err(|e| Error::provider(&url, e))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::provider(&url, format!("status {}", status)));
    }
    let profile = resp
        .body_json()
        .await
        .map_err(|e| Error::provider(&url, e))?;
    Ok(profile)
}

async fn get_json(access_token: &str, url: &str) -> Result<Value> {
    let mut resp = surf::get(url)
        .header("authorization", format!("Bearer {}", access_token))
        .send()
        .await
        .map_err(|e| Error::provider(url, e))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::provider(url, format!("status {}", status)));
    }
    let body = resp
        .body_json()
        .await
        .map_err(|e| Error::provider(url, e))?;
    Ok(body)
}

/// The field contract every track response in this app follows,
/// whichever provider endpoint it came from.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrackOut {
    pub id: String,
    pub name: String,
    pub artist: String,
    pub album: String,
    pub image: Option<String>,
    pub duration: Option<i64>,
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ArtistOut {
    pub id: String,
    pub name: String,
    pub image: Option<String>,
    pub genres: Vec<String>,
    pub followers: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AlbumOut {
    pub id: String,
    pub name: String,
    pub artist: String,
    pub image: Option<String>,
    pub total_tracks: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PlaylistOut {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub image: Option<String>,
    pub total_tracks: Option<i64>,
}

#[derive(Debug, serde::Serialize)]
pub struct PlaylistDetailOut {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub image: Option<String>,
    pub followers: Option<i64>,
    pub tracks: Vec<TrackOut>,
}

fn first_image(images: &Value) -> Option<String> {
    images.as_array()?.first()?["url"]
        .as_str()
        .map(|s| s.to_string())
}

fn join_artist_names(artists: &Value) -> Result<String> {
    let artists = artists
        .as_array()
        .ok_or_else(|| se!("artists: unexpected shape {:?}", artists))?;
    let mut names = Vec::with_capacity(artists.len());
    for artist in artists {
        names.push(
            artist["name"]
                .as_str()
                .ok_or_else(|| se!("artist name: unexpected shape {:?}", artist))?,
        );
    }
    Ok(names.join(", "))
}

/// Flatten a provider track object down to our track contract.
/// Local files have no spotify id and come back as `None`.
pub fn shape_track(track: &Value) -> Result<Option<TrackOut>> {
    if track.is_null() || track["id"].is_null() {
        return Ok(None);
    }
    let id = track["id"]
        .as_str()
        .ok_or_else(|| se!("track id: unexpected shape {:?}", track))?;
    let name = track["name"]
        .as_str()
        .ok_or_else(|| se!("track name: unexpected shape {:?}", track))?;
    let album = track["album"]["name"]
        .as_str()
        .ok_or_else(|| se!("album name: unexpected shape {:?}", track))?;
    Ok(Some(TrackOut {
        id: id.to_string(),
        name: name.to_string(),
        artist: join_artist_names(&track["artists"])?,
        album: album.to_string(),
        image: first_image(&track["album"]["images"]),
        duration: track["duration_ms"].as_i64(),
        preview_url: track["preview_url"].as_str().map(|s| s.to_string()),
    }))
}

pub fn shape_artist(artist: &Value) -> Result<ArtistOut> {
    let id = artist["id"]
        .as_str()
        .ok_or_else(|| se!("artist id: unexpected shape {:?}", artist))?;
    let name = artist["name"]
        .as_str()
        .ok_or_else(|| se!("artist name: unexpected shape {:?}", artist))?;
    let genres = artist["genres"]
        .as_array()
        .map(|genres| {
            genres
                .iter()
                .filter_map(|g| g.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    Ok(ArtistOut {
        id: id.to_string(),
        name: name.to_string(),
        image: first_image(&artist["images"]),
        genres,
        followers: artist["followers"]["total"].as_i64(),
    })
}

pub fn shape_album(album: &Value) -> Result<AlbumOut> {
    let id = album["id"]
        .as_str()
        .ok_or_else(|| se!("album id: unexpected shape {:?}", album))?;
    let name = album["name"]
        .as_str()
        .ok_or_else(|| se!("album name: unexpected shape {:?}", album))?;
    Ok(AlbumOut {
        id: id.to_string(),
        name: name.to_string(),
        artist: join_artist_names(&album["artists"])?,
        image: first_image(&album["images"]),
        total_tracks: album["total_tracks"].as_i64(),
    })
}

pub fn shape_playlist(playlist: &Value) -> Result<PlaylistOut> {
    let id = playlist["id"]
        .as_str()
        .ok_or_else(|| se!("playlist id: unexpected shape {:?}", playlist))?;
    let name = playlist["name"]
        .as_str()
        .ok_or_else(|| se!("playlist name: unexpected shape {:?}", playlist))?;
    Ok(PlaylistOut {
        id: id.to_string(),
        name: name.to_string(),
        description: playlist["description"].as_str().map(|s| s.to_string()),
        owner: playlist["owner"]["display_name"]
            .as_str()
            .map(|s| s.to_string()),
        image: first_image(&playlist["images"]),
        total_tracks: playlist["tracks"]["total"].as_i64(),
    })
}

pub fn shape_playlist_detail(playlist: &Value) -> Result<PlaylistDetailOut> {
    let summary = shape_playlist(playlist)?;
    let tracks = shaped_tracks(&playlist["tracks"]["items"], Some("track"))?;
    Ok(PlaylistDetailOut {
        id: summary.id,
        name: summary.name,
        description: summary.description,
        owner: summary.owner,
        image: summary.image,
        followers: playlist["followers"]["total"].as_i64(),
        tracks,
    })
}

// `key` picks the track out of a wrapping item, e.g. saved and
// recently-played items nest the track under "track"
fn shaped_tracks(items: &Value, key: Option<&str>) -> Result<Vec<TrackOut>> {
    let items = items
        .as_array()
        .ok_or_else(|| se!("items: unexpected shape {:?}", items))?;
    let mut tracks = Vec::with_capacity(items.len());
    for item in items {
        let track = match key {
            Some(k) => &item[k],
            None => item,
        };
        if let Some(track) = shape_track(track)? {
            tracks.push(track);
        }
    }
    Ok(tracks)
}

/// One page of the user's saved tracks plus the url of the next page.
pub struct SavedTracksPage {
    pub tracks: Vec<TrackOut>,
    pub next: Option<String>,
}

pub fn parse_saved_tracks_page(body: &Value) -> Result<SavedTracksPage> {
    Ok(SavedTracksPage {
        tracks: shaped_tracks(&body["items"], Some("track"))?,
        next: body["next"].as_str().map(|s| s.to_string()),
    })
}

/// Fetch a page of saved tracks, either the first one or the `next`
/// url returned by a previous page.
pub async fn saved_tracks_page(access_token: &str, url: Option<&str>) -> Result<SavedTracksPage> {
    let url = match url {
        Some(u) => u.to_string(),
        None => format!(
            "{}/me/tracks?limit={}&offset=0",
            CONFIG.spotify_api_url, CONFIG.sync_page_size
        ),
    };
    let body = get_json(access_token, &url).await?;
    parse_saved_tracks_page(&body)
}

pub async fn top_tracks(access_token: &str) -> Result<Vec<TrackOut>> {
    let body = get_json(
        access_token,
        &format!("{}/me/top/tracks?limit=50", CONFIG.spotify_api_url),
    )
    .await?;
    shaped_tracks(&body["items"], None)
}

pub async fn recently_played(access_token: &str) -> Result<Vec<TrackOut>> {
    let body = get_json(
        access_token,
        &format!(
            "{}/me/player/recently-played?limit=50",
            CONFIG.spotify_api_url
        ),
    )
    .await?;
    shaped_tracks(&body["items"], Some("track"))
}

pub async fn top_artists(access_token: &str) -> Result<Vec<ArtistOut>> {
    let body = get_json(
        access_token,
        &format!("{}/me/top/artists?limit=50", CONFIG.spotify_api_url),
    )
    .await?;
    let items = body["items"]
        .as_array()
        .ok_or_else(|| se!("items: unexpected shape {:?}", body))?;
    items.iter().map(shape_artist).collect()
}

pub async fn followed_artists(access_token: &str) -> Result<Vec<ArtistOut>> {
    let body = get_json(
        access_token,
        &format!(
            "{}/me/following?type=artist&limit=50",
            CONFIG.spotify_api_url
        ),
    )
    .await?;
    let items = body["artists"]["items"]
        .as_array()
        .ok_or_else(|| se!("artists items: unexpected shape {:?}", body))?;
    items.iter().map(shape_artist).collect()
}

/// Albums aggregated from the user's top tracks, deduped by album id
/// in listening order.
pub async fn top_track_albums(access_token: &str) -> Result<Vec<AlbumOut>> {
    let body = get_json(
        access_token,
        &format!("{}/me/top/tracks?limit=50", CONFIG.spotify_api_url),
    )
    .await?;
    let items = body["items"]
        .as_array()
        .ok_or_else(|| se!("items: unexpected shape {:?}", body))?;
    let mut seen = std::collections::HashSet::new();
    let mut albums = vec![];
    for item in items {
        let album = shape_album(&item["album"])?;
        if seen.insert(album.id.clone()) {
            albums.push(album);
        }
    }
    Ok(albums)
}

pub async fn saved_albums(access_token: &str) -> Result<Vec<AlbumOut>> {
    let body = get_json(
        access_token,
        &format!("{}/me/albums?limit=50", CONFIG.spotify_api_url),
    )
    .await?;
    let items = body["items"]
        .as_array()
        .ok_or_else(|| se!("items: unexpected shape {:?}", body))?;
    items.iter().map(|item| shape_album(&item["album"])).collect()
}

pub async fn my_playlists(access_token: &str) -> Result<Vec<PlaylistOut>> {
    let body = get_json(
        access_token,
        &format!("{}/me/playlists?limit=50", CONFIG.spotify_api_url),
    )
    .await?;
    let items = body["items"]
        .as_array()
        .ok_or_else(|| se!("items: unexpected shape {:?}", body))?;
    items.iter().map(shape_playlist).collect()
}

pub async fn featured_playlists(access_token: &str) -> Result<Vec<PlaylistOut>> {
    let body = get_json(
        access_token,
        &format!(
            "{}/browse/featured-playlists?limit=50",
            CONFIG.spotify_api_url
        ),
    )
    .await?;
    let items = body["playlists"]["items"]
        .as_array()
        .ok_or_else(|| se!("playlists items: unexpected shape {:?}", body))?;
    items.iter().map(shape_playlist).collect()
}

pub async fn playlist_detail(access_token: &str, id: &str) -> Result<PlaylistDetailOut> {
    let body = get_json(
        access_token,
        &format!("{}/playlists/{}", CONFIG.spotify_api_url, id),
    )
    .await?;
    shape_playlist_detail(&body)
}

fn now_seconds() -> Result<i64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| se!("invalid duration {:?}", e))?
        .as_secs() as i64)
}

/// Epoch seconds at which a token valid for `expires_in` seconds
/// should be considered expired, with a minute of slack so we refresh
/// before spotify actually cuts us off.
pub fn expiry_seconds_to_epoch(expires_in: u64) -> Result<i64> {
    Ok(now_seconds()? + expires_in.saturating_sub(60) as i64)
}

/// Decrypt the stored access token for `user`, refreshing it through
/// the token endpoint first when it has expired.
pub async fn user_access_token(pool: &SqlitePool, user: &models::User) -> Result<String> {
    if user.access_expires > now_seconds()? {
        return crypto::decrypt(&crypto::Enc {
            value: user.access_token.clone(),
            nonce: user.access_nonce.clone(),
        });
    }

    slog::info!(LOG, "refreshing access token"; "spotify_id" => &user.spotify_id);
    let refresh = match (&user.refresh_token, &user.refresh_nonce) {
        (Some(value), Some(nonce)) => crypto::decrypt(&crypto::Enc {
            value: value.clone(),
            nonce: nonce.clone(),
        })?,
        _ => {
            return Err(Error::token_exchange(
                "access token expired and no refresh token is stored",
            ))
        }
    };

    let access = refresh_access(&refresh).await?;
    let enc_access = crypto::encrypt(&access.access_token)?;
    let access_expires = expiry_seconds_to_epoch(access.expires_in)?;
    db::update_user_access(pool, &user.spotify_id, &enc_access, access_expires).await?;
    Ok(access.access_token)
}

/// The token the read endpoints should use: the most recently
/// authenticated user's token when one exists, otherwise an
/// app-scoped client-credentials token.
pub async fn resolve_active_access_token(pool: &SqlitePool) -> Result<String> {
    match db::latest_user(pool).await? {
        Some(user) => user_access_token(pool, &user).await,
        None => Ok(client_credentials().await?.access_token),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn access_from_response_accepts_user_grant() {
        let body = json!({
            "access_token": "BQDe6",
            "token_type": "Bearer",
            "scope": "user-library-read",
            "expires_in": 3600,
            "refresh_token": "AQCx1",
        });
        let access = access_from_response(surf::StatusCode::Ok, body).expect("access error");
        assert_eq!(access.access_token, "BQDe6");
        assert_eq!(access.refresh_token.as_deref(), Some("AQCx1"));
    }

    #[test]
    fn access_from_response_accepts_app_grant_without_scope() {
        let body = json!({
            "access_token": "BQDe6",
            "token_type": "Bearer",
            "expires_in": 3600,
        });
        let access = access_from_response(surf::StatusCode::Ok, body).expect("access error");
        assert_eq!(access.access_token, "BQDe6");
        assert!(access.refresh_token.is_none());
        assert_eq!(access.scope, "");
    }

    #[test]
    fn access_from_response_rejects_error_status() {
        let body = json!({
            "error": "invalid_grant",
            "error_description": "Invalid authorization code",
        });
        let err = access_from_response(surf::StatusCode::BadRequest, body)
            .expect_err("should have failed");
        match err {
            Error::TokenExchange(detail) => {
                assert!(detail.contains("Invalid authorization code"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn access_from_response_rejects_missing_token() {
        let err = access_from_response(surf::StatusCode::Ok, json!({"expires_in": 3600}))
            .expect_err("should have failed");
        assert!(matches!(err, Error::TokenExchange(_)));
    }

    #[async_std::test]
    async fn exchange_code_rejects_an_empty_code() {
        let err = exchange_code("").await.expect_err("should have failed");
        assert!(matches!(err, Error::TokenExchange(_)));
    }

    #[test]
    fn shape_track_joins_artists_and_flattens_album() {
        let track = json!({
            "id": "t1",
            "name": "Shelter",
            "duration_ms": 218000,
            "preview_url": "https://p.scdn.co/mp3-preview/abc",
            "artists": [{"name": "Porter Robinson"}, {"name": "Madeon"}],
            "album": {
                "name": "Shelter",
                "images": [{"url": "https://i.scdn.co/image/big"}, {"url": "https://i.scdn.co/image/small"}],
            },
        });
        let out = shape_track(&track).expect("shape error").expect("no track");
        assert_eq!(out.id, "t1");
        assert_eq!(out.artist, "Porter Robinson, Madeon");
        assert_eq!(out.album, "Shelter");
        assert_eq!(out.image.as_deref(), Some("https://i.scdn.co/image/big"));
        assert_eq!(out.duration, Some(218000));
        assert_eq!(
            out.preview_url.as_deref(),
            Some("https://p.scdn.co/mp3-preview/abc")
        );
    }

    #[test]
    fn shape_track_skips_local_files() {
        let local = json!({
            "id": null,
            "name": "ripped.mp3",
            "artists": [],
            "album": {"name": ""},
        });
        assert!(shape_track(&local).expect("shape error").is_none());
        assert!(shape_track(&Value::Null).expect("shape error").is_none());
    }

    #[test]
    fn shape_track_rejects_garbage() {
        let garbage = json!({"id": "t1", "name": 42});
        assert!(shape_track(&garbage).is_err());
    }

    #[test]
    fn parse_saved_tracks_page_skips_local_and_keeps_next() {
        let body = json!({
            "items": [
                {"track": {
                    "id": "t1",
                    "name": "One",
                    "artists": [{"name": "A"}],
                    "album": {"name": "Album", "images": []},
                }},
                {"track": {
                    "id": null,
                    "name": "local.mp3",
                }},
            ],
            "next": "https://api.spotify.com/v1/me/tracks?offset=50&limit=50",
        });
        let page = parse_saved_tracks_page(&body).expect("parse error");
        assert_eq!(page.tracks.len(), 1);
        assert_eq!(page.tracks[0].id, "t1");
        assert_eq!(
            page.next.as_deref(),
            Some("https://api.spotify.com/v1/me/tracks?offset=50&limit=50")
        );
    }

    #[test]
    fn parse_saved_tracks_page_last_page_has_no_next() {
        let body = json!({"items": [], "next": null});
        let page = parse_saved_tracks_page(&body).expect("parse error");
        assert!(page.tracks.is_empty());
        assert!(page.next.is_none());
    }

    #[test]
    fn parse_saved_tracks_page_rejects_unexpected_shape() {
        assert!(parse_saved_tracks_page(&json!({"items": "nope"})).is_err());
    }

    #[test]
    fn shape_artist_reads_nested_followers() {
        let artist = json!({
            "id": "a1",
            "name": "Mitski",
            "genres": ["indie rock"],
            "followers": {"total": 2412979},
            "images": [{"url": "https://i.scdn.co/image/artist"}],
        });
        let out = shape_artist(&artist).expect("shape error");
        assert_eq!(out.name, "Mitski");
        assert_eq!(out.followers, Some(2412979));
        assert_eq!(out.genres, vec!["indie rock".to_string()]);
    }

    #[test]
    fn shape_playlist_reads_owner_and_track_total() {
        let playlist = json!({
            "id": "p1",
            "name": "liked",
            "description": "",
            "owner": {"display_name": "someone"},
            "images": [],
            "tracks": {"total": 17},
        });
        let out = shape_playlist(&playlist).expect("shape error");
        assert_eq!(out.owner.as_deref(), Some("someone"));
        assert_eq!(out.total_tracks, Some(17));
        assert!(out.image.is_none());
    }

    #[test]
    fn shape_playlist_detail_nests_shaped_tracks() {
        let playlist = json!({
            "id": "p1",
            "name": "liked",
            "owner": {"display_name": "someone"},
            "images": [],
            "followers": {"total": 3},
            "tracks": {
                "total": 1,
                "items": [{"track": {
                    "id": "t1",
                    "name": "One",
                    "artists": [{"name": "A"}],
                    "album": {"name": "Album", "images": []},
                }}],
            },
        });
        let out = shape_playlist_detail(&playlist).expect("shape error");
        assert_eq!(out.followers, Some(3));
        assert_eq!(out.tracks.len(), 1);
        assert_eq!(out.tracks[0].artist, "A");
    }

    #[test]
    fn expiry_shaves_a_minute_off() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock error")
            .as_secs() as i64;
        let expires = expiry_seconds_to_epoch(3600).expect("expiry error");
        assert!(expires >= now + 3539 && expires <= now + 3541);

        // shorter than the slack window should not underflow
        let soon = expiry_seconds_to_epoch(30).expect("expiry error");
        assert!(soon >= now - 1 && soon <= now + 1);
    }
}
